//! Frame bridge between a raw CAN transport and the ISO-TP endpoint
//!
//! The bridge does not own the transport. Outbound frames are written straight
//! through and mirrored to an observation channel; inbound frames are pushed
//! by the connection's listener task into a bounded queue that the endpoint
//! pulls from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::transport::{CanFrame, CanTransport, TransportError};

/// Default capacity of the inbound frame queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Channel tag attached to mirrored diagnostic traffic
pub const DIAGNOSTIC_CHANNEL: &str = "diagnostic";

/// A transmitted frame mirrored for passive bus logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub extended: bool,
    pub fd: bool,
    pub timestamp: DateTime<Utc>,
    pub channel: &'static str,
}

impl From<&CanFrame> for ObservedFrame {
    fn from(frame: &CanFrame) -> Self {
        Self {
            id: frame.id,
            data: frame.data.clone(),
            extended: frame.extended,
            fd: frame.fd,
            timestamp: frame.timestamp,
            channel: DIAGNOSTIC_CHANNEL,
        }
    }
}

/// Push/pull frame queue over a connected transport
pub struct FrameBridge {
    transport: Arc<dyn CanTransport>,
    inbound: Mutex<VecDeque<CanFrame>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    observed_tx: broadcast::Sender<ObservedFrame>,
}

impl FrameBridge {
    pub fn new(
        transport: Arc<dyn CanTransport>,
        capacity: usize,
        observed_tx: broadcast::Sender<ObservedFrame>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            transport,
            inbound: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            observed_tx,
        }
    }

    /// Write a frame to the transport and mirror it on success
    pub async fn send(&self, frame: CanFrame) -> Result<(), TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::NotConnected);
        }
        self.transport.send(&frame).await?;
        // Nobody listening is fine
        let _ = self.observed_tx.send(ObservedFrame::from(&frame));
        Ok(())
    }

    /// Queue an inbound frame, dropping the oldest one when full
    pub fn push_inbound(&self, frame: CanFrame) {
        if self.is_shutdown() {
            return;
        }
        {
            let mut queue = self.inbound.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = self.capacity,
                    dropped, "Frame bridge queue full, dropping oldest frame"
                );
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Next inbound frame, or `None` after `timeout` or once shut down
    pub async fn receive(&self, timeout: Duration) -> Option<CanFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(frame) = self.inbound.lock().pop_front() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Discard everything queued so far without shutting down
    pub fn clear(&self) {
        self.inbound.lock().clear();
    }

    /// Discard queued frames and wake any waiting receiver. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let discarded = {
            let mut queue = self.inbound.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        debug!(discarded, "Frame bridge shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames dropped because the inbound queue overflowed
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.inbound.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockCanBus;

    fn bridge(capacity: usize) -> (Arc<MockCanBus>, FrameBridge, broadcast::Receiver<ObservedFrame>) {
        let bus = Arc::new(MockCanBus::new(&MockConfig::silent()));
        let (tx, rx) = broadcast::channel(16);
        let bridge = FrameBridge::new(bus.clone(), capacity, tx);
        (bus, bridge, rx)
    }

    #[tokio::test]
    async fn test_send_mirrors_frame() {
        let (bus, bridge, mut observed) = bridge(4);
        bridge
            .send(CanFrame::new(0x7E0, vec![0x02, 0x3E, 0x00], false))
            .await
            .unwrap();

        let frame = observed.try_recv().unwrap();
        assert_eq!(frame.id, 0x7E0);
        assert_eq!(frame.data, vec![0x02, 0x3E, 0x00]);
        assert_eq!(frame.channel, DIAGNOSTIC_CHANNEL);
        assert_eq!(bus.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_is_not_mirrored() {
        let (bus, bridge, mut observed) = bridge(4);
        bus.set_connected(false);
        let result = bridge
            .send(CanFrame::new(0x7E0, vec![0x02, 0x3E, 0x00], false))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(observed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (_bus, bridge, _observed) = bridge(4);
        assert!(bridge.receive(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (_bus, bridge, _observed) = bridge(2);
        for i in 0..3u8 {
            bridge.push_inbound(CanFrame::new(0x7E8, vec![i], false));
        }
        assert_eq!(bridge.dropped_frames(), 1);
        let first = bridge.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.data, vec![1]);
        let second = bridge.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.data, vec![2]);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_push() {
        let (_bus, bridge, _observed) = bridge(4);
        let bridge = Arc::new(bridge);
        let pusher = bridge.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.push_inbound(CanFrame::new(0x7E8, vec![0xAA], false));
        });
        let frame = bridge.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.data, vec![0xAA]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (_bus, bridge, _observed) = bridge(4);
        bridge.push_inbound(CanFrame::new(0x7E8, vec![0x01], false));
        bridge.shutdown();
        bridge.shutdown();
        assert_eq!(bridge.queued(), 0);
        assert!(bridge.receive(Duration::from_millis(10)).await.is_none());
        bridge.push_inbound(CanFrame::new(0x7E8, vec![0x02], false));
        assert_eq!(bridge.queued(), 0);
    }
}
