//! ISO-TP endpoint over a [`FrameBridge`]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::codec::{self, FlowStatus, Pci, Reassembler, RxProgress, Segmenter};
use super::{Addressing, IsoTpError, IsoTpParams};
use crate::bridge::FrameBridge;
use crate::transport::CanFrame;

/// One tester-side ISO-TP endpoint
pub struct IsoTpEndpoint {
    bridge: Arc<FrameBridge>,
    addressing: Addressing,
    params: Mutex<IsoTpParams>,
}

impl IsoTpEndpoint {
    pub fn new(bridge: Arc<FrameBridge>, addressing: Addressing, params: IsoTpParams) -> Self {
        Self {
            bridge,
            addressing,
            params: Mutex::new(params),
        }
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn params(&self) -> IsoTpParams {
        *self.params.lock()
    }

    /// Override the frame-level N_Bs/N_Cr timeouts
    pub fn set_frame_timeouts(&self, n_bs: Duration, n_cr: Duration) {
        let mut params = self.params.lock();
        params.n_bs = n_bs;
        params.n_cr = n_cr;
    }

    /// Drop frames left over from an earlier exchange
    pub fn reset(&self) {
        self.bridge.clear();
    }

    pub fn close(&self) {
        self.bridge.shutdown();
    }

    async fn transmit(&self, data: Vec<u8>) -> Result<(), IsoTpError> {
        let frame = CanFrame::new(self.addressing.tx_id, data, self.addressing.extended);
        self.bridge.send(frame).await.map_err(IsoTpError::from)
    }

    async fn next_frame(&self, timeout: Duration, timer: &'static str) -> Result<CanFrame, IsoTpError> {
        match self.bridge.receive(timeout).await {
            Some(frame) => Ok(frame),
            None if self.bridge.is_shutdown() => Err(IsoTpError::Closed),
            None => Err(IsoTpError::Timeout { timer }),
        }
    }

    /// Segment and transmit one payload, honoring the receiver's flow control
    pub async fn send(&self, payload: &[u8]) -> Result<(), IsoTpError> {
        let params = self.params();
        let mut segmenter = Segmenter::new(payload, params.padding)?;
        self.transmit(segmenter.start()).await?;

        let mut waits = 0u8;
        while !segmenter.is_done() {
            let frame = self.next_frame(params.n_bs, "N_Bs").await?;
            let (block_size, st_min) = match codec::decode(&frame.data) {
                Ok(Pci::FlowControl {
                    status: FlowStatus::ContinueToSend,
                    block_size,
                    st_min,
                }) => (block_size, st_min),
                Ok(Pci::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                }) => {
                    waits += 1;
                    if waits > params.max_wait_frames {
                        return Err(IsoTpError::TooManyWaits);
                    }
                    trace!(waits, "Flow control WAIT");
                    continue;
                }
                Ok(Pci::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                }) => return Err(IsoTpError::Overflow),
                Ok(other) => {
                    debug!(pci = ?other, "Ignoring non flow control frame while sending");
                    continue;
                }
                Err(e) => return Err(e),
            };

            waits = 0;
            let mut sent = 0u16;
            while let Some(cf) = segmenter.next_consecutive() {
                self.transmit(cf).await?;
                sent += 1;
                if segmenter.is_done() || (block_size > 0 && sent >= block_size as u16) {
                    break;
                }
                if !st_min.is_zero() {
                    tokio::time::sleep(st_min).await;
                }
            }
        }
        Ok(())
    }

    /// Receive one complete payload; `timeout` bounds the wait for its first frame
    pub async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, IsoTpError> {
        let params = self.params();
        let mut reassembler = Reassembler::new(params.block_size);
        let mut wait = timeout;
        let mut timer = "Response";

        loop {
            let frame = self.next_frame(wait, timer).await?;
            if !reassembler.is_receiving() {
                // Late frames of an abandoned transfer can linger after a recycle
                match codec::decode(&frame.data) {
                    Ok(Pci::FlowControl { .. }) => {
                        trace!("Ignoring flow control frame while idle");
                        continue;
                    }
                    Ok(Pci::Consecutive { sn, .. }) => {
                        trace!(sn, "Ignoring consecutive frame while idle");
                        continue;
                    }
                    _ => {}
                }
            }
            match reassembler.on_frame(&frame.data)? {
                RxProgress::Complete(payload) => return Ok(payload),
                RxProgress::FlowControlRequired | RxProgress::BlockComplete => {
                    self.transmit(codec::flow_control(
                        FlowStatus::ContinueToSend,
                        params.block_size,
                        params.st_min,
                        params.padding,
                    ))
                    .await?;
                }
                RxProgress::InProgress => {}
            }
            wait = params.n_cr;
            timer = "N_Cr";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockCanBus;
    use crate::transport::CanTransport;
    use tokio::sync::broadcast;

    fn endpoint() -> (Arc<MockCanBus>, Arc<FrameBridge>, IsoTpEndpoint) {
        let bus = Arc::new(MockCanBus::new(&MockConfig::silent()));
        let (tx, _) = broadcast::channel(64);
        let bridge = Arc::new(FrameBridge::new(bus.clone(), 64, tx));
        let endpoint = IsoTpEndpoint::new(bridge.clone(), Addressing::default(), IsoTpParams::default());
        (bus, bridge, endpoint)
    }

    #[tokio::test]
    async fn test_single_frame_send() {
        let (bus, _bridge, endpoint) = endpoint();
        endpoint.send(&[0x10, 0x03]).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x7E0);
        assert_eq!(sent[0].data, vec![0x02, 0x10, 0x03, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
    }

    #[tokio::test]
    async fn test_recv_skips_stray_consecutive_frame() {
        let (_bus, bridge, endpoint) = endpoint();
        bridge.push_inbound(CanFrame::new(0x7E8, vec![0x21, 0x01, 0x02, 0x03], false));
        bridge.push_inbound(CanFrame::new(0x7E8, vec![0x02, 0x50, 0x03], false));

        let payload = endpoint.recv(Duration::from_millis(200)).await.unwrap();
        assert_eq!(payload, vec![0x50, 0x03]);
    }

    #[tokio::test]
    async fn test_multi_frame_send_waits_for_flow_control() {
        let (bus, bridge, endpoint) = endpoint();
        let payload: Vec<u8> = (0..12).collect();

        let feeder = bridge.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            feeder.push_inbound(CanFrame::new(
                0x7E8,
                codec::flow_control(FlowStatus::ContinueToSend, 0, Duration::ZERO, None),
                false,
            ));
        });

        endpoint.send(&payload).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[0], 0x10);
        assert_eq!(sent[1].data[0], 0x21);
    }

    #[tokio::test]
    async fn test_send_without_flow_control_times_out() {
        let (_bus, _bridge, endpoint) = endpoint();
        endpoint.set_frame_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        let payload: Vec<u8> = (0..12).collect();
        let err = endpoint.send(&payload).await.unwrap_err();
        assert!(matches!(err, IsoTpError::Timeout { timer: "N_Bs" }));
    }

    #[tokio::test]
    async fn test_recv_multi_frame_sends_flow_control() {
        let (bus, bridge, endpoint) = endpoint();
        let payload: Vec<u8> = (0..10).collect();
        let mut segmenter = Segmenter::new(&payload, Some(0xCC)).unwrap();
        bridge.push_inbound(CanFrame::new(0x7E8, segmenter.start(), false));
        while let Some(cf) = segmenter.next_consecutive() {
            bridge.push_inbound(CanFrame::new(0x7E8, cf, false));
        }

        let received = endpoint.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(received, payload);

        let fc = &bus.sent_frames()[0];
        assert_eq!(fc.data[0], 0x30);
        assert_eq!(fc.data[2], 10);
    }

    #[tokio::test]
    async fn test_recv_reports_closed_after_shutdown() {
        let (bus, bridge, endpoint) = endpoint();
        assert!(bus.is_connected());
        bridge.shutdown();
        let err = endpoint.recv(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, IsoTpError::Closed));
    }
}
