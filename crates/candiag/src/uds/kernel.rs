//! UDS client over a Linux kernel ISO-TP socket
//!
//! The kernel's `CAN_ISOTP` protocol owns segmentation, flow control and the
//! N_Bs/N_Cr timers, so requests bypass the frame bridge's transmit path. The
//! bridge still sees the raw frames of the conversation; they are discarded
//! before every request.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use socketcan::{ExtendedId, Id, StandardId};
use socketcan_isotp::IsoTpSocket;
use tracing::{debug, info};

use super::client::{classify, ClientFactory, Reply, UdsClient};
use super::UdsError;
use crate::bridge::FrameBridge;
use crate::isotp::{Addressing, IsoTpError};
use crate::session::TimeoutProfile;
use crate::transport::socketcan::is_device_gone;
use crate::transport::TransportError;

const READ_POLL: Duration = Duration::from_millis(1);
const ECOMM: i32 = 70;
const EILSEQ: i32 = 84;
const EMSGSIZE: i32 = 90;

/// Factory for [`KernelIsoTpClient`] on a fixed interface
#[derive(Debug, Clone)]
pub struct KernelIsoTpClientFactory {
    interface: String,
}

impl KernelIsoTpClientFactory {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

impl ClientFactory for KernelIsoTpClientFactory {
    fn create(
        &self,
        bridge: Arc<FrameBridge>,
        addressing: Addressing,
    ) -> Result<Arc<dyn UdsClient>, UdsError> {
        let client = KernelIsoTpClient::open(&self.interface, addressing, bridge)?;
        Ok(Arc::new(client))
    }
}

/// UDS client on a non-blocking kernel ISO-TP socket
pub struct KernelIsoTpClient {
    socket: Arc<Mutex<IsoTpSocket>>,
    bridge: Arc<FrameBridge>,
    profile: RwLock<TimeoutProfile>,
    closed: Arc<AtomicBool>,
    // Bumped per request; a reader from an abandoned request stops at the next poll
    generation: Arc<AtomicU64>,
}

impl KernelIsoTpClient {
    pub fn open(
        interface: &str,
        addressing: Addressing,
        bridge: Arc<FrameBridge>,
    ) -> Result<Self, UdsError> {
        let rx_id = can_id(addressing.rx_id, addressing.extended)?;
        let tx_id = can_id(addressing.tx_id, addressing.extended)?;

        let mut socket = IsoTpSocket::open(interface, rx_id, tx_id).map_err(|e| {
            TransportError::InvalidConfig(format!(
                "Failed to open ISO-TP socket on '{}': {}",
                interface, e
            ))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;
        drain(&mut socket);

        info!(
            interface,
            tx_id = format!("0x{:X}", addressing.tx_id),
            rx_id = format!("0x{:X}", addressing.rx_id),
            "Kernel ISO-TP socket opened"
        );

        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
            bridge,
            profile: RwLock::new(TimeoutProfile::default()),
            closed: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    fn ensure_open(&self) -> Result<(), UdsError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(UdsError::Closed)
        } else {
            Ok(())
        }
    }

    async fn write(&self, payload: &[u8]) -> Result<(), UdsError> {
        self.ensure_open()?;
        let socket = self.socket.clone();
        let payload = payload.to_vec();

        tokio::task::spawn_blocking(move || socket.lock().write(&payload).map_err(io_error))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    /// Next complete payload of request `generation`, or `Timeout` after `wait`
    async fn read(&self, generation: u64, wait: Duration) -> Result<Vec<u8>, UdsError> {
        let socket = self.socket.clone();
        let closed = self.closed.clone();
        let current = self.generation.clone();

        tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + wait;
            loop {
                if closed.load(Ordering::SeqCst) {
                    return Err(UdsError::Closed);
                }
                {
                    let mut socket = socket.lock();
                    if current.load(Ordering::SeqCst) != generation {
                        return Err(UdsError::Timeout);
                    }
                    match socket.read() {
                        Ok(data) if !data.is_empty() => return Ok(data.to_vec()),
                        Ok(_) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(io_error(e)),
                    }
                }
                if Instant::now() >= deadline {
                    return Err(UdsError::Timeout);
                }
                std::thread::sleep(READ_POLL);
            }
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl UdsClient for KernelIsoTpClient {
    fn apply_timeouts(&self, profile: &TimeoutProfile) {
        // Frame-level timers belong to the kernel socket
        *self.profile.write() = *profile;
    }

    fn timeouts(&self) -> TimeoutProfile {
        *self.profile.read()
    }

    async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let sid = *request
            .first()
            .ok_or_else(|| UdsError::InvalidResponse("Empty request".to_string()))?;
        let profile = self.timeouts();

        self.bridge.clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.write(request).await?;

        let mut wait = profile.p2;
        loop {
            let response = self.read(generation, wait).await?;
            match classify(sid, response)? {
                Reply::Final(response) => return Ok(response),
                Reply::Pending => wait = profile.p2_star,
                Reply::Unrelated => {}
            }
        }
    }

    async fn send_only(&self, request: &[u8]) -> Result<(), UdsError> {
        self.bridge.clear();
        self.write(request).await
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!("Kernel ISO-TP client closed");
        }
    }
}

/// Discard payloads left over from before the socket was ours
fn drain(socket: &mut IsoTpSocket) {
    while let Ok(data) = socket.read() {
        if data.is_empty() {
            break;
        }
        debug!(data = %hex::encode(data), "Drained stale ISO-TP payload");
    }
}

fn can_id(raw: u32, extended: bool) -> Result<Id, UdsError> {
    let id = if extended {
        ExtendedId::new(raw).map(Id::Extended)
    } else {
        u16::try_from(raw)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    };
    id.ok_or_else(|| {
        UdsError::Transport(TransportError::InvalidConfig(format!(
            "Invalid {} CAN ID: 0x{:X}",
            if extended { "extended" } else { "standard" },
            raw
        )))
    })
}

/// Socket errors in the same categories the user-space stack reports
fn io_error(e: io::Error) -> UdsError {
    if is_device_gone(&e) {
        return UdsError::Transport(TransportError::DeviceRemoved(e.to_string()));
    }
    match e.raw_os_error() {
        Some(ECOMM) => UdsError::Timeout,
        Some(EILSEQ) => UdsError::IsoTp(IsoTpError::UnexpectedFrame(e.to_string())),
        Some(EMSGSIZE) => UdsError::IsoTp(IsoTpError::Overflow),
        _ if e.kind() == io::ErrorKind::TimedOut => UdsError::Timeout,
        _ => UdsError::Transport(TransportError::SendFailed(e.to_string())),
    }
}
