//! Raw CAN socket transport
//!
//! Frames are read on a blocking thread and fanned out over a broadcast
//! channel. The socket is a plain `CAN_RAW` socket; when the kernel does
//! ISO-TP, its socket lives in the UDS client instead (`uds::KernelIsoTpClient`).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{
    CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SocketCanConfig;
use crate::transport::{CanFrame, CanTransport, TransportError};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;
const ENXIO: i32 = 6;

/// SocketCAN raw socket transport
pub struct SocketCanTransport {
    interface: String,
    socket: Arc<CanSocket>,
    connected: Arc<AtomicBool>,
    incoming_tx: broadcast::Sender<CanFrame>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanTransport {
    /// Open the configured interface and start the receive thread
    pub fn open(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::InvalidConfig(format!(
                "Failed to open CAN interface '{}': {}",
                config.interface, e
            ))
        })?;
        socket.set_read_timeout(READ_TIMEOUT).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set read timeout: {}", e))
        })?;

        let (incoming_tx, _) = broadcast::channel(config.receive_buffer);

        let transport = Self {
            interface: config.interface.clone(),
            socket: Arc::new(socket),
            connected: Arc::new(AtomicBool::new(true)),
            incoming_tx,
            listener_handle: Mutex::new(None),
        };
        transport.start_listener();

        info!(interface = %transport.interface, "SocketCAN transport opened");
        Ok(transport)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let connected = self.connected.clone();
        let incoming_tx = self.incoming_tx.clone();
        let interface = self.interface.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while connected.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(frame) => {
                        if let Some(frame) = from_raw(&frame) {
                            // No receivers is fine
                            let _ = incoming_tx.send(frame);
                        }
                    }
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        if is_device_gone(&e) {
                            error!(interface = %interface, error = %e, "CAN device removed");
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        warn!(interface = %interface, error = %e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!(interface = %interface, "SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

#[async_trait]
impl CanTransport for SocketCanTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let raw = to_raw(frame)?;
        let socket = self.socket.clone();
        let connected = self.connected.clone();

        tokio::task::spawn_blocking(move || {
            socket.write_frame(&raw).map_err(|e| {
                if is_device_gone(&e) {
                    connected.store(false, Ordering::SeqCst);
                    TransportError::DeviceRemoved(e.to_string())
                } else {
                    TransportError::SendFailed(e.to_string())
                }
            })
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn is_device_gone(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(ENODEV) | Some(ENETDOWN) | Some(ENXIO))
}

fn to_raw(frame: &CanFrame) -> Result<RawFrame, TransportError> {
    let id: Id = if frame.extended {
        ExtendedId::new(frame.id)
            .map(Id::Extended)
            .ok_or_else(|| TransportError::InvalidFrame(format!("Invalid extended ID 0x{:X}", frame.id)))?
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
            .ok_or_else(|| TransportError::InvalidFrame(format!("Invalid standard ID 0x{:X}", frame.id)))?
    };
    RawFrame::new(id, &frame.data).ok_or_else(|| {
        TransportError::InvalidFrame(format!("Payload of {} bytes does not fit", frame.data.len()))
    })
}

fn from_raw(frame: &RawFrame) -> Option<CanFrame> {
    if !matches!(frame, RawFrame::Data(_)) {
        return None;
    }
    let (id, extended) = match EmbeddedFrame::id(frame) {
        Id::Standard(id) => (id.as_raw() as u32, false),
        Id::Extended(id) => (id.as_raw(), true),
    };
    Some(CanFrame::new(id, EmbeddedFrame::data(frame), extended))
}
