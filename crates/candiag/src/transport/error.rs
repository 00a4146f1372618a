//! Raw CAN transport errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether the error invalidates the current connection (device gone or the
    /// write path is broken).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::DeviceRemoved(_) | Self::SendFailed(_)
        )
    }
}
