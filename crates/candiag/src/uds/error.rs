//! UDS client errors

use thiserror::Error;

use super::Nrc;
use crate::isotp::IsoTpError;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone)]
pub enum UdsError {
    #[error("Negative response: {nrc} for service 0x{service_id:02X}")]
    NegativeResponse { service_id: u8, nrc: Nrc },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Response timeout")]
    Timeout,

    #[error("ISO-TP error: {0}")]
    IsoTp(IsoTpError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Client closed")]
    Closed,
}

impl From<IsoTpError> for UdsError {
    fn from(e: IsoTpError) -> Self {
        match e {
            IsoTpError::Timeout { .. } => Self::Timeout,
            IsoTpError::Transport(t) => Self::Transport(t),
            IsoTpError::Closed => Self::Closed,
            other => Self::IsoTp(other),
        }
    }
}

impl From<TransportError> for UdsError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
