//! Public error type of the diagnostic core

use serde::Serialize;
use thiserror::Error;

use crate::security::KeyError;
use crate::transport::TransportError;
use crate::uds::{Nrc, UdsError};

/// Broad error classes, used for recovery decisions and event reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Rejected at the API boundary, nothing was sent
    Precondition,
    /// The transport failed; the connection is gone
    Transport,
    /// No response within the active timeout profile
    Timeout,
    /// The ECU rejected the request
    Negative,
    /// A callback or key provider failed
    Callback,
    /// Malformed or unexpected traffic
    Protocol,
    Config,
}

#[derive(Debug, Error, Clone)]
pub enum DiagError {
    #[error("Not connected")]
    NotConnected,

    #[error("CAN transport is not connected")]
    TransportNotConnected,

    #[error("Security access sequence error: {0}")]
    SequenceError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Key calculation failed: {0}")]
    Key(#[from] KeyError),

    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected
            | Self::TransportNotConnected
            | Self::SequenceError(_)
            | Self::InvalidArgument(_) => ErrorKind::Precondition,
            Self::Uds(e) => match e {
                UdsError::NegativeResponse { .. } => ErrorKind::Negative,
                UdsError::Timeout => ErrorKind::Timeout,
                UdsError::Transport(_) | UdsError::Closed => ErrorKind::Transport,
                UdsError::IsoTp(_) | UdsError::InvalidResponse(_) => ErrorKind::Protocol,
            },
            Self::Transport(_) => ErrorKind::Transport,
            Self::Key(_) | Self::Callback(_) => ErrorKind::Callback,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Negative response code, if the ECU rejected the request
    pub fn nrc(&self) -> Option<Nrc> {
        match self {
            Self::Uds(UdsError::NegativeResponse { nrc, .. }) => Some(*nrc),
            _ => None,
        }
    }

    /// Whether the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(e) | Self::Uds(UdsError::Transport(e)) => e.is_fatal(),
            _ => false,
        }
    }
}
