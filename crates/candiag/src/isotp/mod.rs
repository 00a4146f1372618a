//! ISO-TP (ISO 15765-2) segmentation over the frame bridge
//!
//! [`codec`] holds the pure frame encoding; [`IsoTpEndpoint`] drives one
//! half-duplex conversation with flow control and N_Bs/N_Cr supervision.

pub mod codec;
mod endpoint;

pub use endpoint::IsoTpEndpoint;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// ISO-TP layer errors
#[derive(Debug, Error, Clone)]
pub enum IsoTpError {
    #[error("{timer} timeout")]
    Timeout { timer: &'static str },

    #[error("Receiver reported flow control overflow")]
    Overflow,

    #[error("Too many flow control WAIT frames")]
    TooManyWaits,

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u8, got: u8 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Payload of {0} bytes exceeds the ISO-TP limit")]
    PayloadTooLarge(usize),

    #[error("Endpoint closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl IsoTpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// CAN identifiers of one diagnostic conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    /// Identifier the tester transmits on
    pub tx_id: u32,
    /// Identifier the ECU answers on
    pub rx_id: u32,
    /// 29-bit identifiers
    #[serde(default)]
    pub extended: bool,
}

impl Addressing {
    pub fn new(tx_id: u32, rx_id: u32) -> Self {
        Self {
            tx_id,
            rx_id,
            extended: false,
        }
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }
}

impl Default for Addressing {
    fn default() -> Self {
        Self::new(0x7E0, 0x7E8)
    }
}

/// Frame-level tuning of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpParams {
    /// Block size advertised in our flow control frames (0 = unlimited)
    pub block_size: u8,
    /// Separation time advertised in our flow control frames
    pub st_min: Duration,
    /// Padding byte for short frames, `None` for DLC-exact frames
    pub padding: Option<u8>,
    /// Time to wait for a flow control frame after a first/block-ending frame
    pub n_bs: Duration,
    /// Time to wait between consecutive frames while receiving
    pub n_cr: Duration,
    /// Flow control WAIT frames accepted before giving up
    pub max_wait_frames: u8,
}

impl Default for IsoTpParams {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: Duration::from_millis(10),
            padding: Some(0xCC),
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            max_wait_frames: 10,
        }
    }
}
