//! Security access key calculation
//!
//! The seed/key exchange itself is driven by the orchestrator; this module only
//! defines how a key is derived from a seed. No manufacturer algorithms live
//! here: the built-ins are simple reversible transforms for test benches, and
//! [`ExternalKeyProvider`] wraps whatever black-box function a vendor supplies.

mod providers;

pub use providers::{AddKey, ComplementKey, Crc16Key, ExternalKeyProvider, XorKey};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key calculation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Empty seed")]
    EmptySeed,

    #[error("Unsupported security level 0x{0:02X}")]
    UnsupportedLevel(u8),

    #[error("Key provider failed: {0}")]
    Provider(String),
}

/// Derives a security access key from a seed
///
/// `level` is the seed sub-function (odd) the seed was requested with.
pub trait KeyProvider: Send + Sync {
    fn calculate(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, KeyError>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Built-in algorithm selection, as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// XOR with a 16-bit constant, high byte on even positions
    Xor { constant: u16 },
    /// Wrapping add of a 16-bit constant per big-endian word
    Add { constant: u16 },
    /// Bitwise complement
    Complement,
    /// CRC-16/CCITT-FALSE over level and seed
    Crc16,
}

impl KeyAlgorithm {
    pub fn provider(self) -> Arc<dyn KeyProvider> {
        match self {
            Self::Xor { constant } => Arc::new(XorKey(constant)),
            Self::Add { constant } => Arc::new(AddKey(constant)),
            Self::Complement => Arc::new(ComplementKey),
            Self::Crc16 => Arc::new(Crc16Key),
        }
    }
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::Xor { constant: 0x1234 }
    }
}
