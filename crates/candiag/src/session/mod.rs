//! Diagnostic session and security access state
//!
//! Both states are immutable snapshots; the orchestrator swaps whole values so
//! readers never observe a half-applied update.

mod timeouts;

pub use timeouts::{SessionTimeouts, TimeoutProfile};

use std::fmt;

use serde::{Deserialize, Serialize};

/// UDS diagnostic session type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum SessionType {
    /// Default session (0x01)
    Default,
    /// Programming session (0x02)
    Programming,
    /// Extended diagnostic session (0x03)
    Extended,
    /// End of line session (0x40)
    EndOfLine,
    /// Any other, vehicle-manufacturer or supplier specific session
    Vendor(u8),
}

impl SessionType {
    pub fn code(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
            Self::EndOfLine => 0x40,
            Self::Vendor(code) => code,
        }
    }

    pub fn name(self) -> String {
        match self {
            Self::Default => "Default Session".to_string(),
            Self::Programming => "Programming Session".to_string(),
            Self::Extended => "Extended Diagnostic Session".to_string(),
            Self::EndOfLine => "End of Line Session".to_string(),
            Self::Vendor(code) => format!("Vendor Session 0x{:02X}", code),
        }
    }
}

impl Default for SessionType {
    fn default() -> Self {
        Self::Default
    }
}

impl From<u8> for SessionType {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::Default,
            0x02 => Self::Programming,
            0x03 => Self::Extended,
            0x40 => Self::EndOfLine,
            other => Self::Vendor(other),
        }
    }
}

impl From<SessionType> for u8 {
    fn from(session: SessionType) -> Self {
        session.code()
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Active diagnostic session of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_type: SessionType,
    pub name: String,
    /// False while disconnected
    pub active: bool,
}

impl SessionSnapshot {
    pub fn new(session_type: SessionType, active: bool) -> Self {
        Self {
            session_type,
            name: session_type.name(),
            active,
        }
    }

    /// Default session of a closed connection
    pub fn inactive() -> Self {
        Self::new(SessionType::Default, false)
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::inactive()
    }
}

/// Security access state of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecuritySnapshot {
    /// Seed sub-function of the level being unlocked or unlocked (0 = none)
    pub level: u8,
    /// Last seed received, empty when the ECU reported the level as unlocked
    #[serde(with = "hex_bytes")]
    pub seed: Vec<u8>,
    /// Last key sent
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    /// Set only after a positive key response
    pub unlocked: bool,
    /// A seed is on record and has not yet been consumed by a key response
    pub seed_pending: bool,
}

impl SecuritySnapshot {
    pub fn locked() -> Self {
        Self::default()
    }

    /// State after a seed response for `level`
    pub fn with_seed(level: u8, seed: Vec<u8>) -> Self {
        Self {
            level,
            seed,
            key: Vec::new(),
            unlocked: false,
            seed_pending: true,
        }
    }

    /// State after an all-zero seed for `level`
    ///
    /// A level already confirmed unlocked stays unlocked; otherwise the level
    /// is recorded without a seed and unlock is not asserted.
    pub fn with_zero_seed(&self, level: u8) -> Self {
        if self.unlocked && self.level == level {
            self.clone()
        } else {
            Self::with_seed(level, Vec::new())
        }
    }

    /// Whether a key for `key_level` may be sent
    pub fn accepts_key_for(&self, key_level: u8) -> bool {
        self.seed_pending && self.level != 0 && self.level.checked_add(1) == Some(key_level)
    }

    /// State after the ECU answered a key for this seed
    pub fn key_answered(&self, key: Vec<u8>, accepted: bool) -> Self {
        Self {
            level: if accepted { self.level } else { 0 },
            seed: self.seed.clone(),
            key,
            unlocked: accepted,
            seed_pending: false,
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }
}
