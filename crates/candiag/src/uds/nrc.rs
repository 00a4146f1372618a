//! UDS negative response codes

use std::fmt;

use serde::{Deserialize, Serialize};

/// A negative response code as sent by the ECU
///
/// Kept as a raw byte so manufacturer-specific codes survive unchanged; the
/// well-known ones have associated constants and names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nrc(pub u8);

impl Nrc {
    pub const GENERAL_REJECT: Nrc = Nrc(0x10);
    pub const SERVICE_NOT_SUPPORTED: Nrc = Nrc(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Nrc = Nrc(0x12);
    pub const INCORRECT_MESSAGE_LENGTH: Nrc = Nrc(0x13);
    pub const BUSY_REPEAT_REQUEST: Nrc = Nrc(0x21);
    pub const CONDITIONS_NOT_CORRECT: Nrc = Nrc(0x22);
    pub const REQUEST_SEQUENCE_ERROR: Nrc = Nrc(0x24);
    pub const REQUEST_OUT_OF_RANGE: Nrc = Nrc(0x31);
    pub const SECURITY_ACCESS_DENIED: Nrc = Nrc(0x33);
    pub const INVALID_KEY: Nrc = Nrc(0x35);
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: Nrc = Nrc(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Nrc = Nrc(0x37);
    pub const GENERAL_PROGRAMMING_FAILURE: Nrc = Nrc(0x72);
    pub const RESPONSE_PENDING: Nrc = Nrc(0x78);
    pub const SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: Nrc = Nrc(0x7E);
    pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: Nrc = Nrc(0x7F);

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_response_pending(self) -> bool {
        self == Self::RESPONSE_PENDING
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0x10 => "General reject",
            0x11 => "Service not supported",
            0x12 => "Sub-function not supported",
            0x13 => "Incorrect message length or invalid format",
            0x14 => "Response too long",
            0x21 => "Busy, repeat request",
            0x22 => "Conditions not correct",
            0x24 => "Request sequence error",
            0x25 => "No response from subnet component",
            0x26 => "Failure prevents execution of requested action",
            0x31 => "Request out of range",
            0x33 => "Security access denied",
            0x35 => "Invalid key",
            0x36 => "Exceeded number of attempts",
            0x37 => "Required time delay not expired",
            0x70 => "Upload/download not accepted",
            0x71 => "Transfer data suspended",
            0x72 => "General programming failure",
            0x73 => "Wrong block sequence counter",
            0x78 => "Request correctly received, response pending",
            0x7E => "Sub-function not supported in active session",
            0x7F => "Service not supported in active session",
            0x81..=0x8F => "Vehicle condition not correct",
            0x90..=0xFE => "Manufacturer specific condition",
            _ => "Reserved",
        }
    }
}

impl From<u8> for Nrc {
    fn from(value: u8) -> Self {
        Nrc(value)
    }
}

impl fmt::Display for Nrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_code_display() {
        assert_eq!(
            Nrc::INVALID_KEY.to_string(),
            "Invalid key (0x35)"
        );
    }

    #[test]
    fn test_unknown_code_preserved() {
        let nrc = Nrc::from(0xF3);
        assert_eq!(nrc.code(), 0xF3);
        assert_eq!(nrc.name(), "Manufacturer specific condition");
        assert!(!nrc.is_response_pending());
        assert!(Nrc::from(0x78).is_response_pending());
    }
}
