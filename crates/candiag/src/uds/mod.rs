//! UDS (ISO 14229) request/response layer
//!
//! [`UdsClient`] is the seam the orchestrator drives. [`IsoTpUdsClient`] runs
//! over an [`IsoTpEndpoint`](crate::isotp::IsoTpEndpoint) fed by the frame
//! bridge; with the `socketcan` feature, `KernelIsoTpClient` delegates
//! segmentation to the Linux `CAN_ISOTP` socket instead.
//! Response decoding lives in [`normalize`] and [`dtc`] as pure functions.

mod client;
pub mod dtc;
mod error;
mod nrc;
pub mod normalize;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod kernel;

pub use client::{ClientFactory, IsoTpClientFactory, IsoTpUdsClient, UdsClient};
pub use dtc::{Dtc, DtcCategory, DtcCount, DtcStatus};
pub use error::UdsError;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use kernel::{KernelIsoTpClient, KernelIsoTpClientFactory};
pub use nrc::Nrc;

/// Service identifiers used by the diagnostic core
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
    pub const READ_DTC_INFORMATION: u8 = 0x19;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Offset added to a request SID in its positive response
    pub const POSITIVE_OFFSET: u8 = 0x40;

    /// Human readable service name for logs and events
    pub fn name(sid: u8) -> &'static str {
        match sid {
            DIAGNOSTIC_SESSION_CONTROL => "DiagnosticSessionControl",
            ECU_RESET => "ECUReset",
            CLEAR_DIAGNOSTIC_INFORMATION => "ClearDiagnosticInformation",
            READ_DTC_INFORMATION => "ReadDTCInformation",
            READ_DATA_BY_IDENTIFIER => "ReadDataByIdentifier",
            SECURITY_ACCESS => "SecurityAccess",
            WRITE_DATA_BY_IDENTIFIER => "WriteDataByIdentifier",
            TESTER_PRESENT => "TesterPresent",
            _ => "Raw",
        }
    }
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Key off/on reset - simulate ignition cycle
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// TesterPresent (0x3E) sub-functions
pub mod tester_present {
    pub const ZERO_SUB_FUNCTION: u8 = 0x00;
    /// Suppress positive response bit
    pub const SUPPRESS_RESPONSE: u8 = 0x80;
}

/// Well-known data identifiers
pub mod standard_did {
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    pub const ECU_SOFTWARE_VERSION: u16 = 0xF189;
    pub const VIN: u16 = 0xF190;
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
}
