//! DTC records returned by ReadDTCInformation (0x19)

use std::fmt;

use serde::{Serialize, Serializer};

/// ReadDTCInformation (0x19) sub-functions
pub mod sub_function {
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
    pub const REPORT_SUPPORTED_DTC: u8 = 0x0A;
    pub const REPORT_FIRST_TEST_FAILED_DTC: u8 = 0x0B;
    pub const REPORT_FIRST_CONFIRMED_DTC: u8 = 0x0C;
    pub const REPORT_MOST_RECENT_TEST_FAILED_DTC: u8 = 0x0D;
    pub const REPORT_MOST_RECENT_CONFIRMED_DTC: u8 = 0x0E;
    pub const REPORT_MIRROR_MEMORY_DTC_BY_STATUS_MASK: u8 = 0x0F;
    pub const REPORT_EMISSIONS_RELATED_DTC_BY_STATUS_MASK: u8 = 0x13;
    pub const REPORT_DTC_WITH_PERMANENT_STATUS: u8 = 0x15;

    /// Sub-functions whose request carries a status mask byte
    pub fn takes_status_mask(sf: u8) -> bool {
        matches!(
            sf,
            REPORT_NUMBER_OF_DTC_BY_STATUS_MASK
                | REPORT_DTC_BY_STATUS_MASK
                | REPORT_MIRROR_MEMORY_DTC_BY_STATUS_MASK
                | REPORT_EMISSIONS_RELATED_DTC_BY_STATUS_MASK
        )
    }

    /// Sub-functions answered with `availability mask + (DTC, status)*`
    pub fn returns_records(sf: u8) -> bool {
        matches!(
            sf,
            REPORT_DTC_BY_STATUS_MASK
                | REPORT_SUPPORTED_DTC
                | REPORT_FIRST_TEST_FAILED_DTC
                | REPORT_FIRST_CONFIRMED_DTC
                | REPORT_MOST_RECENT_TEST_FAILED_DTC
                | REPORT_MOST_RECENT_CONFIRMED_DTC
                | REPORT_MIRROR_MEMORY_DTC_BY_STATUS_MASK
                | REPORT_EMISSIONS_RELATED_DTC_BY_STATUS_MASK
                | REPORT_DTC_WITH_PERMANENT_STATUS
        )
    }
}

/// ClearDiagnosticInformation (0x14) group addresses
pub mod dtc_group {
    pub const ALL: u32 = 0xFFFFFF;
    pub const POWERTRAIN: u32 = 0x000000;
    pub const CHASSIS: u32 = 0x400000;
    pub const BODY: u32 = 0x800000;
    pub const NETWORK: u32 = 0xC00000;
}

/// System category selected by the top two bits of the first DTC byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    pub fn from_high_byte(byte: u8) -> Self {
        match byte >> 6 {
            0 => Self::Powertrain,
            1 => Self::Chassis,
            2 => Self::Body,
            _ => Self::Network,
        }
    }

    pub fn prefix(self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }
}

/// Status bits in ISO 14229-1 order
const STATUS_FLAGS: [(u8, &str); 8] = [
    (0x01, "TestFailed"),
    (0x02, "TestFailedThisOperationCycle"),
    (0x04, "PendingDTC"),
    (0x08, "ConfirmedDTC"),
    (0x10, "TestNotCompletedSinceLastClear"),
    (0x20, "TestFailedSinceLastClear"),
    (0x40, "TestNotCompletedThisOperationCycle"),
    (0x80, "WarningIndicatorRequested"),
];

/// DTC status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcStatus(pub u8);

impl DtcStatus {
    pub const TEST_FAILED: u8 = 0x01;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    /// Names of the set bits, lowest bit first
    pub fn flags(self) -> Vec<&'static str> {
        STATUS_FLAGS
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    /// Test failed and confirmed
    pub fn is_active(self) -> bool {
        self.contains(Self::TEST_FAILED | Self::CONFIRMED_DTC)
    }
}

impl Serialize for DtcStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("DtcStatus", 2)?;
        s.serialize_field("raw", &self.0)?;
        s.serialize_field("flags", &self.flags())?;
        s.end()
    }
}

impl fmt::Display for DtcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags();
        if flags.is_empty() {
            write!(f, "0x{:02X}", self.0)
        } else {
            write!(f, "0x{:02X} [{}]", self.0, flags.join(", "))
        }
    }
}

/// One decoded DTC record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dtc {
    /// Hex identifier of the three DTC bytes, e.g. `010301`
    pub id: String,
    /// Display code of the first two bytes, e.g. `P0103`
    pub code: String,
    /// Third DTC byte (failure type byte)
    pub failure_type: u8,
    pub category: DtcCategory,
    pub status: DtcStatus,
}

impl Dtc {
    pub fn new(bytes: [u8; 3], status: u8) -> Self {
        let category = DtcCategory::from_high_byte(bytes[0]);
        let code = format!(
            "{}{:X}{:X}{:02X}",
            category.prefix(),
            (bytes[0] >> 4) & 0x03,
            bytes[0] & 0x0F,
            bytes[1]
        );
        Self {
            id: hex::encode_upper(bytes),
            code,
            failure_type: bytes[2],
            category,
            status: DtcStatus(status),
        }
    }

    /// 24-bit DTC number
    pub fn number(&self) -> u32 {
        u32::from_str_radix(&self.id, 16).unwrap_or_default()
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02X} ({:?}) status {}",
            self.code, self.failure_type, self.category, self.status
        )
    }
}

/// Result of reportNumberOfDTCByStatusMask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DtcCount {
    pub status_availability_mask: u8,
    pub format_identifier: u8,
    pub count: u16,
}
