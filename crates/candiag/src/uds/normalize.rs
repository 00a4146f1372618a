//! Pure response normalizers
//!
//! Each function takes the raw positive response (SID included) and strips
//! the echoed service id, sub-function and identifier bytes, checking that
//! the echo matches what was requested.

use std::time::Duration;

use serde::Serialize;

use super::dtc::{sub_function, Dtc, DtcCount};
use super::{service_id, UdsError};

fn invalid(msg: impl Into<String>) -> UdsError {
    UdsError::InvalidResponse(msg.into())
}

fn expect_sid(response: &[u8], request_sid: u8, min_len: usize) -> Result<(), UdsError> {
    let expected = request_sid.wrapping_add(service_id::POSITIVE_OFFSET);
    match response.first() {
        Some(&sid) if sid == expected => {}
        Some(&sid) => {
            return Err(invalid(format!(
                "Expected SID 0x{:02X}, got 0x{:02X}",
                expected, sid
            )))
        }
        None => return Err(invalid("Empty response")),
    }
    if response.len() < min_len {
        return Err(invalid(format!(
            "{} response too short: {} bytes",
            service_id::name(request_sid),
            response.len()
        )));
    }
    Ok(())
}

/// Decoded DiagnosticSessionControl response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionResponse {
    pub session_type: u8,
    /// P2 server max reported by the ECU
    pub p2: Option<Duration>,
    /// P2* server max reported by the ECU
    pub p2_star: Option<Duration>,
}

pub fn session_control(response: &[u8], requested: u8) -> Result<SessionResponse, UdsError> {
    expect_sid(response, service_id::DIAGNOSTIC_SESSION_CONTROL, 2)?;
    let session_type = response[1] & 0x7F;
    if session_type != requested & 0x7F {
        return Err(invalid(format!(
            "Session echo 0x{:02X} does not match request 0x{:02X}",
            session_type, requested
        )));
    }
    let (p2, p2_star) = if response.len() >= 6 {
        let p2 = u16::from_be_bytes([response[2], response[3]]) as u64;
        let p2_star = u16::from_be_bytes([response[4], response[5]]) as u64 * 10;
        (
            Some(Duration::from_millis(p2)),
            Some(Duration::from_millis(p2_star)),
        )
    } else {
        (None, None)
    };
    Ok(SessionResponse {
        session_type,
        p2,
        p2_star,
    })
}

/// Seed bytes from a requestSeed response
pub fn security_seed(response: &[u8], level: u8) -> Result<Vec<u8>, UdsError> {
    expect_sid(response, service_id::SECURITY_ACCESS, 2)?;
    if response[1] != level {
        return Err(invalid(format!(
            "Seed response for level 0x{:02X}, requested 0x{:02X}",
            response[1], level
        )));
    }
    Ok(response[2..].to_vec())
}

/// Check a sendKey response
pub fn security_key(response: &[u8], level: u8) -> Result<(), UdsError> {
    expect_sid(response, service_id::SECURITY_ACCESS, 2)?;
    if response[1] != level {
        return Err(invalid(format!(
            "Key response for level 0x{:02X}, sent 0x{:02X}",
            response[1], level
        )));
    }
    Ok(())
}

/// Record data from a ReadDataByIdentifier response
pub fn read_data_by_identifier(response: &[u8], did: u16) -> Result<Vec<u8>, UdsError> {
    expect_sid(response, service_id::READ_DATA_BY_IDENTIFIER, 3)?;
    let echoed = u16::from_be_bytes([response[1], response[2]]);
    if echoed != did {
        return Err(invalid(format!(
            "DID echo 0x{:04X} does not match request 0x{:04X}",
            echoed, did
        )));
    }
    Ok(response[3..].to_vec())
}

pub fn write_data_by_identifier(response: &[u8], did: u16) -> Result<(), UdsError> {
    expect_sid(response, service_id::WRITE_DATA_BY_IDENTIFIER, 3)?;
    let echoed = u16::from_be_bytes([response[1], response[2]]);
    if echoed != did {
        return Err(invalid(format!(
            "DID echo 0x{:04X} does not match request 0x{:04X}",
            echoed, did
        )));
    }
    Ok(())
}

/// DTC records from a ReadDTCInformation response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcReport {
    pub sub_function: u8,
    pub status_availability_mask: u8,
    pub dtcs: Vec<Dtc>,
}

pub fn dtc_records(response: &[u8]) -> Result<DtcReport, UdsError> {
    expect_sid(response, service_id::READ_DTC_INFORMATION, 3)?;
    let sf = response[1];
    if !sub_function::returns_records(sf) {
        return Err(invalid(format!(
            "Sub-function 0x{:02X} does not report DTC records",
            sf
        )));
    }
    let records = &response[3..];
    if records.len() % 4 != 0 {
        return Err(invalid(format!(
            "DTC record area of {} bytes is not a multiple of 4",
            records.len()
        )));
    }
    let dtcs = records
        .chunks_exact(4)
        .map(|r| Dtc::new([r[0], r[1], r[2]], r[3]))
        .collect();
    Ok(DtcReport {
        sub_function: sf,
        status_availability_mask: response[2],
        dtcs,
    })
}

pub fn dtc_count(response: &[u8]) -> Result<DtcCount, UdsError> {
    expect_sid(response, service_id::READ_DTC_INFORMATION, 6)?;
    if response[1] != sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK {
        return Err(invalid(format!(
            "Expected DTC count sub-function, got 0x{:02X}",
            response[1]
        )));
    }
    Ok(DtcCount {
        status_availability_mask: response[2],
        format_identifier: response[3],
        count: u16::from_be_bytes([response[4], response[5]]),
    })
}

pub fn clear_dtcs(response: &[u8]) -> Result<(), UdsError> {
    expect_sid(response, service_id::CLEAR_DIAGNOSTIC_INFORMATION, 1)
}

/// Decoded ECUReset response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetResponse {
    pub reset_type: u8,
    /// Seconds until power down, only for enableRapidPowerShutDown
    pub power_down_time: Option<u8>,
}

pub fn ecu_reset(response: &[u8], reset_type: u8) -> Result<ResetResponse, UdsError> {
    expect_sid(response, service_id::ECU_RESET, 2)?;
    let echoed = response[1] & 0x7F;
    if echoed != reset_type & 0x7F {
        return Err(invalid(format!(
            "Reset echo 0x{:02X} does not match request 0x{:02X}",
            echoed, reset_type
        )));
    }
    Ok(ResetResponse {
        reset_type: echoed,
        power_down_time: if echoed == 0x04 {
            response.get(2).copied()
        } else {
            None
        },
    })
}

pub fn tester_present(response: &[u8]) -> Result<(), UdsError> {
    expect_sid(response, service_id::TESTER_PRESENT, 2)
}
