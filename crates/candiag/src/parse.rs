//! Parsing of user-entered identifiers and byte strings

use crate::error::DiagError;

/// Largest 29-bit CAN identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Parse a CAN ID, hex with `0x` prefix or decimal
pub fn parse_can_id(s: &str) -> Result<u32, DiagError> {
    let id = parse_u32(s)
        .map_err(|e| DiagError::InvalidArgument(format!("Invalid CAN ID '{}': {}", s.trim(), e)))?;
    if id > MAX_EXTENDED_ID {
        return Err(DiagError::InvalidArgument(format!(
            "CAN ID 0x{:X} exceeds 29 bits",
            id
        )));
    }
    Ok(id)
}

/// Parse a 16-bit data identifier, hex with `0x` prefix or decimal
pub fn parse_did(s: &str) -> Result<u16, DiagError> {
    let value = parse_u32(s)
        .map_err(|e| DiagError::InvalidArgument(format!("Invalid DID '{}': {}", s.trim(), e)))?;
    u16::try_from(value)
        .map_err(|_| DiagError::InvalidArgument(format!("DID 0x{:X} exceeds 16 bits", value)))
}

/// Parse a byte string such as `12 34 56`, `0x1234`, `12:34` or `12-34`
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, DiagError> {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, ':' | '-' | ','))
        .collect();
    hex::decode(&digits)
        .map_err(|e| DiagError::InvalidArgument(format!("Invalid hex bytes '{}': {}", trimmed, e)))
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
