//! Output formatting for the candiag CLI (text or JSON)

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

use candiag::{DiagEvent, Dtc, ObservedFrame};

/// Context for output rendering
pub struct OutputContext {
    pub json: bool,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(json: bool, no_color: bool, quiet: bool) -> Self {
        if no_color || json {
            colored::control::set_override(false);
        }
        Self { json, quiet }
    }

    /// Print a success message (unless in quiet or JSON mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet && !self.json {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet or JSON mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet && !self.json {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print rows as a table, or as a JSON array
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
            );
        } else if data.is_empty() {
            if !self.quiet {
                println!("No data");
            }
        } else {
            println!("{}", Table::new(data));
        }
    }

    /// Print a single value as JSON, or its text rendering
    pub fn print_value<T: Serialize>(&self, value: &T, text: &str) {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
            );
        } else {
            println!("{}", text);
        }
    }

    /// One line per event for streaming output
    pub fn event(&self, event: &DiagEvent) {
        if self.json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        } else {
            println!("{}", describe(event));
        }
    }

    pub fn frame(&self, frame: &ObservedFrame) {
        if self.json {
            if let Ok(line) = serde_json::to_string(frame) {
                println!("{}", line);
            }
        } else {
            let id = if frame.extended {
                format!("{:08X}", frame.id)
            } else {
                format!("{:03X}", frame.id)
            };
            println!(
                "{} {} TX {} [{}] {}",
                frame.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                frame.channel,
                id,
                frame.data.len(),
                spaced_hex(&frame.data)
            );
        }
    }
}

/// Human-readable rendering of an event
pub fn describe(event: &DiagEvent) -> String {
    match event {
        DiagEvent::ResponseReceived {
            id,
            service,
            success,
            data,
            nrc,
        } => {
            let status = if *success { "ok".green() } else { "failed".red() };
            match nrc {
                Some(nrc) => format!("#{} {} {}: {}", id, service, status, nrc),
                None => format!("#{} {} {}: {}", id, service, status, spaced_hex(data)),
            }
        }
        DiagEvent::ErrorOccurred { message, kind } => {
            format!("{} [{:?}] {}", "error".red(), kind, message)
        }
        DiagEvent::SessionChanged { session_type, .. } => {
            format!("session -> {}", session_type)
        }
        DiagEvent::SecurityStatusChanged {
            level,
            unlocked,
            seed,
        } => {
            if *unlocked {
                format!("security level 0x{:02X} {}", level, "unlocked".green())
            } else if seed.is_empty() {
                "security locked".to_string()
            } else {
                format!("security level 0x{:02X} seed {}", level, spaced_hex(seed))
            }
        }
        DiagEvent::DtcsReceived { dtcs, .. } => {
            let codes: Vec<&str> = dtcs.iter().map(|d| d.code.as_str()).collect();
            format!("{} DTC(s): {}", dtcs.len(), codes.join(" "))
        }
        DiagEvent::DtcCountReceived { count, .. } => format!("{} DTC(s) match", count),
        DiagEvent::DataRead { did, data } => {
            format!("DID 0x{:04X} = {}", did, spaced_hex(data))
        }
        DiagEvent::ConnectionStateChanged { state } => format!("connection {}", state),
    }
}

pub fn spaced_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Printable ASCII rendering, non-printable bytes as '.'
pub fn ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Data identifier display for read command
#[derive(Debug, Tabled, Serialize)]
pub struct DataRow {
    #[tabled(rename = "DID")]
    pub did: String,
    #[tabled(rename = "Hex")]
    pub hex: String,
    #[tabled(rename = "ASCII")]
    pub ascii: String,
}

impl DataRow {
    pub fn new(did: u16, data: &[u8]) -> Self {
        Self {
            did: format!("0x{:04X}", did),
            hex: hex::encode_upper(data),
            ascii: ascii(data),
        }
    }
}

/// DTC display for dtcs command
#[derive(Debug, Tabled, Serialize)]
pub struct DtcRow {
    #[tabled(rename = "Code")]
    pub code: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Active")]
    pub active: String,
    #[tabled(rename = "Flags")]
    pub flags: String,
}

impl From<&Dtc> for DtcRow {
    fn from(dtc: &Dtc) -> Self {
        Self {
            code: dtc.code.clone(),
            status: format!("0x{:02X}", dtc.status.raw()),
            active: if dtc.status.is_active() {
                "Yes".to_string()
            } else {
                "No".to_string()
            },
            flags: dtc.status.flags().join(", "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_masks_control_bytes() {
        assert_eq!(ascii(b"WDB\x00\x7F1"), "WDB..1");
    }

    #[test]
    fn test_data_row() {
        let row = DataRow::new(0xF186, &[0x01]);
        assert_eq!(row.did, "0xF186");
        assert_eq!(row.hex, "01");
    }

    #[test]
    fn test_describe_negative_response() {
        colored::control::set_override(false);
        let event = DiagEvent::ResponseReceived {
            id: 3,
            service: "ReadDataByIdentifier",
            success: false,
            data: vec![0x7F, 0x22, 0x31],
            nrc: Some(candiag::Nrc::REQUEST_OUT_OF_RANGE),
        };
        let text = describe(&event);
        assert!(text.starts_with("#3 ReadDataByIdentifier failed: "));
    }
}
