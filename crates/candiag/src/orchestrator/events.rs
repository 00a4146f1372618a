//! Events published by the orchestrator

use std::fmt;

use serde::Serialize;

use super::RequestId;
use crate::error::ErrorKind;
use crate::session::{hex_bytes, SessionType};
use crate::uds::{Dtc, Nrc};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Status and result notifications for the host application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagEvent {
    /// A request completed; `data` is the raw response
    ResponseReceived {
        id: RequestId,
        service: &'static str,
        success: bool,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nrc: Option<Nrc>,
    },
    ErrorOccurred {
        message: String,
        kind: ErrorKind,
    },
    SessionChanged {
        session_type: SessionType,
        name: String,
    },
    SecurityStatusChanged {
        level: u8,
        unlocked: bool,
        #[serde(with = "hex_bytes")]
        seed: Vec<u8>,
    },
    DtcsReceived {
        sub_function: u8,
        status_availability_mask: u8,
        dtcs: Vec<Dtc>,
    },
    DtcCountReceived {
        status_availability_mask: u8,
        count: u16,
    },
    /// Normalized record of a ReadDataByIdentifier response
    DataRead {
        did: u16,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    ConnectionStateChanged {
        state: ConnectionState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = DiagEvent::ResponseReceived {
            id: 7,
            service: "ReadDataByIdentifier",
            success: false,
            data: vec![0x7F, 0x22, 0x31],
            nrc: Some(Nrc::REQUEST_OUT_OF_RANGE),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "response_received");
        assert_eq!(json["data"], "7F2231");
        assert_eq!(json["nrc"], 0x31);

        let state = DiagEvent::ConnectionStateChanged {
            state: ConnectionState::Connected,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "connected");
    }
}
