//! Diagnostic core configuration
//!
//! Loaded from TOML. Every section is optional; missing values fall back to
//! the conservative defaults below.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DiagError;
use crate::isotp::{Addressing, IsoTpParams};
use crate::orchestrator::OrchestratorOptions;
use crate::parse::parse_can_id;
use crate::security::KeyAlgorithm;
use crate::session::{SessionTimeouts, SessionType, TimeoutProfile};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub security: KeyAlgorithm,
    #[serde(default)]
    pub keepalive: KeepAliveConfig,
}

impl DiagConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, DiagError> {
        toml::from_str(s).map_err(|e| DiagError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DiagError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiagError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Connection identifiers
    pub fn addressing(&self) -> Result<Addressing, DiagError> {
        Ok(Addressing {
            tx_id: parse_can_id(&self.addressing.tx_id)?,
            rx_id: parse_can_id(&self.addressing.rx_id)?,
            extended: self.addressing.extended,
        })
    }

    /// Orchestrator tuning derived from the worker, bridge and timeout sections
    pub fn orchestrator_options(&self) -> Result<OrchestratorOptions, DiagError> {
        Ok(OrchestratorOptions {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms.max(1)),
            stop_timeout: Duration::from_millis(self.worker.stop_timeout_ms),
            bridge_capacity: self.bridge.queue_capacity,
            event_capacity: self.bridge.event_capacity,
            timeouts: self.timeouts.table()?,
            isotp: IsoTpParams::default(),
        })
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// In-memory bus with a simulated ECU
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Capacity of the inbound frame broadcast channel
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer: usize,
    /// Segment with the kernel ISO-TP socket instead of the user-space stack
    #[serde(default)]
    pub kernel_isotp: bool,
}

impl SocketCanConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            receive_buffer: default_receive_buffer(),
            kernel_isotp: false,
        }
    }
}

fn default_receive_buffer() -> usize {
    1024
}

/// Mock bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Attach the simulated ECU; without it the bus never answers
    #[serde(default = "default_true")]
    pub ecu: bool,
    /// Identifier the simulated ECU listens on
    #[serde(default = "default_request_id")]
    pub request_id: u32,
    /// Identifier the simulated ECU answers on
    #[serde(default = "default_response_id")]
    pub response_id: u32,
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Seed returned for every security level
    #[serde(default = "default_seed")]
    pub seed: Vec<u8>,
    /// Algorithm the simulated ECU checks keys with
    #[serde(default)]
    pub key: KeyAlgorithm,
    /// VIN reported for DID 0xF190
    #[serde(default = "default_vin")]
    pub vin: String,
}

impl MockConfig {
    /// Bus with no ECU attached
    pub fn silent() -> Self {
        Self {
            ecu: false,
            ..Default::default()
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            ecu: true,
            request_id: default_request_id(),
            response_id: default_response_id(),
            latency_ms: 0,
            seed: default_seed(),
            key: KeyAlgorithm::default(),
            vin: default_vin(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_request_id() -> u32 {
    0x7E0
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_seed() -> Vec<u8> {
    vec![0x12, 0x34, 0x56, 0x78]
}

fn default_vin() -> String {
    "WDB1234567890ABCD".to_string()
}

// =============================================================================
// Connection Configuration
// =============================================================================

/// Tester/ECU identifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    /// Transmit CAN ID (tester -> ECU), e.g. "0x7E0"
    #[serde(default = "default_tx_id")]
    pub tx_id: String,
    /// Receive CAN ID (ECU -> tester), e.g. "0x7E8"
    #[serde(default = "default_rx_id")]
    pub rx_id: String,
    /// 29-bit identifiers
    #[serde(default)]
    pub extended: bool,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
            extended: false,
        }
    }
}

fn default_tx_id() -> String {
    "0x7E0".to_string()
}

fn default_rx_id() -> String {
    "0x7E8".to_string()
}

/// Worker loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Bounded wait for the worker on disconnect
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    2000
}

/// Frame bridge and event channel sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    crate::bridge::DEFAULT_QUEUE_CAPACITY
}

fn default_event_capacity() -> usize {
    256
}

// =============================================================================
// Timeout Configuration
// =============================================================================

/// One timeout profile in milliseconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutProfileConfig {
    pub request_timeout_ms: u64,
    pub p2_ms: u64,
    pub p2_star_ms: u64,
}

impl From<TimeoutProfileConfig> for TimeoutProfile {
    fn from(c: TimeoutProfileConfig) -> Self {
        TimeoutProfile::from_millis(c.request_timeout_ms, c.p2_ms, c.p2_star_ms)
    }
}

/// Overrides on top of the built-in session timeout table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Profile for sessions without an entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<TimeoutProfileConfig>,
    /// Per-session profiles keyed by session id, e.g. `"0x03"`
    #[serde(default)]
    pub sessions: BTreeMap<String, TimeoutProfileConfig>,
}

impl TimeoutsConfig {
    pub fn table(&self) -> Result<SessionTimeouts, DiagError> {
        let mut table = SessionTimeouts::default();
        if let Some(fallback) = self.fallback {
            table.set_fallback(fallback.into());
        }
        for (key, profile) in &self.sessions {
            let code = parse_can_id(key)
                .ok()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| DiagError::Config(format!("Invalid session id '{}'", key)))?;
            table.insert(SessionType::from(code), (*profile).into());
        }
        Ok(table)
    }
}

// =============================================================================
// Keepalive Configuration
// =============================================================================

/// Periodic tester present, driven by the host application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_true")]
    pub suppress_response: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_keepalive_interval(),
            suppress_response: true,
        }
    }
}

fn default_keepalive_interval() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DiagConfig::from_toml_str("").unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
        let addressing = config.addressing().unwrap();
        assert_eq!(addressing.tx_id, 0x7E0);
        assert_eq!(addressing.rx_id, 0x7E8);

        let options = config.orchestrator_options().unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(500));
        assert_eq!(options.stop_timeout, Duration::from_secs(2));
        assert_eq!(options.bridge_capacity, 500);
        assert_eq!(options.timeouts, SessionTimeouts::default());
    }

    #[test]
    fn test_full_config() {
        let config = DiagConfig::from_toml_str(
            r#"
            [transport]
            type = "socketcan"
            interface = "can0"

            [addressing]
            tx_id = "0x18DA10F1"
            rx_id = "0x18DAF110"
            extended = true

            [worker]
            poll_interval_ms = 100

            [timeouts.sessions."0x60"]
            request_timeout_ms = 2000
            p2_ms = 100
            p2_star_ms = 3000

            [security]
            algorithm = "crc16"

            [keepalive]
            interval_ms = 1500
            suppress_response = false
            "#,
        )
        .unwrap();

        match &config.transport {
            TransportConfig::SocketCan(cfg) => {
                assert_eq!(cfg.interface, "can0");
                assert_eq!(cfg.receive_buffer, 1024);
                assert!(!cfg.kernel_isotp);
            }
            other => panic!("Expected SocketCan, got {:?}", other),
        }
        let addressing = config.addressing().unwrap();
        assert!(addressing.extended);
        assert_eq!(addressing.tx_id, 0x18DA_10F1);
        assert_eq!(config.security, KeyAlgorithm::Crc16);
        assert!(!config.keepalive.suppress_response);

        let options = config.orchestrator_options().unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(100));
        assert_eq!(
            options.timeouts.profile_for(SessionType::Vendor(0x60)),
            TimeoutProfile::from_millis(2000, 100, 3000)
        );
    }

    #[test]
    fn test_invalid_session_key() {
        let config = DiagConfig::from_toml_str(
            r#"
            [timeouts.sessions."extended"]
            request_timeout_ms = 2000
            p2_ms = 100
            p2_star_ms = 3000
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.orchestrator_options(),
            Err(DiagError::Config(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = DiagConfig::from_toml_str(
            r#"
            [worker]
            poll_interval_ms = 0
            "#,
        )
        .unwrap();
        let options = config.orchestrator_options().unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_kernel_isotp_flag() {
        let config = DiagConfig::from_toml_str(
            r#"
            [transport]
            type = "socketcan"
            interface = "vcan0"
            kernel_isotp = true
            "#,
        )
        .unwrap();
        match config.transport {
            TransportConfig::SocketCan(cfg) => assert!(cfg.kernel_isotp),
            other => panic!("Expected SocketCan, got {:?}", other),
        }
    }

    #[test]
    fn test_mock_config() {
        let config = DiagConfig::from_toml_str(
            r#"
            [transport]
            type = "mock"
            latency_ms = 5
            seed = [0xAA, 0xBB]
            "#,
        )
        .unwrap();
        match config.transport {
            TransportConfig::Mock(mock) => {
                assert!(mock.ecu);
                assert_eq!(mock.latency_ms, 5);
                assert_eq!(mock.seed, vec![0xAA, 0xBB]);
                assert_eq!(mock.request_id, 0x7E0);
            }
            other => panic!("Expected Mock, got {:?}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[addressing]\ntx_id = \"0x7E1\"\nrx_id = \"0x7E9\"").unwrap();
        let config = DiagConfig::load(file.path()).unwrap();
        assert_eq!(config.addressing().unwrap().tx_id, 0x7E1);

        assert!(matches!(
            DiagConfig::load("/nonexistent/candiag.toml"),
            Err(DiagError::Config(_))
        ));
    }
}
