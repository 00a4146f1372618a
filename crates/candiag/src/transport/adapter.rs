//! Raw CAN transport trait and frame type

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::TransportError;

/// Maximum payload of a classic CAN frame
pub const CLASSIC_CAN_MAX_DLC: usize = 8;

/// A raw CAN frame as seen on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanFrame {
    /// 11-bit or 29-bit identifier
    pub id: u32,
    /// Frame payload
    pub data: Vec<u8>,
    /// Whether `id` is a 29-bit extended identifier
    pub extended: bool,
    /// Whether this is a CAN-FD frame
    pub fd: bool,
    /// Time the frame was received or sent
    pub timestamp: DateTime<Utc>,
}

impl CanFrame {
    /// Classic CAN frame stamped with the current time
    pub fn new(id: u32, data: impl Into<Vec<u8>>, extended: bool) -> Self {
        Self {
            id,
            data: data.into(),
            extended,
            fd: false,
            timestamp: Utc::now(),
        }
    }
}

/// Connected raw-CAN transport
///
/// The diagnostic core never opens or closes the transport; it checks
/// `is_connected`, writes frames and listens on the inbound stream of
/// whatever transport the host application has already brought up.
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Write one frame to the bus
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Subscribe to every frame received on the bus
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;
}
