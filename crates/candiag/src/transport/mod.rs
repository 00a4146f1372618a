//! Raw CAN transport layer
//!
//! The diagnostic core consumes an already-connected raw CAN transport:
//! - SocketCAN raw socket adapter (Linux only, `socketcan` feature)
//! - In-memory mock bus with a simulated ECU for testing
//!
//! # Example
//!
//! ```ignore
//! use candiag::transport::{create_transport, CanTransport};
//! use candiag::config::TransportConfig;
//!
//! let transport = create_transport(&TransportConfig::Mock(Default::default()))?;
//! assert!(transport.is_connected());
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{CanFrame, CanTransport, CLASSIC_CAN_MAX_DLC};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport based on configuration
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn CanTransport>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let transport = socketcan::SocketCanTransport::open(cfg)?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockCanBus::new(cfg))),
    }
}
