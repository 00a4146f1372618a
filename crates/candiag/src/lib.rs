//! candiag - UDS-over-ISO-TP diagnostic session core
//!
//! This crate drives diagnostic conversations with a single ECU over an
//! already-connected raw CAN transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Orchestrator                           │
//! │  connect / disconnect, priority queue, single worker        │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ Timeouts    │  │ Session /   │  │ KeyProvider         │  │
//! │  │ (profiles)  │  │ Security    │  │ (seed -> key)       │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │                          │                                  │
//! │                    ┌─────┴─────┐                            │
//! │                    │ UdsClient │                            │
//! │                    │ (0x10..)  │                            │
//! │                    └─────┬─────┘                            │
//! │                    ┌─────┴─────┐                            │
//! │                    │  ISO-TP   │                            │
//! │                    └─────┬─────┘                            │
//! │                    ┌─────┴─────┐                            │
//! │                    │FrameBridge│                            │
//! │                    └─────┬─────┘                            │
//! │                 ┌────────┴────────┐                         │
//! │                 │  CanTransport   │                         │
//! │                 │ (SocketCAN/mock)│                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod isotp;
pub mod orchestrator;
pub mod parse;
pub mod security;
pub mod session;
pub mod transport;
pub mod uds;

pub use bridge::{FrameBridge, ObservedFrame};
pub use config::DiagConfig;
pub use error::{DiagError, ErrorKind};
pub use isotp::{Addressing, IsoTpParams};
pub use orchestrator::{
    priority, ConnectionState, DiagEvent, Orchestrator, OrchestratorOptions, Request, RequestId,
};
pub use security::{KeyAlgorithm, KeyError, KeyProvider};
pub use session::{SecuritySnapshot, SessionSnapshot, SessionTimeouts, SessionType, TimeoutProfile};
pub use transport::{create_transport, CanFrame, CanTransport, TransportError};
pub use uds::{Dtc, DtcCategory, DtcStatus, Nrc, UdsClient, UdsError};
