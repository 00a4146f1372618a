//! Diagnostic session orchestrator
//!
//! The orchestrator owns one connection to an ECU at a time. Service calls are
//! queued by priority and executed strictly one at a time by a single worker
//! task; results come back through the callbacks on a [`Request`] and as
//! [`DiagEvent`]s on a broadcast channel.
//!
//! ```text
//!   host ──▶ service call ──▶ queue ──▶ worker ──▶ UdsClient ──▶ ISO-TP ──▶ bridge ──▶ CAN
//!                                          │
//!                                          └──▶ callbacks + DiagEvent broadcast
//! ```

mod connection;
mod events;
mod queue;
mod services;
mod worker;

pub use events::{ConnectionState, DiagEvent};
pub use queue::{priority, FailureFn, Request, RequestId, SuccessFn};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::bridge::{ObservedFrame, DEFAULT_QUEUE_CAPACITY};
use crate::config::DiagConfig;
use crate::error::DiagError;
use crate::isotp::{Addressing, IsoTpParams};
use crate::session::{SecuritySnapshot, SessionSnapshot, SessionTimeouts, TimeoutProfile};
use crate::transport::CanTransport;
use crate::uds::{ClientFactory, IsoTpClientFactory};
use connection::Shared;

/// Runtime tuning of an [`Orchestrator`]
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Idle wake-up interval of the worker
    pub poll_interval: Duration,
    /// How long disconnect waits for the worker before tearing down anyway
    pub stop_timeout: Duration,
    /// Inbound frame queue capacity of the bridge
    pub bridge_capacity: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    pub timeouts: SessionTimeouts,
    pub isotp: IsoTpParams,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(2),
            bridge_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: 256,
            timeouts: SessionTimeouts::default(),
            isotp: IsoTpParams::default(),
        }
    }
}

/// Handle to the diagnostic session core
///
/// Dropping the handle cancels the worker and closes the connection.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Orchestrator using the ISO-TP UDS client
    pub fn new(transport: Arc<dyn CanTransport>, options: OrchestratorOptions) -> Self {
        let factory = Arc::new(IsoTpClientFactory::new(options.isotp));
        Self::with_factory(transport, factory, options)
    }

    /// Orchestrator with a custom client stack
    pub fn with_factory(
        transport: Arc<dyn CanTransport>,
        factory: Arc<dyn ClientFactory>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(transport, factory, options)),
        }
    }

    /// Orchestrator for a loaded configuration
    ///
    /// A SocketCAN transport with `kernel_isotp` set gets the kernel ISO-TP
    /// client; everything else uses the user-space stack.
    pub fn from_config(
        transport: Arc<dyn CanTransport>,
        config: &DiagConfig,
    ) -> Result<Self, DiagError> {
        let options = config.orchestrator_options()?;
        match &config.transport {
            #[cfg(all(target_os = "linux", feature = "socketcan"))]
            crate::config::TransportConfig::SocketCan(cfg) if cfg.kernel_isotp => {
                let factory = Arc::new(crate::uds::KernelIsoTpClientFactory::new(
                    cfg.interface.clone(),
                ));
                Ok(Self::with_factory(transport, factory, options))
            }
            _ => Ok(Self::new(transport, options)),
        }
    }

    /// Open a connection on the given identifiers
    ///
    /// An existing connection is closed first. Fails if the transport is not
    /// connected or the client stack cannot be built; the state is then back
    /// at `Disconnected`.
    pub async fn connect(&self, addressing: Addressing) -> Result<(), DiagError> {
        self.shared.connect(addressing).await
    }

    /// Close the connection; pending requests are dropped without callbacks
    pub async fn disconnect(&self) {
        self.shared.disconnect().await
    }

    /// Queue a request
    pub fn enqueue(&self, request: Request) -> Result<RequestId, DiagError> {
        self.shared.submit(request)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn session(&self) -> SessionSnapshot {
        self.shared.session()
    }

    pub fn security(&self) -> SecuritySnapshot {
        self.shared.security()
    }

    /// Timeout profile of the active session
    pub fn timeouts(&self) -> TimeoutProfile {
        self.shared.profile()
    }

    /// Identifiers of the current connection
    pub fn addressing(&self) -> Option<Addressing> {
        self.shared.addressing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagEvent> {
        self.shared.subscribe()
    }

    /// Every frame the bridge transmits
    pub fn subscribe_frames(&self) -> broadcast::Receiver<ObservedFrame> {
        self.shared.subscribe_frames()
    }

    /// Inbound frames dropped on bridge queue overflow
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shared.abandon();
    }
}
