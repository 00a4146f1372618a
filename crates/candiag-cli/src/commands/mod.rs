//! Command implementations for the candiag CLI

pub mod data;
pub mod dtcs;
pub mod monitor;
pub mod reset;
pub mod session;
pub mod tester_present;
pub mod unlock;

pub use data::{raw, read, write};
pub use dtcs::{clear_dtcs, dtcs};
pub use monitor::monitor;
pub use reset::reset;
pub use session::session;
pub use tester_present::tester_present;
pub use unlock::unlock;

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use candiag::config::KeepAliveConfig;
use candiag::parse::parse_did;
use candiag::{DiagEvent, Orchestrator, RequestId};

/// A connected orchestrator plus its event subscription
///
/// The subscription is taken before any command is queued so no result can
/// be missed.
pub struct DiagSession<'a> {
    pub orchestrator: &'a Orchestrator,
    events: broadcast::Receiver<DiagEvent>,
    wait: Duration,
}

impl<'a> DiagSession<'a> {
    pub fn new(orchestrator: &'a Orchestrator, wait: Duration) -> Self {
        Self {
            orchestrator,
            events: orchestrator.subscribe(),
            wait,
        }
    }

    /// Wait for the first event `f` maps to a result
    pub async fn until<T, F>(&mut self, mut f: F) -> Result<T>
    where
        F: FnMut(&DiagEvent) -> Option<Result<T>>,
    {
        let limit = self.wait;
        let events = &mut self.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(result) = f(&event) {
                            return result;
                        }
                    }
                    Err(RecvError::Lagged(n)) => debug!(missed = n, "Event subscriber lagged"),
                    Err(RecvError::Closed) => bail!("Orchestrator stopped"),
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| anyhow!("No result within {} ms", limit.as_millis()))?
    }

    /// Wait for the completion of request `id` and return its raw response
    pub async fn response(&mut self, id: RequestId) -> Result<Vec<u8>> {
        self.until(|event| match event {
            DiagEvent::ResponseReceived {
                id: got,
                success: true,
                data,
                ..
            } if *got == id => Some(Ok(data.clone())),
            other => failure(id, other).map(Err),
        })
        .await
    }
}

/// The error for request `id` if `event` reports its failure
pub fn failure(id: RequestId, event: &DiagEvent) -> Option<anyhow::Error> {
    match event {
        DiagEvent::ResponseReceived {
            id: got,
            service,
            success: false,
            nrc,
            ..
        } if *got == id => Some(match nrc {
            Some(nrc) => anyhow!("{} rejected: {}", service, nrc),
            None => anyhow!("{} failed: no valid response", service),
        }),
        _ => None,
    }
}

/// Run `command` while sending periodic TesterPresent
pub async fn with_keepalive<F>(
    orchestrator: &Orchestrator,
    config: &KeepAliveConfig,
    command: F,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    if !config.enabled {
        return command.await;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    // The first tick completes immediately
    ticker.tick().await;
    tokio::pin!(command);

    loop {
        tokio::select! {
            result = &mut command => return result,
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.keep_alive(config.suppress_response) {
                    debug!(error = %e, "TesterPresent not queued");
                }
            }
        }
    }
}

/// Parse a byte-sized argument, hex with `0x` prefix or decimal
pub fn parse_u8(s: &str, what: &str) -> Result<u8> {
    let value = parse_did(s).with_context(|| format!("Invalid {}", what))?;
    u8::try_from(value).map_err(|_| anyhow!("{} 0x{:X} exceeds one byte", what, value))
}
