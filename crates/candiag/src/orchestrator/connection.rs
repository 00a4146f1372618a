//! Connection state shared by the orchestrator handle and its worker

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{ConnectionState, DiagEvent};
use super::queue::{QueuedRequest, Request, RequestId};
use super::{worker, OrchestratorOptions};
use crate::bridge::{FrameBridge, ObservedFrame};
use crate::error::{DiagError, ErrorKind};
use crate::isotp::Addressing;
use crate::session::{SecuritySnapshot, SessionSnapshot, SessionType, TimeoutProfile};
use crate::transport::CanTransport;
use crate::uds::{ClientFactory, UdsClient};

/// Per-connection protocol stack: bridge, client and inbound listener
struct Link {
    bridge: Arc<FrameBridge>,
    client: Arc<dyn UdsClient>,
    listener: JoinHandle<()>,
}

impl Link {
    fn close(self) {
        self.listener.abort();
        self.client.close();
        self.bridge.shutdown();
    }
}

/// Handles that exist only while connected
struct Control {
    addressing: Addressing,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<QueuedRequest>,
    worker: Option<JoinHandle<()>>,
}

/// What the worker does after a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Shared {
    transport: Arc<dyn CanTransport>,
    factory: Arc<dyn ClientFactory>,
    pub(crate) options: OrchestratorOptions,
    state: RwLock<ConnectionState>,
    session: ArcSwap<SessionSnapshot>,
    security: ArcSwap<SecuritySnapshot>,
    profile: ArcSwap<TimeoutProfile>,
    pending: Mutex<HashSet<RequestId>>,
    next_id: AtomicU64,
    dropped_frames: AtomicU64,
    link: Mutex<Option<Link>>,
    control: Mutex<Option<Control>>,
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<DiagEvent>,
    frames: broadcast::Sender<ObservedFrame>,
}

impl Shared {
    pub fn new(
        transport: Arc<dyn CanTransport>,
        factory: Arc<dyn ClientFactory>,
        options: OrchestratorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (frames, _) = broadcast::channel(options.bridge_capacity.max(1));
        let profile = options.timeouts.profile_for(SessionType::Default);
        Self {
            transport,
            factory,
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            session: ArcSwap::from_pointee(SessionSnapshot::inactive()),
            security: ArcSwap::from_pointee(SecuritySnapshot::locked()),
            profile: ArcSwap::from_pointee(profile),
            pending: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            dropped_frames: AtomicU64::new(0),
            link: Mutex::new(None),
            control: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
            frames,
        }
    }

    // =========================================================================
    // State accessors
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            debug!(%state, "Connection state changed");
            self.emit(DiagEvent::ConnectionStateChanged { state });
        }
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.load().as_ref().clone()
    }

    pub fn security(&self) -> SecuritySnapshot {
        self.security.load().as_ref().clone()
    }

    pub fn set_security(&self, snapshot: SecuritySnapshot) {
        self.security.store(Arc::new(snapshot));
    }

    pub fn profile(&self) -> TimeoutProfile {
        **self.profile.load()
    }

    pub fn addressing(&self) -> Option<Addressing> {
        self.control.lock().as_ref().map(|c| c.addressing)
    }

    pub fn client(&self) -> Option<Arc<dyn UdsClient>> {
        self.link.lock().as_ref().map(|l| l.client.clone())
    }

    /// Overflow drops of the current bridge plus all earlier ones
    pub fn dropped_frames(&self) -> u64 {
        let current = self
            .link
            .lock()
            .as_ref()
            .map(|l| l.bridge.dropped_frames())
            .unwrap_or(0);
        self.dropped_frames.load(Ordering::Relaxed) + current
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<ObservedFrame> {
        self.frames.subscribe()
    }

    pub fn emit(&self, event: DiagEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Log an error and publish it as an `ErrorOccurred` event
    pub fn report(&self, err: &DiagError) {
        match err.kind() {
            ErrorKind::Negative | ErrorKind::Precondition => warn!(error = %err, "Request failed"),
            _ => error!(error = %err, kind = ?err.kind(), "Request failed"),
        }
        self.emit(DiagEvent::ErrorOccurred {
            message: err.to_string(),
            kind: err.kind(),
        });
    }

    // =========================================================================
    // Session and security transitions
    // =========================================================================

    /// Apply a confirmed session change: new profile, security reset
    pub fn apply_session(&self, session_type: SessionType) {
        let profile = self.options.timeouts.profile_for(session_type);
        self.session
            .store(Arc::new(SessionSnapshot::new(session_type, true)));
        self.clear_security();
        self.profile.store(Arc::new(profile));
        if let Some(client) = self.client() {
            client.apply_timeouts(&profile);
        }
        info!(
            session_id = format!("0x{:02X}", session_type.code()),
            p2_ms = profile.p2.as_millis() as u64,
            "Diagnostic session changed"
        );
        self.emit(DiagEvent::SessionChanged {
            session_type,
            name: session_type.name(),
        });
    }

    fn clear_security(&self) {
        let previous = self.security.swap(Arc::new(SecuritySnapshot::locked()));
        if previous.unlocked || previous.seed_pending {
            debug!(level = previous.level, "Security access reset");
            self.emit(DiagEvent::SecurityStatusChanged {
                level: 0,
                unlocked: false,
                seed: Vec::new(),
            });
        }
    }

    /// Back to the default session with security locked
    fn reset_state(&self, active: bool) {
        self.session.store(Arc::new(SessionSnapshot::new(
            SessionType::Default,
            active,
        )));
        self.clear_security();
        self.profile.store(Arc::new(
            self.options.timeouts.profile_for(SessionType::Default),
        ));
    }

    // =========================================================================
    // Request submission
    // =========================================================================

    pub fn submit(&self, request: Request) -> Result<RequestId, DiagError> {
        let control = self.control.lock();
        let control = match control.as_ref() {
            Some(control) if self.state() == ConnectionState::Connected => control,
            _ => {
                drop(control);
                let err = DiagError::NotConnected;
                self.report(&err);
                return Err(err);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let service = request.service;
        let priority = request.priority;
        self.pending.lock().insert(id);

        let queued = QueuedRequest {
            id,
            enqueued_at: Instant::now(),
            request,
        };
        if control.tx.send(queued).is_err() {
            self.pending.lock().remove(&id);
            drop(control);
            let err = DiagError::NotConnected;
            self.report(&err);
            return Err(err);
        }
        debug!(request_id = id, service, priority, "Request queued");
        Ok(id)
    }

    /// Claim a dequeued request; false if it was invalidated meanwhile
    pub fn take_pending(&self, id: RequestId) -> bool {
        self.pending.lock().remove(&id)
    }

    fn invalidate_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }

    // =========================================================================
    // Link management
    // =========================================================================

    fn build_link(&self, addressing: Addressing) -> Result<Link, DiagError> {
        let bridge = Arc::new(FrameBridge::new(
            self.transport.clone(),
            self.options.bridge_capacity,
            self.frames.clone(),
        ));
        let client = self.factory.create(bridge.clone(), addressing)?;
        client.apply_timeouts(&self.profile());

        let mut inbound = self.transport.subscribe();
        let feeder = bridge.clone();
        let listener = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(frame) => {
                        if frame.id == addressing.rx_id && frame.extended == addressing.extended {
                            feeder.push_inbound(frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inbound frame listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Inbound frame listener stopped");
        });

        Ok(Link {
            bridge,
            client,
            listener,
        })
    }

    fn install_link(&self, link: Link) {
        if let Some(old) = self.link.lock().replace(link) {
            self.retire_link(old);
        }
    }

    fn teardown_link(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            self.retire_link(link);
        }
    }

    fn retire_link(&self, link: Link) {
        self.dropped_frames
            .fetch_add(link.bridge.dropped_frames(), Ordering::Relaxed);
        link.close();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn connect(self: &Arc<Self>, addressing: Addressing) -> Result<(), DiagError> {
        let _guard = self.lifecycle.lock().await;

        if self.control.lock().is_some() {
            info!("Already connected, closing current connection first");
            self.disconnect_locked().await;
        }

        self.set_state(ConnectionState::Connecting);
        if !self.transport.is_connected() {
            return Err(self.connect_failed(DiagError::TransportNotConnected));
        }

        self.profile.store(Arc::new(
            self.options.timeouts.profile_for(SessionType::Default),
        ));
        let link = match self.build_link(addressing) {
            Ok(link) => link,
            Err(e) => return Err(self.connect_failed(e)),
        };
        self.install_link(link);

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let worker = tokio::spawn(worker::run(self.clone(), rx, token.clone()));
        *self.control.lock() = Some(Control {
            addressing,
            token,
            tx,
            worker: Some(worker),
        });

        self.reset_state(true);
        self.set_state(ConnectionState::Connected);
        info!(
            tx_id = format!("0x{:03X}", addressing.tx_id),
            rx_id = format!("0x{:03X}", addressing.rx_id),
            "Diagnostic connection established"
        );
        Ok(())
    }

    fn connect_failed(&self, err: DiagError) -> DiagError {
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
        self.report(&err);
        err
    }

    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.disconnect_locked().await;
    }

    async fn disconnect_locked(&self) {
        let control = self.control.lock().take();
        let Some(control) = control else {
            self.teardown_link();
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        self.set_state(ConnectionState::Disconnecting);
        let dropped = self.invalidate_pending();
        let Control {
            token, tx, worker, ..
        } = control;
        token.cancel();
        drop(tx);

        if let Some(worker) = worker {
            match tokio::time::timeout(self.options.stop_timeout, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker task failed"),
                Err(_) => warn!(
                    timeout_ms = self.options.stop_timeout.as_millis() as u64,
                    "Worker did not stop in time, continuing teardown"
                ),
            }
        }

        self.teardown_link();
        self.reset_state(false);
        self.set_state(ConnectionState::Disconnected);
        info!(dropped, "Diagnostic connection closed");
    }

    /// Synchronous teardown for drop paths; the worker is not awaited
    pub fn abandon(&self) {
        if let Some(control) = self.control.lock().take() {
            control.token.cancel();
        }
        self.invalidate_pending();
        self.teardown_link();
        self.reset_state(false);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn lock_for_worker(
        &self,
        token: &CancellationToken,
    ) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        let guard = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            guard = self.lifecycle.lock() => guard,
        };
        if token.is_cancelled() {
            None
        } else {
            Some(guard)
        }
    }

    /// Tear the link down and rebuild it with the same identifiers
    pub async fn recycle(&self, token: &CancellationToken) -> Flow {
        let Some(_guard) = self.lock_for_worker(token).await else {
            return Flow::Stop;
        };
        let Some(addressing) = self.addressing() else {
            return Flow::Stop;
        };

        warn!("Recycling diagnostic connection");
        let dropped = self.invalidate_pending();
        self.teardown_link();
        self.reset_state(true);

        match self.build_link(addressing) {
            Ok(link) => {
                self.install_link(link);
                info!(dropped, "Diagnostic connection recycled");
                Flow::Continue
            }
            Err(e) => {
                self.report(&e);
                self.abandon();
                Flow::Stop
            }
        }
    }

    /// Force a disconnect after a fatal transport error and try one reconnect
    pub async fn recover(&self, token: &CancellationToken, cause: &DiagError) -> Flow {
        let Some(_guard) = self.lock_for_worker(token).await else {
            return Flow::Stop;
        };
        let Some(addressing) = self.addressing() else {
            return Flow::Stop;
        };

        error!(error = %cause, "Fatal transport error, forcing disconnect");
        let dropped = self.invalidate_pending();
        self.teardown_link();
        self.reset_state(false);
        self.set_state(ConnectionState::Disconnected);
        self.emit(DiagEvent::ErrorOccurred {
            message: format!("Connection lost: {}", cause),
            kind: ErrorKind::Transport,
        });

        self.set_state(ConnectionState::Connecting);
        let rebuilt = if self.transport.is_connected() {
            self.build_link(addressing)
        } else {
            Err(DiagError::TransportNotConnected)
        };

        match rebuilt {
            Ok(link) => {
                self.install_link(link);
                self.reset_state(true);
                self.set_state(ConnectionState::Connected);
                info!(dropped, "Reconnected after transport error");
                Flow::Continue
            }
            Err(e) => {
                error!(error = %e, "Reconnect failed");
                self.emit(DiagEvent::ErrorOccurred {
                    message: format!("Reconnect failed: {}", e),
                    kind: ErrorKind::Transport,
                });
                self.abandon();
                Flow::Stop
            }
        }
    }
}
