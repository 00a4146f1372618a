//! Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;

use candiag::bridge::FrameBridge;
use candiag::config::MockConfig;
use candiag::transport::mock::MockCanBus;
use candiag::uds::ClientFactory;
use candiag::{
    Addressing, DiagEvent, Orchestrator, OrchestratorOptions, TimeoutProfile, UdsClient, UdsError,
};

/// Request payload the scripted client holds until released
pub const BLOCKER: [u8; 2] = [0x31, 0x01];

pub fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        poll_interval: Duration::from_millis(20),
        stop_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

pub fn mock_bus(config: MockConfig) -> Arc<MockCanBus> {
    Arc::new(MockCanBus::new(&config))
}

/// Orchestrator over the mock bus with the real ISO-TP client stack
pub async fn connected(config: MockConfig) -> (Arc<MockCanBus>, Orchestrator) {
    let bus = mock_bus(config);
    let orchestrator = Orchestrator::new(bus.clone(), fast_options());
    orchestrator.connect(Addressing::default()).await.unwrap();
    (bus, orchestrator)
}

/// Orchestrator over the mock bus with scripted clients
pub async fn scripted() -> (Arc<MockCanBus>, Arc<ScriptedFactory>, Orchestrator) {
    let bus = mock_bus(MockConfig::silent());
    let factory = Arc::new(ScriptedFactory::default());
    let orchestrator = Orchestrator::with_factory(bus.clone(), factory.clone(), fast_options());
    orchestrator.connect(Addressing::default()).await.unwrap();
    (bus, factory, orchestrator)
}

/// Wait for the first event accepted by `f`
pub async fn next_event<F>(rx: &mut broadcast::Receiver<DiagEvent>, mut f: F) -> DiagEvent
where
    F: FnMut(&DiagEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if f(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected event was not published")
}

/// All events up to and including the first one accepted by `f`
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<DiagEvent>, mut f: F) -> Vec<DiagEvent>
where
    F: FnMut(&DiagEvent) -> bool,
{
    let mut seen = Vec::new();
    next_event(rx, |e| {
        seen.push(e.clone());
        f(e)
    })
    .await;
    seen
}

/// Poll `condition` until it holds
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached");
}

/// Every event published so far
pub fn drain(rx: &mut broadcast::Receiver<DiagEvent>) -> Vec<DiagEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// One request as seen by a scripted client
#[derive(Debug, Clone)]
pub struct Call {
    pub payload: Vec<u8>,
    pub profile: TimeoutProfile,
}

/// Behavior shared by all clients a [`ScriptedFactory`] builds
#[derive(Default)]
pub struct Script {
    pub calls: Mutex<Vec<Call>>,
    /// Errors returned instead of a response, by service id
    pub failures: Mutex<HashMap<u8, UdsError>>,
    pub blocker_started: Notify,
    pub release: Notify,
}

impl Script {
    pub fn fail(&self, sid: u8, err: UdsError) {
        self.failures.lock().insert(sid, err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.calls.lock().iter().map(|c| c.payload.clone()).collect()
    }
}

/// Client double that echoes a positive response and records the timeout
/// profile in force at dispatch.
///
/// Like some third-party stacks it forgets its timeouts after every request,
/// so only a re-assertion before each dispatch keeps them right.
pub struct ScriptedClient {
    script: Arc<Script>,
    profile: Mutex<TimeoutProfile>,
}

#[async_trait]
impl UdsClient for ScriptedClient {
    fn apply_timeouts(&self, profile: &TimeoutProfile) {
        *self.profile.lock() = *profile;
    }

    fn timeouts(&self) -> TimeoutProfile {
        *self.profile.lock()
    }

    async fn request(&self, request: &[u8]) -> Result<Vec<u8>, UdsError> {
        let profile = std::mem::take(&mut *self.profile.lock());
        self.script.calls.lock().push(Call {
            payload: request.to_vec(),
            profile,
        });

        if request == BLOCKER {
            self.script.blocker_started.notify_one();
            self.script.release.notified().await;
        }
        if let Some(err) = self.script.failures.lock().get(&request[0]).cloned() {
            return Err(err);
        }
        let mut response = vec![request[0] + 0x40];
        response.extend_from_slice(&request[1..]);
        Ok(response)
    }

    async fn send_only(&self, request: &[u8]) -> Result<(), UdsError> {
        self.request(request).await.map(|_| ())
    }

    fn close(&self) {
        self.script.release.notify_waiters();
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    pub script: Arc<Script>,
    pub built: Mutex<usize>,
}

impl ScriptedFactory {
    pub fn built(&self) -> usize {
        *self.built.lock()
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(
        &self,
        _bridge: Arc<FrameBridge>,
        _addressing: Addressing,
    ) -> Result<Arc<dyn UdsClient>, UdsError> {
        *self.built.lock() += 1;
        Ok(Arc::new(ScriptedClient {
            script: self.script.clone(),
            profile: Mutex::new(TimeoutProfile::default()),
        }))
    }
}
