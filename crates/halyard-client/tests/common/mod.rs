//! Test doubles for failover tests

#![allow(dead_code)]

use async_trait::async_trait;
use halyard_client::{
    ClientEvent, ClusterClient, ClusterConnection, Error, FailoverConfig, FaultCause,
    FaultReporter, Result, SessionRebinder, TransportConnection, TransportConnector,
};
use halyard_topology::{ConnectionId, Connector};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("halyard_client=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// What a scripted connect call does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    /// Never completes; the caller's timeout fires
    Hang,
}

type AttemptHook = Box<dyn Fn(usize, &Connector) + Send + Sync>;

struct MockState {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    attempts: Mutex<Vec<Connector>>,
    hook: Mutex<Option<AttemptHook>>,
}

/// Transport connector that follows a per-call script and records targets
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Calls follow `script`, then always `fallback`
    pub fn scripted(script: impl IntoIterator<Item = Outcome>, fallback: Outcome) -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(script.into_iter().collect()),
                fallback: Mutex::new(fallback),
                attempts: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Accept the bootstrap connect, then apply `rest`, then refuse
    pub fn after_bootstrap(rest: impl IntoIterator<Item = Outcome>) -> Self {
        let script = std::iter::once(Outcome::Accept).chain(rest);
        Self::scripted(script, Outcome::Refuse)
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        *self.state.fallback.lock() = outcome;
    }

    /// Run `hook(n, target)` at the start of the n-th recorded call (1-based)
    pub fn on_attempt<F>(&self, hook: F)
    where
        F: Fn(usize, &Connector) + Send + Sync + 'static,
    {
        *self.state.hook.lock() = Some(Box::new(hook));
    }

    /// Targets of recorded calls, in order
    pub fn attempts(&self) -> Vec<Connector> {
        self.state.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.state.attempts.lock().len()
    }

    /// Forget recorded calls (typically the bootstrap connect)
    pub fn reset_attempts(&self) {
        self.state.attempts.lock().clear();
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, target: &Connector, faults: FaultReporter) -> Result<MockConnection> {
        let n = {
            let mut attempts = self.state.attempts.lock();
            attempts.push(target.clone());
            attempts.len()
        };
        if let Some(hook) = self.state.hook.lock().as_ref() {
            hook(n, target);
        }

        let outcome = self
            .state
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.state.fallback.lock());

        match outcome {
            Outcome::Accept => Ok(MockConnection {
                id: ConnectionId::next(),
                remote: target.clone(),
                faults,
                closed: AtomicBool::new(false),
            }),
            Outcome::Refuse => Err(Error::ConnectionError(format!("{} refused", target))),
            Outcome::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Connection whose faults are injected by the test
pub struct MockConnection {
    id: ConnectionId,
    remote: Connector,
    faults: FaultReporter,
    closed: AtomicBool,
}

impl MockConnection {
    /// Simulate the peer dropping the connection
    pub fn fail(&self) -> bool {
        self.faults.report(FaultCause::Disconnected)
    }

    /// Simulate a write error
    pub fn fail_write(&self) -> bool {
        self.faults.report(FaultCause::Transport("broken pipe".into()))
    }

    pub fn generation(&self) -> u64 {
        self.faults.generation()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &Connector {
        &self.remote
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Rebinder that counts calls and can be told to fail
#[derive(Clone, Default)]
pub struct RecordingRebinder {
    calls: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<Connector>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingRebinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let rebinder = Self::default();
        rebinder.fail.store(true, Ordering::SeqCst);
        rebinder
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<Connector> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl SessionRebinder<MockConnection> for RecordingRebinder {
    async fn rebind(&self, connection: Arc<MockConnection>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(connection.remote().clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::RebindFailed("session recreation refused".into()));
        }
        Ok(())
    }
}

pub fn connector(host: &str) -> Connector {
    Connector::new(host, 61616)
}

/// Fixed 500ms delay, 10 attempts, 1s connect timeout
pub fn config_with(static_connectors: Vec<Connector>) -> FailoverConfig {
    FailoverConfig::builder()
        .static_connectors(static_connectors)
        .connect_timeout(Duration::from_secs(1))
        .build()
}

/// Connect through `mock`, then forget the bootstrap call
pub async fn connect(
    config: FailoverConfig,
    mock: &MockConnector,
    rebinder: RecordingRebinder,
) -> (ClusterClient<MockConnector>, ClusterConnection<MockConnector>) {
    let client = ClusterClient::new(config, mock.clone()).unwrap();
    let connection = client.connect(rebinder).await.unwrap();
    mock.reset_attempts();
    (client, connection)
}

/// Like [`connect`], with the registry seeded before connecting
pub async fn connect_with_topology<F>(
    config: FailoverConfig,
    mock: &MockConnector,
    rebinder: RecordingRebinder,
    seed: F,
) -> (ClusterClient<MockConnector>, ClusterConnection<MockConnector>)
where
    F: FnOnce(&ClusterClient<MockConnector>),
{
    let client = ClusterClient::new(config, mock.clone()).unwrap();
    seed(&client);
    let connection = client.connect(rebinder).await.unwrap();
    mock.reset_attempts();
    (client, connection)
}

/// Collect events up to and including the first terminal one
pub async fn until_terminal(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("no terminal event within an hour")
            .expect("event channel closed");
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}
