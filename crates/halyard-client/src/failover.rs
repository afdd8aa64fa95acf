//! Failover controller
//!
//! One controller runs per logical connection, on its own tokio task. It
//! consumes [`FailoverRequest`]s from the connection's monitor one at a
//! time, so there is never more than one reconnection loop per connection.
//!
//! Each episode makes up to `max_reconnect_attempts` attempts. Every attempt
//! resolves its target from a fresh registry snapshot (or the static
//! fallback list), connects under `connect_timeout`, and on failure waits
//! the configured delay before the next one. Shutdown aborts the loop at any
//! await point, including the delay.

use crate::config::FailoverConfig;
use crate::events::ClientEvent;
use crate::monitor::{ConnectionMonitor, ConnectionStatus, FailoverRequest};
use crate::observability::FailoverMetrics;
use crate::rebind::SessionRebinder;
use crate::transport::{TransportConnection, TransportConnector};
use crate::{Error, Result};
use halyard_topology::{
    ConnectionId, Connector, NodeId, SubscriptionId, TopologyRegistry, TopologySnapshot,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a reconnection target came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    /// Backup or scale-down target from the registry
    Topology,
    /// Static fallback list
    Static,
}

impl TargetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetSource::Topology => "topology",
            TargetSource::Static => "static",
        }
    }
}

/// Target chosen for one reconnection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub connector: Connector,
    /// Node the connector belongs to, if the registry knows it
    pub node_id: Option<NodeId>,
    pub source: TargetSource,
}

/// State shared between a [`ClusterConnection`](crate::ClusterConnection)
/// handle and its controller
pub(crate) struct ConnectionCore<C> {
    pub(crate) id: ConnectionId,
    pub(crate) monitor: Arc<ConnectionMonitor>,
    pub(crate) current: RwLock<Option<Arc<C>>>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) subscription: Mutex<Option<SubscriptionId>>,
}

impl<C: TransportConnection> ConnectionCore<C> {
    /// Close the transport, leave the registry and go CLOSED. Idempotent.
    pub(crate) fn shutdown(&self, registry: &TopologyRegistry) {
        self.cancel.cancel();
        self.monitor.mark_closed();

        if let Some(subscription) = self.subscription.lock().take() {
            registry.unsubscribe(subscription);
            debug!(connection = %self.id, "Connection closed");
        }
        if let Some(conn) = self.current.write().take() {
            conn.close();
        }
    }
}

enum AttemptOutcome<C> {
    Connected(Arc<C>, ResolvedTarget),
    Failed(Error, Option<TargetSource>),
}

/// Per-connection reconnection state machine
pub struct FailoverController<T: TransportConnector> {
    core: Arc<ConnectionCore<T::Connection>>,
    config: Arc<FailoverConfig>,
    registry: Arc<TopologyRegistry>,
    transport: Arc<T>,
    rebinder: Arc<dyn SessionRebinder<T::Connection>>,
}

impl<T: TransportConnector> FailoverController<T> {
    pub(crate) fn new(
        core: Arc<ConnectionCore<T::Connection>>,
        config: Arc<FailoverConfig>,
        registry: Arc<TopologyRegistry>,
        transport: Arc<T>,
        rebinder: Arc<dyn SessionRebinder<T::Connection>>,
    ) -> Self {
        Self {
            core,
            config,
            registry,
            transport,
            rebinder,
        }
    }

    /// Worker loop: handle requests until the connection is closed
    pub async fn run(&self, mut requests: mpsc::UnboundedReceiver<FailoverRequest>) {
        let cancel = self.core.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.failover(request) => {}
                    }
                }
            }
        }

        self.core.shutdown(&self.registry);
        debug!(connection = %self.core.id, "Failover worker stopped");
    }

    /// Target for attempt `attempt` (1-based) of the episode handling `request`
    pub fn resolve_target(&self, request: &FailoverRequest, attempt: u32) -> Option<ResolvedTarget> {
        resolve_in_view(&self.registry.current_view(), &self.config, request, attempt)
    }

    async fn failover(&self, request: FailoverRequest) {
        let monitor = &self.core.monitor;
        if monitor.status() != ConnectionStatus::Reconnecting {
            debug!(connection = %self.core.id, "Dropping failover request, not reconnecting");
            return;
        }

        let started = Instant::now();
        let max_attempts = self.config.max_reconnect_attempts;
        let generation = monitor.next_generation();

        if let Some(old) = self.core.current.write().take() {
            old.close();
        }

        for attempt in 1..=max_attempts {
            match self.attempt(&request, attempt, generation).await {
                AttemptOutcome::Connected(conn, target) => {
                    self.complete(conn, target, attempt, generation, started).await;
                    return;
                }
                AttemptOutcome::Failed(e, source) => {
                    warn!(
                        connection = %self.core.id,
                        node_id = ?request.lost_node_id,
                        attempt,
                        max_attempts,
                        "Reconnection attempt failed: {}",
                        e
                    );
                    FailoverMetrics::increment_attempt_failed(
                        source.map(|s| s.as_str()).unwrap_or("none"),
                    );
                    monitor.record_attempt(attempt);

                    if attempt < max_attempts {
                        sleep(self.config.reconnect_delay.delay_for(attempt)).await;
                    }
                }
            }
        }

        monitor.mark_failed();
        error!(
            connection = %self.core.id,
            node_id = ?request.lost_node_id,
            attempts = max_attempts,
            "Failover failed, all reconnection attempts exhausted"
        );
        FailoverMetrics::increment_failed();
        let _ = self.core.events.send(ClientEvent::FailoverFailed {
            connection: self.core.id,
            node_id: request.lost_node_id.clone(),
            attempts: max_attempts,
        });
    }

    async fn attempt(
        &self,
        request: &FailoverRequest,
        attempt: u32,
        generation: u64,
    ) -> AttemptOutcome<T::Connection> {
        let Some(target) = self.resolve_target(request, attempt) else {
            return AttemptOutcome::Failed(
                Error::NoFailoverTarget(request.lost_node_id.clone()),
                None,
            );
        };

        debug!(
            connection = %self.core.id,
            attempt,
            target = %target.connector,
            source = target.source.as_str(),
            "Attempting reconnection"
        );

        let reporter = self.core.monitor.reporter_for(generation);
        let connect_timeout = self.config.connect_timeout;
        let result = timeout(connect_timeout, self.transport.connect(&target.connector, reporter)).await;

        match result {
            Ok(Ok(conn)) => AttemptOutcome::Connected(Arc::new(conn), target),
            Ok(Err(e)) => AttemptOutcome::Failed(e, Some(target.source)),
            Err(_) => AttemptOutcome::Failed(
                Error::ConnectTimeout {
                    target: target.connector,
                    timeout: connect_timeout,
                },
                Some(target.source),
            ),
        }
    }

    async fn complete(
        &self,
        conn: Arc<T::Connection>,
        target: ResolvedTarget,
        attempt: u32,
        generation: u64,
        started: Instant,
    ) {
        let monitor = &self.core.monitor;
        if !monitor.mark_connected(generation, target.connector.clone(), target.node_id.clone()) {
            // Closed meanwhile, or the new transport already failed and a
            // fresh episode is queued
            conn.close();
            return;
        }

        if let Some(old) = self.core.current.write().replace(conn.clone()) {
            old.close();
        }

        let node_id = monitor.state().target_node_id;
        if let Err(e) = self.rebind(conn).await {
            warn!(
                connection = %self.core.id,
                target = %target.connector,
                "Session rebind failed: {}",
                e
            );
            FailoverMetrics::increment_rebind_failed();
            let _ = self.core.events.send(ClientEvent::RebindFailed {
                connection: self.core.id,
                target: target.connector,
                reason: e.to_string(),
            });
            return;
        }

        let elapsed = started.elapsed();
        info!(
            connection = %self.core.id,
            node_id = ?node_id,
            target = %target.connector,
            attempts = attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            "Failover completed"
        );
        FailoverMetrics::increment_completed();
        FailoverMetrics::record_failover_duration(elapsed);
        let _ = self.core.events.send(ClientEvent::FailoverCompleted {
            connection: self.core.id,
            node_id,
            target: target.connector,
            attempts: attempt,
            elapsed,
        });
    }

    async fn rebind(&self, conn: Arc<T::Connection>) -> Result<()> {
        self.rebinder
            .rebind(conn)
            .await
            .map_err(|e| match e {
                Error::RebindFailed(_) => e,
                other => Error::RebindFailed(other.to_string()),
            })
    }
}

/// Pick the target for one attempt from a registry snapshot and the config.
///
/// With `prefer_topology_backup` the registry's answer wins and the static
/// list is the fallback. Without it the static list wins and the registry is
/// only consulted when the list is empty.
pub(crate) fn resolve_in_view(
    view: &TopologySnapshot,
    config: &FailoverConfig,
    request: &FailoverRequest,
    attempt: u32,
) -> Option<ResolvedTarget> {
    let from_topology = || {
        let node_id = request.lost_node_id.as_deref()?;
        let connector = view.resolve_target(node_id)?;
        let owner = view
            .node_for_connector(&connector)
            .map(|entry| entry.node_id.clone())
            .or_else(|| request.lost_node_id.clone());
        Some(ResolvedTarget {
            connector,
            node_id: owner,
            source: TargetSource::Topology,
        })
    };

    let from_static = || {
        let dead = request
            .lost_node_id
            .as_deref()
            .and_then(|id| view.get(id))
            .filter(|entry| !entry.is_up())
            .map(|entry| &entry.live_connector);
        let connector =
            static_candidate(&config.static_connectors, &request.lost_connector, dead, attempt)?
                .clone();
        let node_id = view
            .node_for_connector(&connector)
            .map(|entry| entry.node_id.clone());
        Some(ResolvedTarget {
            connector,
            node_id,
            source: TargetSource::Static,
        })
    };

    if config.prefer_topology_backup {
        from_topology().or_else(from_static)
    } else {
        from_static().or_else(from_topology)
    }
}

/// Round-robin over the static list, starting after the lost connector.
///
/// `dead` (the live address of a node known to be DOWN) is skipped unless
/// it is the only entry.
fn static_candidate<'a>(
    list: &'a [Connector],
    lost: &Connector,
    dead: Option<&Connector>,
    attempt: u32,
) -> Option<&'a Connector> {
    let mut usable: Vec<&Connector> = list.iter().filter(|c| Some(*c) != dead).collect();
    if usable.is_empty() {
        usable = list.iter().collect();
    }
    if usable.is_empty() {
        return None;
    }
    let start = usable
        .iter()
        .position(|c| *c == lost)
        .map(|i| i + 1)
        .unwrap_or(0);
    let offset = attempt.saturating_sub(1) as usize;
    Some(usable[(start + offset) % usable.len()])
}
