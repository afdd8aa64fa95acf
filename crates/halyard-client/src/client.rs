//! Connection factory and failover-aware connections

use crate::config::FailoverConfig;
use crate::events::ClientEvent;
use crate::failover::{ConnectionCore, FailoverController};
use crate::monitor::{ConnectionMonitor, ConnectionState, ConnectionStatus};
use crate::rebind::SessionRebinder;
use crate::transport::TransportConnector;
use crate::{Error, Result};
use halyard_topology::{ConnectionId, Connector, TopologyDispatcher, TopologyRegistry};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection factory
///
/// Owns the topology registry shared by every connection it creates, and the
/// shutdown token that stops their failover workers. Dropping the client
/// closes its connections.
pub struct ClusterClient<T: TransportConnector> {
    config: Arc<FailoverConfig>,
    transport: Arc<T>,
    registry: Arc<TopologyRegistry>,
    dispatcher: TopologyDispatcher,
    shutdown: CancellationToken,
}

impl<T: TransportConnector> ClusterClient<T> {
    pub fn new(config: FailoverConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(TopologyRegistry::new());
        Ok(Self {
            config: Arc::new(config),
            transport: Arc::new(transport),
            dispatcher: TopologyDispatcher::new(registry.clone()),
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    /// Handler the protocol layer feeds topology notifications into
    pub fn response_handler(&self) -> TopologyDispatcher {
        self.dispatcher.clone()
    }

    /// Establish a failover-aware connection.
    ///
    /// Tries the static connectors in order, then any live node the registry
    /// already knows, once each. `rebinder` runs after every later failover.
    pub async fn connect<R>(&self, rebinder: R) -> Result<ClusterConnection<T>>
    where
        R: SessionRebinder<T::Connection>,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let candidates = self.bootstrap_candidates();
        let Some(first) = candidates.first() else {
            return Err(Error::AllServersUnavailable);
        };

        let id = ConnectionId::next();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_channel_capacity);
        let monitor = ConnectionMonitor::connecting(id, first.clone(), requests_tx, events.clone());

        let mut conn = None;
        for target in &candidates {
            let reporter = monitor.reporter_for(1);
            match timeout(self.config.connect_timeout, self.transport.connect(target, reporter)).await {
                Ok(Ok(c)) => {
                    conn = Some((Arc::new(c), target.clone()));
                    break;
                }
                Ok(Err(e)) => warn!(connection = %id, target = %target, "Bootstrap connect failed: {}", e),
                Err(_) => warn!(connection = %id, target = %target, "Bootstrap connect timed out"),
            }
        }
        let Some((conn, target)) = conn else {
            monitor.mark_closed();
            return Err(Error::AllServersUnavailable);
        };

        let node_id = self
            .registry
            .current_view()
            .node_for_connector(&target)
            .map(|entry| entry.node_id.clone());
        monitor.mark_connected(1, target.clone(), node_id);
        info!(connection = %id, target = %target, "Connected");

        let core = Arc::new(ConnectionCore {
            id,
            monitor: monitor.clone(),
            current: RwLock::new(Some(conn)),
            events,
            cancel: self.shutdown.child_token(),
            subscription: Mutex::new(None),
        });
        *core.subscription.lock() = Some(self.registry.subscribe(monitor));

        let controller = FailoverController::new(
            core.clone(),
            self.config.clone(),
            self.registry.clone(),
            self.transport.clone(),
            Arc::new(rebinder),
        );
        let worker = tokio::spawn(async move { controller.run(requests_rx).await });

        Ok(ClusterConnection {
            core,
            registry: self.registry.clone(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop every connection created by this client
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing cluster client");
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn bootstrap_candidates(&self) -> Vec<Connector> {
        let mut candidates = self.config.static_connectors.clone();
        let view = self.registry.current_view();
        let mut live: Vec<_> = view
            .live_nodes()
            .into_iter()
            .map(|entry| (entry.node_id.clone(), entry.live_connector.clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, connector) in live {
            if !candidates.contains(&connector) {
                candidates.push(connector);
            }
        }
        candidates
    }
}

impl<T: TransportConnector> Drop for ClusterClient<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Logical connection that survives node failures
///
/// The underlying transport changes across failovers; fetch it with
/// [`current`](Self::current) instead of holding on to it.
pub struct ClusterConnection<T: TransportConnector> {
    core: Arc<ConnectionCore<T::Connection>>,
    registry: Arc<TopologyRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: TransportConnector> ClusterConnection<T> {
    pub fn id(&self) -> ConnectionId {
        self.core.id
    }

    pub fn state(&self) -> ConnectionState {
        self.core.monitor.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.monitor.status()
    }

    /// Monitor of this connection, for reporting faults seen by the application
    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.core.monitor
    }

    /// Current transport; `None` while reconnecting, failed or closed
    pub fn current(&self) -> Option<Arc<T::Connection>> {
        self.core.current.read().clone()
    }

    /// Failover lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.events.subscribe()
    }

    /// Start a new bounded reconnection loop for a FAILED connection.
    ///
    /// Returns false if the connection is not FAILED.
    pub fn retry(&self) -> Result<bool> {
        if self.core.cancel.is_cancelled() || self.status() == ConnectionStatus::Closed {
            return Err(Error::Closed);
        }
        let restarted = self.core.monitor.restart();
        if restarted {
            info!(connection = %self.core.id, "Reconnection re-initiated by application");
        }
        Ok(restarted)
    }

    /// Stop the failover worker and release the transport
    pub async fn close(&self) {
        self.core.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.core.shutdown(&self.registry);
    }
}

impl<T: TransportConnector> Drop for ClusterConnection<T> {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

impl<T: TransportConnector> std::fmt::Debug for ClusterConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}
