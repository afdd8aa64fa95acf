//! Fault detection for one logical connection
//!
//! The monitor owns the connection's [`ConnectionState`]. It is the only
//! place where CONNECTED turns into RECONNECTING, and it raises exactly one
//! [`FailoverRequest`] per fault episode:
//!
//! - Every successful (re)connection starts a new *generation*.
//! - Transports report faults through a [`FaultReporter`] stamped with the
//!   generation they belong to.
//! - The first report for the current generation opens the episode; later
//!   reports (the read path and the write path both noticing the same dead
//!   socket, a NodeDown for the same node) are coalesced, and reports from
//!   abandoned transports are dropped as stale.
//!
//! A fault reported by a brand-new transport before the controller has
//! marked it connected is remembered and replayed the moment it is, so the
//! early failure is not lost.

use crate::events::ClientEvent;
use crate::observability::FailoverMetrics;
use halyard_topology::{ConnectionId, Connector, NodeId, TopologyChange, TopologyListener};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Why a connection was considered lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCause {
    /// Read or write error on the transport
    Transport(String),
    /// The peer closed the connection
    Disconnected,
    /// The topology reported the connected node down
    NodeDown,
    /// The server is scaling the connected node down
    ScaleDown { target: Option<NodeId> },
    /// The application asked to reconnect a FAILED connection
    Manual,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::Transport(e) => write!(f, "transport error: {}", e),
            FaultCause::Disconnected => f.write_str("disconnected by peer"),
            FaultCause::NodeDown => f.write_str("node down"),
            FaultCause::ScaleDown { target: Some(t) } => write!(f, "scale-down to {}", t),
            FaultCause::ScaleDown { target: None } => f.write_str("scale-down"),
            FaultCause::Manual => f.write_str("manual reconnect"),
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    /// Retries exhausted. Only the application can leave this state.
    Failed,
    /// Closed by the application. Terminal.
    Closed,
}

/// Observable state of one logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Node the connection serves, once known
    pub target_node_id: Option<NodeId>,
    /// Address of the current (or last) transport
    pub target: Connector,
    pub status: ConnectionStatus,
    /// Failed attempts in the current or last failover episode
    pub attempt_count: u32,
    /// Incremented on every successful (re)connection
    pub generation: u64,
}

/// Work item for the failover controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    /// Generation that was lost
    pub generation: u64,
    pub lost_node_id: Option<NodeId>,
    pub lost_connector: Connector,
    pub cause: FaultCause,
}

struct MonitorState {
    state: ConnectionState,
    /// Fault from a transport not yet marked connected
    early_fault: Option<(u64, FaultCause)>,
}

/// Owns a connection's state and turns faults into failover requests
pub struct ConnectionMonitor {
    id: ConnectionId,
    inner: Mutex<MonitorState>,
    requests: mpsc::UnboundedSender<FailoverRequest>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConnectionMonitor {
    /// Monitor for a connection that is already established (generation 1)
    pub fn new(
        id: ConnectionId,
        target: Connector,
        target_node_id: Option<NodeId>,
        requests: mpsc::UnboundedSender<FailoverRequest>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Self::with_state(
            id,
            ConnectionState {
                target_node_id,
                target,
                status: ConnectionStatus::Connected,
                attempt_count: 0,
                generation: 1,
            },
            requests,
            events,
        )
    }

    /// Monitor for a connection whose first transport is still being
    /// established; [`mark_connected`](Self::mark_connected) with generation
    /// 1 completes it.
    pub(crate) fn connecting(
        id: ConnectionId,
        target: Connector,
        requests: mpsc::UnboundedSender<FailoverRequest>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Self::with_state(
            id,
            ConnectionState {
                target_node_id: None,
                target,
                status: ConnectionStatus::Reconnecting,
                attempt_count: 0,
                generation: 0,
            },
            requests,
            events,
        )
    }

    fn with_state(
        id: ConnectionId,
        state: ConnectionState,
        requests: mpsc::UnboundedSender<FailoverRequest>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(MonitorState {
                state,
                early_fault: None,
            }),
            requests,
            events,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().state.status
    }

    /// Reporter bound to the current generation
    pub fn reporter(self: &Arc<Self>) -> FaultReporter {
        let generation = self.inner.lock().state.generation;
        self.reporter_for(generation)
    }

    pub(crate) fn reporter_for(self: &Arc<Self>, generation: u64) -> FaultReporter {
        FaultReporter {
            monitor: Arc::downgrade(self),
            generation,
        }
    }

    /// Report a fault seen by the transport of `generation`.
    ///
    /// Returns true if this report opened a new failover episode.
    pub fn report_fault(&self, generation: u64, cause: FaultCause) -> bool {
        let request = {
            let mut inner = self.inner.lock();
            let current = inner.state.generation;
            let status = inner.state.status;
            match status {
                ConnectionStatus::Connected if generation == current => {
                    Some(begin_episode(&mut inner.state, cause))
                }
                ConnectionStatus::Reconnecting if generation > current => {
                    if inner.early_fault.is_none() {
                        inner.early_fault = Some((generation, cause));
                    }
                    None
                }
                status => {
                    debug!(
                        connection = %self.id,
                        generation,
                        current,
                        ?status,
                        %cause,
                        "Coalescing fault report"
                    );
                    FailoverMetrics::increment_coalesced();
                    None
                }
            }
        };

        match request {
            Some(request) => {
                self.publish(request);
                true
            }
            None => false,
        }
    }

    /// Generation the next successful connection will carry
    pub(crate) fn next_generation(&self) -> u64 {
        self.inner.lock().state.generation + 1
    }

    pub(crate) fn record_attempt(&self, attempt: u32) {
        let mut inner = self.inner.lock();
        if inner.state.status == ConnectionStatus::Reconnecting {
            inner.state.attempt_count = attempt;
        }
    }

    /// RECONNECTING -> CONNECTED with a new transport.
    ///
    /// Returns false if the connection was closed meanwhile, or if the new
    /// transport already reported a fault (a new episode is then open).
    pub(crate) fn mark_connected(
        &self,
        generation: u64,
        target: Connector,
        target_node_id: Option<NodeId>,
    ) -> bool {
        let request = {
            let mut inner = self.inner.lock();
            if inner.state.status != ConnectionStatus::Reconnecting {
                return false;
            }
            inner.state.status = ConnectionStatus::Connected;
            inner.state.generation = generation;
            inner.state.target = target;
            if target_node_id.is_some() {
                inner.state.target_node_id = target_node_id;
            }

            match inner.early_fault.take() {
                Some((fault_gen, cause)) if fault_gen == generation => {
                    Some(begin_episode(&mut inner.state, cause))
                }
                _ => None,
            }
        };

        match request {
            Some(request) => {
                self.publish(request);
                false
            }
            None => true,
        }
    }

    /// RECONNECTING -> FAILED
    pub(crate) fn mark_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.state.status == ConnectionStatus::Reconnecting {
            inner.state.status = ConnectionStatus::Failed;
            inner.early_fault = None;
        }
    }

    pub(crate) fn mark_closed(&self) {
        let mut inner = self.inner.lock();
        inner.state.status = ConnectionStatus::Closed;
        inner.early_fault = None;
    }

    /// FAILED -> RECONNECTING on explicit application request
    pub(crate) fn restart(&self) -> bool {
        let request = {
            let mut inner = self.inner.lock();
            if inner.state.status != ConnectionStatus::Failed {
                return false;
            }
            begin_episode(&mut inner.state, FaultCause::Manual)
        };
        self.publish(request);
        true
    }

    fn publish(&self, request: FailoverRequest) {
        warn!(
            connection = %self.id,
            node_id = ?request.lost_node_id,
            target = %request.lost_connector,
            cause = %request.cause,
            "Connection lost, failover requested"
        );
        FailoverMetrics::increment_requested();

        let _ = self.events.send(ClientEvent::FailoverRequested {
            connection: self.id,
            node_id: request.lost_node_id.clone(),
            cause: request.cause.clone(),
        });

        if self.requests.send(request).is_err() {
            debug!(connection = %self.id, "Failover worker gone, request dropped");
        }
    }

    /// Raise a fault if the connection is on the live server of `node_id`.
    ///
    /// A connection that already failed over to the node's backup is not
    /// affected by the live server going away.
    fn fault_if_serving(&self, node_id: &str, live_connector: &Connector, cause: FaultCause) {
        let request = {
            let mut inner = self.inner.lock();
            let on_node = inner.state.status == ConnectionStatus::Connected
                && inner.state.target_node_id.as_deref() == Some(node_id);
            if !on_node {
                return;
            }
            if inner.state.target != *live_connector {
                debug!(
                    connection = %self.id,
                    node_id,
                    target = %inner.state.target,
                    %cause,
                    "Ignoring topology fault, not on the node's live server"
                );
                return;
            }
            begin_episode(&mut inner.state, cause)
        };
        self.publish(request);
    }
}

/// CONNECTED -> RECONNECTING; builds the request for the lost generation
fn begin_episode(state: &mut ConnectionState, cause: FaultCause) -> FailoverRequest {
    state.status = ConnectionStatus::Reconnecting;
    state.attempt_count = 0;
    FailoverRequest {
        generation: state.generation,
        lost_node_id: state.target_node_id.clone(),
        lost_connector: state.target.clone(),
        cause,
    }
}

impl TopologyListener for ConnectionMonitor {
    fn on_topology_change(&self, change: &TopologyChange) {
        match change {
            TopologyChange::NodeDown(entry) => {
                self.fault_if_serving(&entry.node_id, &entry.live_connector, FaultCause::NodeDown);
            }
            TopologyChange::NodeDisconnected {
                node_id,
                live_connector,
                scale_down_target,
            } => {
                self.fault_if_serving(
                    node_id,
                    live_connector,
                    FaultCause::ScaleDown {
                        target: scale_down_target.clone(),
                    },
                );
            }
            TopologyChange::NodeUp(entry) => {
                let mut inner = self.inner.lock();
                if inner.state.target_node_id.is_none() && entry.serves(&inner.state.target) {
                    debug!(connection = %self.id, node_id = %entry.node_id, "Learned connected node");
                    inner.state.target_node_id = Some(entry.node_id.clone());
                }
            }
            TopologyChange::Synchronized => {
                let _ = self.events.send(ClientEvent::TopologySynchronized);
            }
        }
    }
}

/// Handle a transport uses to report faults on itself
#[derive(Clone)]
pub struct FaultReporter {
    monitor: Weak<ConnectionMonitor>,
    generation: u64,
}

impl FaultReporter {
    /// Reporter attached to no monitor; reports go nowhere
    pub fn detached() -> Self {
        Self {
            monitor: Weak::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if this report opened a failover episode
    pub fn report(&self, cause: FaultCause) -> bool {
        match self.monitor.upgrade() {
            Some(monitor) => monitor.report_fault(self.generation, cause),
            None => false,
        }
    }
}

impl fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReporter")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_topology::{NodeDisconnected, NodeDown, NodeUp, TopologyRegistry};

    fn monitor() -> (
        Arc<ConnectionMonitor>,
        mpsc::UnboundedReceiver<FailoverRequest>,
        broadcast::Receiver<ClientEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = broadcast::channel(16);
        let monitor = ConnectionMonitor::new(
            ConnectionId::from_raw(1),
            Connector::new("live", 1),
            Some("node-1".into()),
            tx,
            events,
        );
        (monitor, rx, events_rx)
    }

    #[test]
    fn test_duplicate_reports_coalesce() {
        let (monitor, mut rx, mut events) = monitor();
        let read_path = monitor.reporter();
        let write_path = monitor.reporter();

        assert!(read_path.report(FaultCause::Disconnected));
        assert!(!write_path.report(FaultCause::Transport("broken pipe".into())));
        assert!(!monitor.report_fault(1, FaultCause::NodeDown));

        let request = rx.try_recv().unwrap();
        assert_eq!(request.generation, 1);
        assert_eq!(request.lost_node_id.as_deref(), Some("node-1"));
        assert_eq!(request.cause, FaultCause::Disconnected);
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::FailoverRequested { cause: FaultCause::Disconnected, .. }
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(monitor.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_concurrent_reports_single_episode() {
        let (monitor, mut rx, _events) = monitor();

        std::thread::scope(|s| {
            for i in 0..8 {
                let reporter = monitor.reporter();
                s.spawn(move || reporter.report(FaultCause::Transport(format!("path {}", i))));
            }
        });

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_generation_ignored() {
        let (monitor, mut rx, _events) = monitor();
        let old = monitor.reporter();

        assert!(old.report(FaultCause::Disconnected));
        rx.try_recv().unwrap();
        assert!(monitor.mark_connected(2, Connector::new("backup", 1), None));

        // Late report from the abandoned transport
        assert!(!old.report(FaultCause::Transport("late".into())));
        assert_eq!(monitor.status(), ConnectionStatus::Connected);
        assert!(rx.try_recv().is_err());

        let state = monitor.state();
        assert_eq!(state.generation, 2);
        assert_eq!(state.target, Connector::new("backup", 1));
        assert_eq!(state.target_node_id.as_deref(), Some("node-1"));
    }

    #[test]
    fn test_early_fault_replayed_on_connect() {
        let (monitor, mut rx, _events) = monitor();
        monitor.reporter().report(FaultCause::Disconnected);
        rx.try_recv().unwrap();

        let next = monitor.next_generation();
        let fresh = monitor.reporter_for(next);
        assert!(!fresh.report(FaultCause::Disconnected));

        assert!(!monitor.mark_connected(next, Connector::new("backup", 1), None));
        assert_eq!(monitor.status(), ConnectionStatus::Reconnecting);
        let request = rx.try_recv().unwrap();
        assert_eq!(request.generation, next);
        assert_eq!(request.lost_connector, Connector::new("backup", 1));
    }

    #[test]
    fn test_failed_is_terminal_until_restart() {
        let (monitor, mut rx, _events) = monitor();
        monitor.reporter().report(FaultCause::Disconnected);
        rx.try_recv().unwrap();

        monitor.record_attempt(10);
        monitor.mark_failed();
        assert_eq!(monitor.status(), ConnectionStatus::Failed);
        assert_eq!(monitor.state().attempt_count, 10);

        assert!(!monitor.report_fault(1, FaultCause::NodeDown));
        assert!(rx.try_recv().is_err());

        assert!(monitor.restart());
        assert!(!monitor.restart());
        assert_eq!(rx.try_recv().unwrap().cause, FaultCause::Manual);
        assert_eq!(monitor.state().attempt_count, 0);
    }

    #[test]
    fn test_closed_ignores_everything() {
        let (monitor, mut rx, _events) = monitor();
        monitor.mark_closed();

        assert!(!monitor.reporter().report(FaultCause::Disconnected));
        assert!(!monitor.restart());
        assert!(!monitor.mark_connected(2, Connector::new("x", 1), None));
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn test_topology_triggers() {
        let (monitor, mut rx, mut events) = monitor();
        let registry = TopologyRegistry::new();
        registry.subscribe(monitor.clone());

        registry.apply_node_up(NodeUp::new(1, "node-1", Connector::new("live", 1)).last());
        registry.apply_node_up(NodeUp::new(2, "node-2", Connector::new("other", 2)));
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::TopologySynchronized
        ));

        // Another node going down is not our concern
        registry.apply_node_down(NodeDown::new(3, "node-2"));
        assert!(rx.try_recv().is_err());

        registry.apply_node_disconnected(NodeDisconnected::new("node-1", Some("node-2".into())));
        assert_eq!(
            rx.try_recv().unwrap().cause,
            FaultCause::ScaleDown {
                target: Some("node-2".into())
            }
        );

        // Same episode: NodeDown is coalesced
        registry.apply_node_down(NodeDown::new(4, "node-1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_topology_faults_spare_backup_connection() {
        let (monitor, mut rx, _events) = monitor();
        let registry = TopologyRegistry::new();
        registry.subscribe(monitor.clone());
        registry.apply_node_up(
            NodeUp::new(1, "node-1", Connector::new("live", 1))
                .with_backup(Connector::new("backup", 1)),
        );

        monitor.reporter().report(FaultCause::Disconnected);
        rx.try_recv().unwrap();
        assert!(monitor.mark_connected(2, Connector::new("backup", 1), Some("node-1".into())));

        // The dead live server is announced after we moved to its backup
        registry.apply_node_disconnected(NodeDisconnected::new("node-1", None));
        registry.apply_node_down(NodeDown::new(2, "node-1"));
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.status(), ConnectionStatus::Connected);
        assert_eq!(monitor.state().generation, 2);
    }

    #[test]
    fn test_learns_node_id_from_topology() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(4);
        let monitor = ConnectionMonitor::new(
            ConnectionId::from_raw(9),
            Connector::new("live", 7),
            None,
            tx,
            events,
        );
        let registry = TopologyRegistry::new();
        registry.subscribe(monitor.clone());

        registry.apply_node_up(NodeUp::new(1, "node-x", Connector::new("elsewhere", 1)));
        assert_eq!(monitor.state().target_node_id, None);

        registry.apply_node_up(NodeUp::new(2, "node-7", Connector::new("live", 7)));
        assert_eq!(monitor.state().target_node_id.as_deref(), Some("node-7"));
    }

    #[test]
    fn test_detached_reporter() {
        assert!(!FaultReporter::detached().report(FaultCause::Disconnected));
    }
}
