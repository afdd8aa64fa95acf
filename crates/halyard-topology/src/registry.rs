//! Client-side topology registry
//!
//! Holds the view of cluster membership built from the broker's event
//! stream. Events may arrive on several connections at once, reordered or
//! duplicated; the registry converges anyway:
//!
//! - **NodeUp** is applied only if its `unique_event_id` is strictly greater
//!   than the last one applied for that node. Older or equal ids are dropped.
//! - **NodeDown** marks a known node down but keeps its entry, so a later
//!   NodeUp with a greater id can bring it back.
//! - **NodeDisconnected** records a scale-down redirection hint.
//!
//! All writes go through one exclusive lock, so the id comparison and the
//! update are atomic. Listeners run after the lock is released.

use crate::error::{Result, TopologyError};
use crate::event::{NodeDisconnected, NodeDown, NodeUp, TopologyEvent};
use crate::node::{Connector, NodeEntry, NodeId};
use crate::observability::TopologyMetrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The view changed and listeners were notified
    Applied,
    /// NodeUp with an id at or below the node's last applied id
    Stale,
    /// NodeDown / NodeDisconnected for a node never seen
    UnknownNode,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Notification delivered to subscribers after each applied event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    /// Entry as it stands after the update
    NodeUp(NodeEntry),
    NodeDown(NodeEntry),
    NodeDisconnected {
        node_id: NodeId,
        /// Live address of the node being scaled down
        live_connector: Connector,
        scale_down_target: Option<NodeId>,
    },
    /// The initial topology replay finished. Fires once per registry.
    Synchronized,
}

impl TopologyChange {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            TopologyChange::NodeUp(e) | TopologyChange::NodeDown(e) => Some(&e.node_id),
            TopologyChange::NodeDisconnected { node_id, .. } => Some(node_id),
            TopologyChange::Synchronized => None,
        }
    }
}

/// Subscriber callback
///
/// Called synchronously on the thread that applied the event. Anything slow
/// belongs on another task; see [`DeferredListener`](crate::deferred::DeferredListener).
pub trait TopologyListener: Send + Sync {
    fn on_topology_change(&self, change: &TopologyChange);
}

impl<F> TopologyListener for F
where
    F: Fn(&TopologyChange) + Send + Sync,
{
    fn on_topology_change(&self, change: &TopologyChange) {
        self(change)
    }
}

/// Handle returned by [`TopologyRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Immutable copy of the registry's view
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    nodes: HashMap<NodeId, NodeEntry>,
    synchronized: bool,
}

impl TopologySnapshot {
    pub fn get(&self, node_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn nodes(&self) -> &HashMap<NodeId, NodeEntry> {
        &self.nodes
    }

    pub fn into_nodes(self) -> HashMap<NodeId, NodeEntry> {
        self.nodes
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Entries currently UP
    pub fn live_nodes(&self) -> Vec<&NodeEntry> {
        self.nodes.values().filter(|e| e.is_up()).collect()
    }

    pub fn members_of_backup_group(&self, group: &str) -> Vec<&NodeEntry> {
        self.nodes
            .values()
            .filter(|e| e.backup_group_name.as_deref() == Some(group))
            .collect()
    }

    pub fn members_of_scale_down_group(&self, group: &str) -> Vec<&NodeEntry> {
        self.nodes
            .values()
            .filter(|e| e.scale_down_group_name.as_deref() == Some(group))
            .collect()
    }

    /// The node whose live or backup address is `connector`
    pub fn node_for_connector(&self, connector: &Connector) -> Option<&NodeEntry> {
        self.nodes.values().find(|e| e.serves(connector))
    }

    /// Same resolution as [`TopologyRegistry::resolve_target`], on this snapshot
    pub fn resolve_target(&self, node_id: &str) -> Option<Connector> {
        resolve_in(&self.nodes, node_id)
    }
}

/// Best replacement for a failed node: its backup while the node is UP with
/// one, else the live address of its scale-down target if that node is UP.
fn resolve_in(nodes: &HashMap<NodeId, NodeEntry>, node_id: &str) -> Option<Connector> {
    let entry = nodes.get(node_id)?;

    if entry.is_up() {
        if let Some(backup) = &entry.backup_connector {
            return Some(backup.clone());
        }
    }

    let target_id = entry.scale_down_target.as_ref()?;
    nodes
        .get(target_id)
        .filter(|target| target.is_up())
        .map(|target| target.live_connector.clone())
}

/// Authoritative client-side view of cluster membership
///
/// One registry per connection factory. Writers are serialized by an
/// internal lock; [`current_view`](Self::current_view) hands out copies.
pub struct TopologyRegistry {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,

    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn TopologyListener>)>>,

    next_subscription: AtomicU64,

    synchronized: AtomicBool,

    /// Wakes `wait_synchronized` callers
    sync_tx: watch::Sender<bool>,
}

impl Default for TopologyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyRegistry {
    pub fn new() -> Self {
        let (sync_tx, _) = watch::channel(false);
        Self {
            nodes: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            synchronized: AtomicBool::new(false),
            sync_tx,
        }
    }

    /// Apply any topology event
    pub fn apply(&self, event: TopologyEvent) -> ApplyOutcome {
        match event {
            TopologyEvent::NodeUp(e) => self.apply_node_up(e),
            TopologyEvent::NodeDown(e) => self.apply_node_down(e),
            TopologyEvent::NodeDisconnected(e) => self.apply_node_disconnected(e),
        }
    }

    /// Create or update a node entry unless the event is stale
    pub fn apply_node_up(&self, event: NodeUp) -> ApplyOutcome {
        let applied = {
            let mut nodes = self.nodes.write();
            let applied = match nodes.get_mut(&event.node_id) {
                Some(entry) if event.unique_event_id <= entry.last_event_id => None,
                Some(entry) => {
                    entry.update_from(&event);
                    Some(entry.clone())
                }
                None => {
                    let entry = NodeEntry::from_node_up(&event);
                    nodes.insert(entry.node_id.clone(), entry.clone());
                    Some(entry)
                }
            };
            if applied.is_some() {
                record_gauges(&nodes);
            }
            applied
        };

        let outcome = match applied {
            Some(entry) => {
                debug!(
                    node_id = %entry.node_id,
                    event_id = entry.last_event_id,
                    live = %entry.live_connector,
                    backup = ?entry.backup_connector.as_ref().map(|c| c.to_string()),
                    "Node up"
                );
                TopologyMetrics::increment_applied("node_up");
                self.notify(&TopologyChange::NodeUp(entry));
                ApplyOutcome::Applied
            }
            None => {
                trace!(
                    node_id = %event.node_id,
                    event_id = event.unique_event_id,
                    "Discarding stale node up"
                );
                TopologyMetrics::increment_discarded("node_up");
                ApplyOutcome::Stale
            }
        };

        // The replay is complete once its last event arrives, whether or not
        // that event still carried news.
        if event.is_last {
            self.mark_synchronized();
        }

        outcome
    }

    /// Mark a known node DOWN; the entry is kept
    pub fn apply_node_down(&self, event: NodeDown) -> ApplyOutcome {
        let applied = {
            let mut nodes = self.nodes.write();
            let applied = nodes.get_mut(&event.node_id).map(|entry| {
                entry.mark_down();
                entry.clone()
            });
            if applied.is_some() {
                record_gauges(&nodes);
            }
            applied
        };

        match applied {
            Some(entry) => {
                debug!(node_id = %entry.node_id, event_time = event.event_time, "Node down");
                TopologyMetrics::increment_applied("node_down");
                self.notify(&TopologyChange::NodeDown(entry));
                ApplyOutcome::Applied
            }
            None => {
                trace!(node_id = %event.node_id, "Ignoring node down for unknown node");
                TopologyMetrics::increment_discarded("node_down");
                ApplyOutcome::UnknownNode
            }
        }
    }

    /// Record a scale-down redirection hint for a known node
    pub fn apply_node_disconnected(&self, event: NodeDisconnected) -> ApplyOutcome {
        let live_connector = {
            let mut nodes = self.nodes.write();
            nodes.get_mut(&event.node_id).map(|entry| {
                entry.scale_down_target = event.scale_down_target.clone();
                entry.live_connector.clone()
            })
        };

        let Some(live_connector) = live_connector else {
            trace!(node_id = %event.node_id, "Ignoring disconnect for unknown node");
            TopologyMetrics::increment_discarded("node_disconnected");
            return ApplyOutcome::UnknownNode;
        };

        debug!(
            node_id = %event.node_id,
            scale_down_target = ?event.scale_down_target,
            "Node disconnected"
        );
        TopologyMetrics::increment_applied("node_disconnected");
        self.notify(&TopologyChange::NodeDisconnected {
            node_id: event.node_id,
            live_connector,
            scale_down_target: event.scale_down_target,
        });
        ApplyOutcome::Applied
    }

    /// Copy of the current view
    pub fn current_view(&self) -> TopologySnapshot {
        let nodes = self.nodes.read().clone();
        TopologySnapshot {
            nodes,
            synchronized: self.is_synchronized(),
        }
    }

    /// Copy of a single entry
    pub fn get(&self, node_id: &str) -> Option<NodeEntry> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Entry for `node_id` or `NodeNotFound`
    pub fn require(&self, node_id: &str) -> Result<NodeEntry> {
        self.get(node_id)
            .ok_or_else(|| TopologyError::NodeNotFound(node_id.to_string()))
    }

    /// Best connector to replace a failed node, if the view knows one
    pub fn resolve_target(&self, node_id: &str) -> Option<Connector> {
        resolve_in(&self.nodes.read(), node_id)
    }

    /// Register a listener; listeners run in registration order
    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Wait until the initial topology replay has completed
    pub async fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.sync_tx.subscribe();
        let synced = tokio::time::timeout(timeout, rx.wait_for(|synced| *synced))
            .await
            .map(|waited| waited.is_ok());
        match synced {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(TopologyError::SyncTimeout(timeout)),
        }
    }

    fn mark_synchronized(&self) {
        if self
            .synchronized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        info!(nodes = self.nodes.read().len(), "Topology synchronized");
        TopologyMetrics::increment_synchronized();
        self.sync_tx.send_replace(true);
        self.notify(&TopologyChange::Synchronized);
    }

    fn notify(&self, change: &TopologyChange) {
        // Snapshot the list so listeners may (un)subscribe from a callback
        let listeners: Vec<Arc<dyn TopologyListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener.on_topology_change(change);
        }
    }
}

fn record_gauges(nodes: &HashMap<NodeId, NodeEntry>) {
    TopologyMetrics::set_known_nodes(nodes.len());
    if cfg!(feature = "metrics") {
        TopologyMetrics::set_live_nodes(nodes.values().filter(|e| e.is_up()).count());
    }
}
