//! Inbound boundary between the transport layer and the registry
//!
//! The transport calls a [`TopologyResponseHandler`] from one thread per
//! broker connection, possibly all at once. [`TopologyDispatcher`] turns each
//! callback into a [`TopologyEvent`] and applies it; nothing here blocks
//! beyond the registry's write lock.

use crate::event::{NodeDisconnected, NodeDown, NodeUp, TopologyEvent};
use crate::node::{ConnectionId, Connector, NodeId};
use crate::registry::{ApplyOutcome, TopologyRegistry};
use std::sync::Arc;
use tracing::trace;

/// Callbacks through which the transport delivers membership notifications
pub trait TopologyResponseHandler: Send + Sync {
    /// The server is disconnecting `node_id`, whose work moves to
    /// `scale_down_target` if given
    fn node_disconnected(
        &self,
        connection: ConnectionId,
        node_id: &str,
        scale_down_target: Option<&str>,
    );

    /// A node announced itself
    #[allow(clippy::too_many_arguments)]
    fn notify_node_up(
        &self,
        unique_event_id: u64,
        backup_group_name: Option<&str>,
        scale_down_group_name: Option<&str>,
        node_id: &str,
        live_connector: Connector,
        backup_connector: Option<Connector>,
        is_last: bool,
    );

    /// A node somewhere in the cluster went down
    fn notify_node_down(&self, event_time: u64, node_id: &str);

    /// Route an already-structured event to the matching callback
    fn dispatch(&self, connection: ConnectionId, event: TopologyEvent) {
        match event {
            TopologyEvent::NodeUp(e) => self.notify_node_up(
                e.unique_event_id,
                e.backup_group_name.as_deref(),
                e.scale_down_group_name.as_deref(),
                &e.node_id,
                e.live_connector,
                e.backup_connector,
                e.is_last,
            ),
            TopologyEvent::NodeDown(e) => self.notify_node_down(e.event_time, &e.node_id),
            TopologyEvent::NodeDisconnected(e) => self.node_disconnected(
                connection,
                &e.node_id,
                e.scale_down_target.as_deref(),
            ),
        }
    }
}

/// Handler that applies every notification to a shared registry
#[derive(Clone)]
pub struct TopologyDispatcher {
    registry: Arc<TopologyRegistry>,
}

impl TopologyDispatcher {
    pub fn new(registry: Arc<TopologyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    fn apply(&self, event: TopologyEvent) -> ApplyOutcome {
        let kind = event.kind();
        let outcome = self.registry.apply(event);
        trace!(kind, ?outcome, "Dispatched topology event");
        outcome
    }
}

impl TopologyResponseHandler for TopologyDispatcher {
    fn node_disconnected(
        &self,
        connection: ConnectionId,
        node_id: &str,
        scale_down_target: Option<&str>,
    ) {
        trace!(%connection, node_id, ?scale_down_target, "Node disconnected notification");
        self.apply(
            NodeDisconnected::new(node_id, scale_down_target.map(NodeId::from)).into(),
        );
    }

    fn notify_node_up(
        &self,
        unique_event_id: u64,
        backup_group_name: Option<&str>,
        scale_down_group_name: Option<&str>,
        node_id: &str,
        live_connector: Connector,
        backup_connector: Option<Connector>,
        is_last: bool,
    ) {
        self.apply(
            NodeUp {
                unique_event_id,
                node_id: node_id.to_string(),
                live_connector,
                backup_connector,
                backup_group_name: backup_group_name.map(str::to_string),
                scale_down_group_name: scale_down_group_name.map(str::to_string),
                is_last,
            }
            .into(),
        );
    }

    fn notify_node_down(&self, event_time: u64, node_id: &str) {
        self.apply(NodeDown::new(event_time, node_id).into());
    }
}
