//! Topology events as delivered by the transport layer

use crate::node::{Connector, NodeId};
use serde::{Deserialize, Serialize};

/// A node announced itself (or an update to itself)
///
/// `unique_event_id` comes from a single cluster-wide counter, so it totally
/// orders announcements across every connection the client holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUp {
    pub unique_event_id: u64,
    pub node_id: NodeId,
    pub live_connector: Connector,
    pub backup_connector: Option<Connector>,
    pub backup_group_name: Option<String>,
    pub scale_down_group_name: Option<String>,
    /// Marks the final event of the initial topology replay
    pub is_last: bool,
}

impl NodeUp {
    pub fn new(unique_event_id: u64, node_id: impl Into<NodeId>, live_connector: Connector) -> Self {
        Self {
            unique_event_id,
            node_id: node_id.into(),
            live_connector,
            backup_connector: None,
            backup_group_name: None,
            scale_down_group_name: None,
            is_last: false,
        }
    }

    pub fn with_backup(mut self, backup: Connector) -> Self {
        self.backup_connector = Some(backup);
        self
    }

    pub fn with_backup_group(mut self, name: impl Into<String>) -> Self {
        self.backup_group_name = Some(name.into());
        self
    }

    pub fn with_scale_down_group(mut self, name: impl Into<String>) -> Self {
        self.scale_down_group_name = Some(name.into());
        self
    }

    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }
}

/// A node went down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDown {
    pub event_time: u64,
    pub node_id: NodeId,
}

impl NodeDown {
    pub fn new(event_time: u64, node_id: impl Into<NodeId>) -> Self {
        Self {
            event_time,
            node_id: node_id.into(),
        }
    }
}

/// The server is disconnecting a node, optionally naming where its work went
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDisconnected {
    pub node_id: NodeId,
    pub scale_down_target: Option<NodeId>,
}

impl NodeDisconnected {
    pub fn new(node_id: impl Into<NodeId>, scale_down_target: Option<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            scale_down_target,
        }
    }
}

/// Membership event consumed by the registry's single apply entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyEvent {
    NodeUp(NodeUp),
    NodeDown(NodeDown),
    NodeDisconnected(NodeDisconnected),
}

impl TopologyEvent {
    pub fn node_id(&self) -> &str {
        match self {
            TopologyEvent::NodeUp(e) => &e.node_id,
            TopologyEvent::NodeDown(e) => &e.node_id,
            TopologyEvent::NodeDisconnected(e) => &e.node_id,
        }
    }

    /// Short name for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            TopologyEvent::NodeUp(_) => "node_up",
            TopologyEvent::NodeDown(_) => "node_down",
            TopologyEvent::NodeDisconnected(_) => "node_disconnected",
        }
    }
}

impl From<NodeUp> for TopologyEvent {
    fn from(e: NodeUp) -> Self {
        TopologyEvent::NodeUp(e)
    }
}

impl From<NodeDown> for TopologyEvent {
    fn from(e: NodeDown) -> Self {
        TopologyEvent::NodeDown(e)
    }
}

impl From<NodeDisconnected> for TopologyEvent {
    fn from(e: NodeDisconnected) -> Self {
        TopologyEvent::NodeDisconnected(e)
    }
}
