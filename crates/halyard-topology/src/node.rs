//! Node types: identifiers, connectors and topology entries

use crate::error::{Result, TopologyError};
use crate::event::NodeUp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique broker node identifier, stable for the node's operational lifetime
pub type NodeId = String;

/// Identity of one transport connection between the client and a broker node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a process-unique connection id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id (ids from other sources, tests)
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Network address of a broker endpoint
///
/// Immutable once built. Transport parameters are opaque to the topology
/// layer and kept sorted so equal connectors compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connector {
    host: String,
    port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            params: BTreeMap::new(),
        }
    }

    /// Attach a transport parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `host:port` form suitable for socket connects
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

impl FromStr for Connector {
    type Err = TopologyError;

    /// Parse `host:port` or `[v6-host]:port`
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidConnector(format!("missing port in '{}'", s)))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(TopologyError::InvalidConnector(format!(
                "missing host in '{}'",
                s
            )));
        }

        let port: u16 = port
            .parse()
            .map_err(|e| TopologyError::InvalidConnector(format!("bad port in '{}': {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

/// Liveness of a node as last announced by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Up,
    Down,
}

/// Client-side view of one broker node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: NodeId,

    /// Address of the node's live (primary) server
    pub live_connector: Connector,

    /// Address of the standby that takes over when the live server fails
    pub backup_connector: Option<Connector>,

    pub backup_group_name: Option<String>,

    pub scale_down_group_name: Option<String>,

    /// Redirection hint from the last NodeDisconnected for this node
    pub scale_down_target: Option<NodeId>,

    /// Highest `unique_event_id` applied to this entry
    pub last_event_id: u64,

    pub status: NodeStatus,
}

impl NodeEntry {
    /// Build a fresh entry from the first NodeUp seen for a node
    pub fn from_node_up(event: &NodeUp) -> Self {
        Self {
            node_id: event.node_id.clone(),
            live_connector: event.live_connector.clone(),
            backup_connector: event.backup_connector.clone(),
            backup_group_name: event.backup_group_name.clone(),
            scale_down_group_name: event.scale_down_group_name.clone(),
            scale_down_target: None,
            last_event_id: event.unique_event_id,
            status: NodeStatus::Up,
        }
    }

    /// Overwrite the announced fields with a newer NodeUp.
    ///
    /// Callers have already checked that the event is newer; the
    /// scale-down hint is not part of a NodeUp and is kept.
    pub(crate) fn update_from(&mut self, event: &NodeUp) {
        debug_assert!(event.unique_event_id > self.last_event_id);
        self.live_connector = event.live_connector.clone();
        self.backup_connector = event.backup_connector.clone();
        self.backup_group_name = event.backup_group_name.clone();
        self.scale_down_group_name = event.scale_down_group_name.clone();
        self.last_event_id = event.unique_event_id;
        self.status = NodeStatus::Up;
    }

    pub(crate) fn mark_down(&mut self) {
        self.status = NodeStatus::Down;
    }

    pub fn is_up(&self) -> bool {
        self.status == NodeStatus::Up
    }

    pub fn has_backup(&self) -> bool {
        self.backup_connector.is_some()
    }

    /// Whether `connector` is this node's live or backup address
    pub fn serves(&self, connector: &Connector) -> bool {
        &self.live_connector == connector || self.backup_connector.as_ref() == Some(connector)
    }
}
