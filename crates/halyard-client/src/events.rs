//! Lifecycle events published to applications

use crate::monitor::FaultCause;
use halyard_topology::{ConnectionId, Connector, NodeId};
use std::time::Duration;

/// Failover lifecycle and topology milestones for one logical connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The initial topology replay completed
    TopologySynchronized,

    /// A fault was detected; a reconnection loop is starting
    FailoverRequested {
        connection: ConnectionId,
        node_id: Option<NodeId>,
        cause: FaultCause,
    },

    /// Reconnected and sessions rebound
    FailoverCompleted {
        connection: ConnectionId,
        node_id: Option<NodeId>,
        target: Connector,
        attempts: u32,
        elapsed: Duration,
    },

    /// Every attempt failed; the connection is FAILED until the application retries
    FailoverFailed {
        connection: ConnectionId,
        node_id: Option<NodeId>,
        attempts: u32,
    },

    /// Transport reconnected but recreating sessions failed
    RebindFailed {
        connection: ConnectionId,
        target: Connector,
        reason: String,
    },
}

impl ClientEvent {
    /// Whether this event ends a failover episode
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientEvent::FailoverCompleted { .. }
                | ClientEvent::FailoverFailed { .. }
                | ClientEvent::RebindFailed { .. }
        )
    }
}
