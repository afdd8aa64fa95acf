//! Topology error types

use std::time::Duration;
use thiserror::Error;

/// Result type for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Topology errors
///
/// Applying events never fails; stale or unknown-node events are discards,
/// reported through [`ApplyOutcome`](crate::registry::ApplyOutcome) instead.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid connector: {0}")]
    InvalidConnector(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("topology not synchronized within {0:?}")]
    SyncTimeout(Duration),
}

impl TopologyError {
    /// Check if waiting longer could make this error go away
    pub fn is_retriable(&self) -> bool {
        matches!(self, TopologyError::SyncTimeout(_))
    }
}
