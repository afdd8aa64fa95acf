use halyard_topology::{Connector, NodeId, TopologyError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: Connector, timeout: Duration },

    #[error("All servers unavailable")]
    AllServersUnavailable,

    #[error("No failover target for node {0:?}")]
    NoFailoverTarget(Option<NodeId>),

    #[error("Failover failed after {attempts} attempts")]
    FailoverFailed { attempts: u32 },

    #[error("Session rebind failed: {0}")]
    RebindFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection closed")]
    Closed,

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
}

impl Error {
    /// Whether another connection attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError(_)
                | Error::IoError(_)
                | Error::ConnectTimeout { .. }
                | Error::NoFailoverTarget(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
