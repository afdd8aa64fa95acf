//! # Halyard Client
//!
//! Failover-aware connections to a Halyard broker cluster.
//!
//! A [`ClusterClient`] owns one [`TopologyRegistry`] fed by the protocol
//! layer through [`ClusterClient::response_handler`]. Every
//! [`ClusterConnection`] it creates watches its transport and the registry;
//! when its node fails it reconnects to the node's backup (or the next static
//! connector), then asks the application's [`SessionRebinder`] to recreate
//! sessions on the new transport.
//!
//! ```text
//! transport fault ─┐
//! NodeDown        ─┼─▶ ConnectionMonitor ─▶ FailoverController ─▶ connect ─▶ SessionRebinder
//! scale-down      ─┘   (one request per       (worker task,
//!                        fault episode)         bounded retries)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use halyard_client::{ClusterClient, FailoverConfig, NoopRebinder, TcpTransport};
//! use halyard_topology::Connector;
//!
//! # async fn run() -> halyard_client::Result<()> {
//! let config = FailoverConfig::builder()
//!     .static_connector(Connector::new("broker-1", 61616))
//!     .static_connector(Connector::new("broker-2", 61616))
//!     .build();
//!
//! let client = ClusterClient::new(config, TcpTransport::new())?;
//! let connection = client.connect(NoopRebinder).await?;
//! let mut events = connection.subscribe();
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod monitor;
pub mod observability;
pub mod rebind;
pub mod transport;

pub use client::{ClusterClient, ClusterConnection};
pub use config::{FailoverConfig, FailoverConfigBuilder, ReconnectDelay};
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use failover::{FailoverController, ResolvedTarget, TargetSource};
pub use monitor::{
    ConnectionMonitor, ConnectionState, ConnectionStatus, FailoverRequest, FaultCause,
    FaultReporter,
};
pub use observability::FailoverMetrics;
pub use rebind::{NoopRebinder, SessionRebinder};
pub use transport::{TcpConnection, TcpTransport, TransportConnection, TransportConnector};

pub use halyard_topology::{Connector, NodeId, TopologyRegistry};
