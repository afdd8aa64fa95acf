//! # Halyard Topology
//!
//! Client-side view of a Halyard broker cluster: which nodes exist, where
//! their live and backup servers listen, and how they group for backup and
//! scale-down.
//!
//! The view is built from an ordered stream of membership events delivered
//! over every broker connection the client holds:
//!
//! ```text
//!  broker conn A ──┐
//!  broker conn B ──┼─▶ TopologyResponseHandler ─▶ TopologyRegistry::apply ─▶ listeners
//!  broker conn C ──┘        (any thread)            (serialized writes)       (in order)
//! ```
//!
//! Events carry a cluster-wide `unique_event_id`, which lets the registry
//! drop reordered and duplicated deliveries without coordinating clocks.
//!
//! ## Example
//!
//! ```rust
//! use halyard_topology::{Connector, NodeUp, TopologyRegistry};
//!
//! let registry = TopologyRegistry::new();
//! registry.apply_node_up(
//!     NodeUp::new(1, "node-1", Connector::new("broker-1", 61616))
//!         .with_backup(Connector::new("broker-1b", 61616))
//!         .last(),
//! );
//!
//! assert!(registry.is_synchronized());
//! assert_eq!(
//!     registry.resolve_target("node-1"),
//!     Some(Connector::new("broker-1b", 61616))
//! );
//! ```

pub mod deferred;
pub mod error;
pub mod event;
pub mod handler;
pub mod node;
pub mod observability;
pub mod registry;

pub use deferred::DeferredListener;
pub use error::{Result, TopologyError};
pub use event::{NodeDisconnected, NodeDown, NodeUp, TopologyEvent};
pub use handler::{TopologyDispatcher, TopologyResponseHandler};
pub use node::{ConnectionId, Connector, NodeEntry, NodeId, NodeStatus};
pub use observability::TopologyMetrics;
pub use registry::{
    ApplyOutcome, SubscriptionId, TopologyChange, TopologyListener, TopologyRegistry,
    TopologySnapshot,
};
