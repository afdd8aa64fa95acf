//! Topology metrics
//!
//! Thin wrappers over the `metrics` crate. With the `metrics` feature
//! disabled every call compiles to nothing, so the registry can record
//! unconditionally.
//!
//! ```toml
//! halyard-topology = { version = "0.1", features = ["metrics"] }
//! ```

/// Registry-level metrics
pub struct TopologyMetrics;

impl TopologyMetrics {
    // ---- Counters ----

    /// Event applied to the view (`kind` = node_up / node_down / node_disconnected)
    pub fn increment_applied(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_topology_events_applied_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    /// Event discarded as stale, duplicate or for an unknown node
    pub fn increment_discarded(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_topology_events_discarded_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    /// Initial topology replay completed
    pub fn increment_synchronized() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_topology_synchronized_total").increment(1);
    }

    // ---- Gauges ----

    pub fn set_known_nodes(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("halyard_topology_known_nodes").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    pub fn set_live_nodes(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("halyard_topology_live_nodes").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_metrics_compile() {
        TopologyMetrics::increment_applied("node_up");
        TopologyMetrics::increment_discarded("node_down");
        TopologyMetrics::increment_synchronized();
        TopologyMetrics::set_known_nodes(3);
        TopologyMetrics::set_live_nodes(2);
    }
}
