//! Failover metrics
//!
//! Same shape as the topology metrics: no-ops unless the `metrics` feature
//! is enabled.

use std::time::Duration;

/// Per-client failover metrics
pub struct FailoverMetrics;

impl FailoverMetrics {
    // ---- Counters ----

    /// A fault opened a failover episode
    pub fn increment_requested() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_requested_total").increment(1);
    }

    /// A fault report folded into an open episode or dropped as stale
    pub fn increment_coalesced() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_coalesced_total").increment(1);
    }

    /// One reconnection attempt failed (`source` = topology / static)
    pub fn increment_attempt_failed(source: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_attempts_failed_total", "source" => source)
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = source;
    }

    pub fn increment_completed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_completed_total").increment(1);
    }

    /// Retries exhausted
    pub fn increment_failed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_failed_total").increment(1);
    }

    pub fn increment_rebind_failed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("halyard_failover_rebind_failed_total").increment(1);
    }

    // ---- Histograms ----

    /// Fault-to-reconnected latency
    pub fn record_failover_duration(elapsed: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("halyard_failover_duration_seconds").record(elapsed.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = elapsed;
    }
}
