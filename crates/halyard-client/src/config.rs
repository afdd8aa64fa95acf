//! Failover configuration

use crate::{Error, Result};
use halyard_topology::Connector;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ReconnectDelay {
    /// Same delay after every failed attempt
    Fixed { delay: Duration },
    /// `initial * multiplier^(n-1)` after failed attempt `n`, never above `max`
    Backoff {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        /// Spread each delay by ±25%
        jitter: bool,
    },
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay::Fixed {
            delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectDelay {
    pub fn fixed(delay: Duration) -> Self {
        ReconnectDelay::Fixed { delay }
    }

    pub fn backoff(initial: Duration, multiplier: f64, max: Duration) -> Self {
        ReconnectDelay::Backoff {
            initial,
            multiplier,
            max,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectDelay::Fixed { delay } => delay,
            ReconnectDelay::Backoff {
                initial,
                multiplier,
                max,
                jitter,
            } => calculate_backoff(attempt, initial, multiplier, max, jitter),
        }
    }
}

fn calculate_backoff(
    attempt: u32,
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: bool,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let base = initial.as_secs_f64() * multiplier.powi(exponent);
    let capped = base.min(max.as_secs_f64());

    let delay = if jitter {
        let spread = rand::thread_rng().gen_range(-0.25..=0.25);
        capped + spread * capped
    } else {
        capped
    };

    Duration::from_secs_f64(delay.clamp(0.0, max.as_secs_f64()))
}

/// Configuration for failover-aware connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Bootstrap servers, also the last-resort fallback list (in order)
    pub static_connectors: Vec<Connector>,
    /// Reconnection attempts per failover episode
    pub max_reconnect_attempts: u32,
    /// Wait between attempts
    pub reconnect_delay: ReconnectDelay,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Try the registry's backup before the static list
    pub prefer_topology_backup: bool,
    /// Capacity of the client event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            static_connectors: Vec::new(),
            max_reconnect_attempts: 10,
            reconnect_delay: ReconnectDelay::default(),
            connect_timeout: Duration::from_secs(5),
            prefer_topology_backup: true,
            event_channel_capacity: 1000,
        }
    }
}

impl FailoverConfig {
    /// Create a new builder
    pub fn builder() -> FailoverConfigBuilder {
        FailoverConfigBuilder::default()
    }

    /// Reject settings the failover loop cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_channel_capacity must be non-zero".to_string(),
            ));
        }
        if let ReconnectDelay::Backoff {
            initial,
            multiplier,
            max,
            ..
        } = self.reconnect_delay
        {
            if !(multiplier >= 1.0) || !multiplier.is_finite() {
                return Err(Error::InvalidConfig(format!(
                    "backoff multiplier must be a finite value >= 1.0, got {}",
                    multiplier
                )));
            }
            if max < initial {
                return Err(Error::InvalidConfig(format!(
                    "backoff max {:?} is below initial {:?}",
                    max, initial
                )));
            }
        }
        Ok(())
    }
}

/// Builder for FailoverConfig
#[derive(Default)]
pub struct FailoverConfigBuilder {
    config: FailoverConfig,
}

impl FailoverConfigBuilder {
    /// Set bootstrap / fallback connectors
    pub fn static_connectors(mut self, connectors: Vec<Connector>) -> Self {
        self.config.static_connectors = connectors;
        self
    }

    /// Append one bootstrap / fallback connector
    pub fn static_connector(mut self, connector: Connector) -> Self {
        self.config.static_connectors.push(connector);
        self
    }

    /// Set maximum reconnection attempts per episode
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set the inter-attempt delay strategy
    pub fn reconnect_delay(mut self, delay: ReconnectDelay) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set per-attempt connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Choose registry-resolved targets before the static list
    pub fn prefer_topology_backup(mut self, prefer: bool) -> Self {
        self.config.prefer_topology_backup = prefer;
        self
    }

    /// Set event channel capacity
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Build the configuration
    pub fn build(self) -> FailoverConfig {
        self.config
    }
}
