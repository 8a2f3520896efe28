//! Immutable configuration for the engine and ticker services.
//!
//! Configuration is constructed once at process start and passed by reference
//! into each service's constructor; there is no package-level mutable state.

use std::time::Duration;

/// Configuration for the step/job scheduling engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied when a step or job declares none.
    pub default_timeout: Duration,
    /// How long a step run may sit in `PendingAssignment` before the requeue
    /// sweep picks it up again.
    pub requeue_after: Duration,
    /// A ticker whose heartbeat is older than this is not assignable.
    pub ticker_staleness: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            requeue_after: Duration::from_secs(4),
            ticker_staleness: Duration::from_secs(6),
        }
    }
}

/// Configuration for the ticker liveness service.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// How often this node refreshes its own heartbeat.
    pub heartbeat_interval: Duration,
    /// How often this node scans for stale peers.
    pub sweep_interval: Duration,
    /// A peer whose heartbeat is older than this is stale.
    pub staleness_window: Duration,
    /// How often this node asks the engine to requeue step runs stuck
    /// waiting for a worker.
    pub requeue_interval: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            staleness_window: Duration::from_secs(6),
            requeue_interval: Duration::from_secs(4),
        }
    }
}
