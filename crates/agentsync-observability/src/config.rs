//! Configuration for the metrics/tracing/health/shutdown layer.

use std::time::Duration;

/// Configuration for [`crate::metrics::MetricsHub`]'s periodic snapshotter
/// and exposition server (spec.md §4.12).
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP path the Prometheus exposition endpoint is served on.
    pub metrics_path: String,
    /// Port the metrics server listens on.
    pub metrics_port: u16,
    /// How often a [`crate::snapshot::SessionMetricsSnapshot`] is recorded.
    pub collection_interval: Duration,
    /// How many days of snapshots the ring buffer retains.
    pub retention_days: u32,
    /// How often alert rules are (re-)evaluated.
    pub alert_evaluation_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            metrics_path: "/metrics".to_string(),
            metrics_port: 9090,
            collection_interval: Duration::from_secs(30),
            retention_days: 7,
            alert_evaluation_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`crate::shutdown::GracefulShutdown`] (spec.md §4.13).
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// TTL applied to every active session's keys at the start of draining.
    pub drain_ttl: Duration,
    /// If any phase exceeds this, switch to the forced-close path.
    pub force_close_after: Duration,
    /// Deadline raced against component `Close()` calls on the forced path.
    pub forced_close_deadline: Duration,
    /// TTL applied to the persisted `RecoveryData` blob.
    pub recovery_data_ttl: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_ttl: Duration::from_secs(10),
            force_close_after: Duration::from_secs(30),
            forced_close_deadline: Duration::from_secs(5),
            recovery_data_ttl: Duration::from_secs(24 * 3600),
        }
    }
}
