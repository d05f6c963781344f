//! Counters/gauges/histograms with label sets, wired into every session,
//! agent, and rollback operation (spec.md §4.12).

use crate::error::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Bucket boundaries for `session_operation_duration_seconds`, covering
/// everything from a sub-millisecond cache hit to a multi-second rollback.
const OPERATION_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// The Prometheus-backed metrics surface for the session coordination core.
///
/// Cloning is cheap: every field is a Prometheus metric handle, which is
/// itself a cheap `Arc`-backed clone over shared state.
#[derive(Clone)]
pub struct MetricsHub {
    registry: Registry,

    pub sessions_created_total: IntCounter,
    pub sessions_active: IntGauge,
    pub events_appended_total: IntCounterVec,
    pub checkpoints_total: IntCounterVec,

    pub agents_registered: IntGauge,
    pub agents_dead_total: IntCounter,
    pub tasks_submitted_total: IntCounter,
    pub tasks_completed_total: IntCounter,
    pub tasks_failed_total: IntCounter,
    pub task_queue_depth: IntGauge,

    pub rollback_operations_total: IntCounterVec,
    pub rollback_conflicts_total: IntCounter,

    pub kv_errors_total: IntCounterVec,
    pub pool_connections_in_use: IntGauge,
    pub pool_acquire_timeouts_total: IntCounter,

    /// `session_operation_duration_seconds{operation}` — fed by
    /// [`Span::finish`].
    pub operation_duration_seconds: HistogramVec,
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let ns = |name: &str| format!("agentsync_{name}");
        let reg = |c: Box<dyn prometheus::core::Collector>| {
            registry
                .register(c)
                .map_err(|e| Error::Registration(e.to_string()))
        };

        let sessions_created_total = IntCounter::new(
            ns("sessions_created_total"),
            "Total sessions created",
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(sessions_created_total.clone()))?;

        let sessions_active =
            IntGauge::new(ns("sessions_active"), "Currently active sessions")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(sessions_active.clone()))?;

        let events_appended_total = IntCounterVec::new(
            Opts::new(ns("events_appended_total"), "Events appended by type"),
            &["type"],
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(events_appended_total.clone()))?;

        let checkpoints_total = IntCounterVec::new(
            Opts::new(ns("checkpoints_total"), "Checkpoints written by outcome"),
            &["outcome"],
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(checkpoints_total.clone()))?;

        let agents_registered =
            IntGauge::new(ns("agents_registered"), "Registered agents")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(agents_registered.clone()))?;

        let agents_dead_total =
            IntCounter::new(ns("agents_dead_total"), "Agents marked dead")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(agents_dead_total.clone()))?;

        let tasks_submitted_total =
            IntCounter::new(ns("tasks_submitted_total"), "Tasks submitted")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(tasks_submitted_total.clone()))?;

        let tasks_completed_total =
            IntCounter::new(ns("tasks_completed_total"), "Tasks completed")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(tasks_completed_total.clone()))?;

        let tasks_failed_total =
            IntCounter::new(ns("tasks_failed_total"), "Tasks failed")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(tasks_failed_total.clone()))?;

        let task_queue_depth =
            IntGauge::new(ns("task_queue_depth"), "Queued tasks awaiting assignment")
                .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(task_queue_depth.clone()))?;

        let rollback_operations_total = IntCounterVec::new(
            Opts::new(ns("rollback_operations_total"), "Rollback operations by status"),
            &["status", "strategy"],
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(rollback_operations_total.clone()))?;

        let rollback_conflicts_total = IntCounter::new(
            ns("rollback_conflicts_total"),
            "Rollback conflicts detected",
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(rollback_conflicts_total.clone()))?;

        let kv_errors_total = IntCounterVec::new(
            Opts::new(ns("kv_errors_total"), "KV facade errors by kind"),
            &["kind"],
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(kv_errors_total.clone()))?;

        let pool_connections_in_use = IntGauge::new(
            ns("pool_connections_in_use"),
            "Connections currently checked out of the pool",
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(pool_connections_in_use.clone()))?;

        let pool_acquire_timeouts_total = IntCounter::new(
            ns("pool_acquire_timeouts_total"),
            "Connection pool acquisitions that timed out",
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(pool_acquire_timeouts_total.clone()))?;

        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                ns("session_operation_duration_seconds"),
                "Duration of a traced operation",
            )
            .buckets(OPERATION_LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )
        .map_err(|e| Error::Registration(e.to_string()))?;
        reg(Box::new(operation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            sessions_created_total,
            sessions_active,
            events_appended_total,
            checkpoints_total,
            agents_registered,
            agents_dead_total,
            tasks_submitted_total,
            tasks_completed_total,
            tasks_failed_total,
            task_queue_depth,
            rollback_operations_total,
            rollback_conflicts_total,
            kv_errors_total,
            pool_connections_in_use,
            pool_acquire_timeouts_total,
            operation_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns a histogram handle scoped to `operation`, used by
    /// [`crate::tracer::Span::finish`].
    pub fn operation_histogram(&self, operation: &str) -> Histogram {
        self.operation_duration_seconds.with_label_values(&[operation])
    }

    /// Renders the registry in Prometheus text exposition format
    /// (spec.md §6 "Prometheus endpoint").
    pub fn export(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| Error::Export(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| Error::Export(e.to_string()))
    }
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new().expect("metric registration with a fresh registry cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_prometheus_text_format() {
        let hub = MetricsHub::new().unwrap();
        hub.sessions_created_total.inc();
        hub.events_appended_total.with_label_values(&["modified"]).inc();

        let body = hub.export().unwrap();
        assert!(body.contains("# HELP"));
        assert!(body.contains("agentsync_sessions_created_total"));
    }

    #[test]
    fn two_hubs_on_distinct_registries_dont_collide() {
        let a = MetricsHub::new().unwrap();
        let b = MetricsHub::new().unwrap();
        a.sessions_created_total.inc();
        assert_eq!(a.sessions_created_total.get(), 1);
        assert_eq!(b.sessions_created_total.get(), 0);
    }
}
