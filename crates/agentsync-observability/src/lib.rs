//! Metrics, tracing spans, Prometheus exposition, health aggregation, and
//! graceful shutdown for the session coordination core (spec.md §4.12, §4.13).
//!
//! Built against [`agentsync_core`]'s `KvFacade`/`SessionManager` directly;
//! `agentsync-redis` is not a dependency here, so this crate works the same
//! way against the in-memory test facade.

pub mod alerts;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod snapshot;
pub mod tracer;

pub use alerts::{AlertEvaluator, AlertRule, Condition, FiringAlert, Severity as AlertSeverity};
pub use config::{MetricsConfig, ShutdownConfig};
pub use error::{Error, Result};
pub use health::{ComponentStatus, HealthCheck, HealthReport};
pub use metrics::MetricsHub;
pub use shutdown::{GracefulShutdown, RecoveryData, ShutdownPhase};
pub use snapshot::{SessionMetricsSnapshot, SnapshotRing};
pub use tracer::{FinishedSpan, LogLevel, SpanStatus, Tracer};
