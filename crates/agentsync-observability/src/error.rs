//! Error types for `agentsync` observability.

use thiserror::Error;

/// Error type for metrics, tracing, and health/shutdown operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to register metric: {0}")]
    Registration(String),

    #[error("failed to export metrics: {0}")]
    Export(String),

    #[error("metrics server error: {0}")]
    Server(String),

    #[error("span {0} not found")]
    SpanNotFound(String),

    #[error("shutdown phase {phase} exceeded its deadline")]
    ShutdownTimeout { phase: String },
}

/// Result type for observability operations.
pub type Result<T> = std::result::Result<T, Error>;
