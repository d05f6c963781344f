//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`Error`]. Lower-level failures (a KV
//! timeout, a malformed JSON blob) are wrapped, never swallowed, carrying a
//! `kind`, the relevant id, and a human message, per spec.md §7.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// The error-kind taxonomy from spec.md §7. Kept separate from [`Error`]'s
/// variant list so API responses can serialize a stable `code` string
/// independent of how many constructors a given kind has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Expired,
    Validation,
    Transient,
    DataIntegrity,
    Policy,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Expired => "expired",
            ErrorKind::Validation => "validation",
            ErrorKind::Transient => "transient",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::Policy => "policy",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured, API-visible error shape: `{code, message, requestId, timestamp, details?}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} already exists")]
    SessionExists { session_id: String },

    #[error("session {session_id} expired")]
    SessionExpired { session_id: String },

    #[error("failed to append event to session {session_id}: {reason}")]
    EventAddFailed { session_id: String, reason: String },

    #[error("checkpoint failed for session {session_id}: {reason}")]
    CheckpointFailed { session_id: String, reason: String },

    #[error("rollback point {id} not found")]
    RollbackPointNotFound { id: String },

    #[error("rollback point {id} already exists")]
    RollbackPointExists { id: String },

    #[error("rollback point {id} expired")]
    RollbackPointExpired { id: String },

    #[error("rollback operation {id} not found")]
    OperationNotFound { id: String },

    #[error("snapshot {id} not found")]
    SnapshotNotFound { id: String },

    #[error("replay {id} not found")]
    ReplayNotFound { id: String },

    #[error("snapshot {id} is corrupted: checksum mismatch")]
    SnapshotCorrupted { id: String },

    #[error("snapshot too large: {size} bytes exceeds limit of {limit} bytes")]
    SnapshotTooLarge { size: usize, limit: usize },

    #[error("agent {id} not found")]
    AgentNotFound { id: String },

    #[error("task {id} not found")]
    TaskNotFound { id: String },

    #[error("task {id} already assigned")]
    TaskAlreadyAssigned { id: String },

    #[error("invalid configuration: {reason}")]
    Validation { reason: String },

    #[error("rollback conflicts detected")]
    RollbackConflict {
        conflicts: Vec<crate::model::Conflict>,
    },

    #[error("policy violation: {reason}")]
    Policy { reason: String },

    #[error("operation {id} cancelled")]
    Cancelled { id: String },

    #[error("KV store error: {0}")]
    Kv(#[from] KvError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// The taxonomy bucket this error belongs to (spec.md §7).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SessionNotFound { .. }
            | Error::RollbackPointNotFound { .. }
            | Error::OperationNotFound { .. }
            | Error::SnapshotNotFound { .. }
            | Error::ReplayNotFound { .. }
            | Error::AgentNotFound { .. }
            | Error::TaskNotFound { .. } => ErrorKind::NotFound,
            Error::SessionExists { .. }
            | Error::RollbackPointExists { .. }
            | Error::TaskAlreadyAssigned { .. } => ErrorKind::Conflict,
            Error::SessionExpired { .. } | Error::RollbackPointExpired { .. } => {
                ErrorKind::Expired
            }
            Error::Validation { .. } => ErrorKind::Validation,
            Error::SnapshotCorrupted { .. } => ErrorKind::DataIntegrity,
            Error::SnapshotTooLarge { .. } => ErrorKind::Validation,
            Error::RollbackConflict { .. } | Error::Policy { .. } => ErrorKind::Policy,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::EventAddFailed { .. } | Error::CheckpointFailed { .. } => ErrorKind::Transient,
            Error::Kv(kv) => kv.kind(),
            Error::Timeout(_) => ErrorKind::Transient,
        }
    }

    /// Build the API-visible body for this error.
    pub fn to_body(&self, request_id: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self.kind().to_string(),
            message: self.to_string(),
            request_id: request_id.into(),
            timestamp: chrono::Utc::now(),
            details: None,
        }
    }
}

/// Errors surfaced by a [`crate::kv::KvFacade`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("transient KV error: {0}")]
    Transient(String),

    #[error("KV authentication failed: {0}")]
    Auth(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("KV protocol error: {0}")]
    Protocol(String),

    #[error("acquiring a connection timed out after {0:?}")]
    AcquireTimeout(std::time::Duration),

    #[error("connection pool is shutting down")]
    PoolClosed,
}

impl KvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KvError::Transient(_) | KvError::AcquireTimeout(_) | KvError::PoolClosed => {
                ErrorKind::Transient
            }
            KvError::Auth(_) => ErrorKind::Policy,
            KvError::NotFound(_) => ErrorKind::NotFound,
            KvError::Protocol(_) => ErrorKind::DataIntegrity,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
