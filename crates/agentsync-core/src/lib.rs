//! Backend-agnostic coordination core for multi-agent coding sessions:
//! session lifecycle, event log, agent/task coordination, and a rollback
//! engine built on structural diffs and pluggable strategies.
//!
//! This crate depends on nothing Redis-specific — it is written against the
//! [`kv::KvFacade`] trait. `agentsync-redis` supplies a Redis-backed
//! implementation; [`test_support::InMemoryKv`] supplies one for tests.

pub mod config;
pub mod conflict_resolver;
pub mod coordinator;
pub mod diff_engine;
pub mod enhanced_session_store;
pub mod error;
pub mod event_log;
pub mod kg;
pub mod kv;
pub mod migration;
pub mod model;
pub mod replay;
pub mod rollback;
pub mod session_bridge;
pub mod session_manager;
pub mod session_store;
pub mod snapshot_store;
pub mod test_support;

pub use config::{RedisConfig, SessionConfig};
pub use conflict_resolver::ConflictResolver;
pub use coordinator::{AgentCoordinator, LoadBalancingStrategy, SubmitTaskOptions};
pub use diff_engine::{DiffEntry, DiffOp, DiffOptions, DiffSummary};
pub use enhanced_session_store::{AccelerationConfig, EnhancedSessionStore};
pub use error::{Error, ErrorBody, ErrorKind, KvError, Result};
pub use event_log::EventLog;
pub use kg::{KgError, KgRow, KnowledgeGraph};
pub use kv::{Channels, ConnKind, Fields, KvFacade, PubSubMessage, ScoredMember};
pub use migration::{MigrationReport, Mismatch, SessionMigration, ValidationReport};
pub use replay::{ReplayFrame, ReplayMeta, ReplayStatus, SessionReplay};
pub use rollback::{RollbackManager, RollbackRequest, SnapshotCollaborator};
pub use session_bridge::{SessionBridge, SessionReader};
pub use session_manager::SessionManager;
pub use session_store::{SessionStats, SessionStore};
pub use snapshot_store::SnapshotStore;
