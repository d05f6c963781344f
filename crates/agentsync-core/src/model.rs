//! Data model types shared across the session store, agent coordinator, and
//! rollback engine (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `state` drawn from `{working, broken, coordinating, completed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Working,
    Broken,
    Coordinating,
    Completed,
}

impl SessionState {
    /// Once `completed`, no further events may be appended (spec.md §3).
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed)
    }
}

/// A collaborative coding session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub agent_ids: Vec<String>,
    pub state: SessionState,
    pub events: u64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    /// A session is active while it owns at least one agent.
    pub fn is_active(&self) -> bool {
        !self.agent_ids.is_empty()
    }
}

/// `type` of a session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Modified,
    Broke,
    TestPass,
    Checkpoint,
    Handoff,
}

/// Severity of an [`Impact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The kind of change an event describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub entity_ids: Vec<String>,
    pub operation: String,
}

/// A state transition carried by an event, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub verified_by: Option<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
}

/// Impact metadata carried by an event, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Impact {
    pub severity: Option<Severity>,
    #[serde(default)]
    pub test_failure_ids: Vec<String>,
    /// Negative values indicate a performance regression.
    pub perf_delta: Option<f64>,
}

/// An immutable record appended to a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// 1-based, strictly increasing within a session.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: String,
    pub change_info: ChangeInfo,
    pub state_transition: Option<StateTransition>,
    pub impact: Option<Impact>,
}

/// Aggregated outcome of a session window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOutcome {
    Working,
    Broken,
    Coordinated,
    Completed,
}

/// A materialized summary of a session window, anchored onto the KG when one
/// is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub session_id: String,
    pub outcome: CheckpointOutcome,
    pub key_impacts: Vec<String>,
    pub perf_delta_sum: f64,
    pub agents: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A named marker owning zero or more snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub session_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Type tag of a [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Entity,
    Relationship,
    File,
    Configuration,
    SessionState,
    Metadata,
}

/// A checksummed, canonicalized capture of one typed slice of state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub rollback_point_id: String,
    #[serde(rename = "type")]
    pub snapshot_type: SnapshotType,
    pub data: serde_json::Value,
    pub size: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub checksum: Option<String>,
}

/// `type` of a rollback operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOperationType {
    Full,
    Partial,
    Selective,
    DryRun,
}

/// `status` of a rollback operation, see spec.md §4.10 state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A strategy used to execute a rollback operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategyKind {
    Immediate,
    Gradual,
    Safe,
    Force,
    Partial,
    TimeBased,
    DryRun,
}

/// An entry in an operation's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The lifecycle object a [`crate::rollback::RollbackManager`] drives to
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: RollbackOperationType,
    pub target_rollback_point_id: String,
    pub status: OperationStatus,
    /// In `[0, 100]`.
    pub progress: u8,
    pub strategy: RollbackStrategyKind,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub log: Vec<OperationLogEntry>,
}

impl RollbackOperation {
    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(OperationLogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message: message.into(),
            data: None,
        });
    }
}

/// `status` of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Busy,
    Idle,
    Dead,
    Maintenance,
}

/// A participant identity holding capabilities, load, and a lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: String,
    pub capabilities: HashSet<String>,
    pub priority: i32,
    pub load: u32,
    pub max_load: u32,
    pub status: AgentStatus,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub current_sessions: HashSet<String>,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    /// Streaming mean of task durations, in milliseconds.
    pub average_task_duration_ms: f64,
    /// In `[0, 1]`.
    pub error_rate: f64,
}

impl Agent {
    pub fn load_ratio(&self) -> f64 {
        if self.max_load == 0 {
            1.0
        } else {
            f64::from(self.load) / f64::from(self.max_load)
        }
    }

    pub fn has_capacity(&self) -> bool {
        matches!(self.status, AgentStatus::Active | AgentStatus::Idle) && self.load < self.max_load
    }
}

/// `status` of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of work dispatched by the [`crate::coordinator::AgentCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: i32,
    pub session_id: String,
    pub required_capabilities: HashSet<String>,
    pub estimated_duration_ms: u64,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub metadata: HashMap<String, serde_json::Value>,
    pub assigned_agent: Option<String>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// The kind of disagreement a rollback diff entry provoked against live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ValueMismatch,
    TypeMismatch,
    MissingTarget,
    PermissionDenied,
    DependencyConflict,
}

/// A single disagreement between current state and a rollback target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
    pub current_value: Option<serde_json::Value>,
    pub rollback_value: Option<serde_json::Value>,
    pub context: Option<String>,
}

/// A record of an agent handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub session_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub context: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub priority: i32,
    pub estimated_duration_ms: Option<u64>,
}
