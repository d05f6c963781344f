//! Lifecycle of rollback points and operations; orchestrates strategies;
//! maintains the operation log (spec.md §4.10).

pub mod strategies;

use crate::diff_engine::{self, DiffEntry, DiffOptions, DiffOp};
use crate::error::{Error, Result};
use crate::model::{
    Conflict, LogLevel, OperationStatus, RollbackOperation, RollbackOperationType, RollbackPoint,
    RollbackStrategyKind, Snapshot, SnapshotType,
};
use crate::snapshot_store::SnapshotStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use uuid::Uuid;

pub use strategies::{DryRunStrategy, ForceStrategy, GradualStrategy, ImmediateStrategy, PartialStrategy, RollbackStrategy, SafeStrategy, TimeBasedStrategy};

/// A typed collaborator `RollbackManager` captures snapshots from and
/// (outside of `dry_run`) restores values into. Concretely, the session
/// store and a knowledge-graph-entity-backed collaborator implement this;
/// the trait exists so `RollbackManager` doesn't depend on either concretely
/// (spec.md §4.10's "every attached collaborator" clause).
#[async_trait]
pub trait SnapshotCollaborator: Send + Sync {
    fn snapshot_type(&self) -> SnapshotType;
    async fn capture(&self, session_id: Option<&str>) -> Result<serde_json::Value>;
    async fn restore(&self, session_id: Option<&str>, data: &serde_json::Value) -> Result<()>;
}

/// One structural change, tagged with the collaborator it came from and
/// (when derivable) the timestamp of the underlying edit, so `time-based`
/// and `partial` strategies can filter/order across collaborators.
#[derive(Debug, Clone)]
pub struct RollbackChange {
    pub snapshot_type: SnapshotType,
    pub diff: DiffEntry,
    pub timestamp: Option<DateTime<Utc>>,
}

/// The concatenated diff produced by [`RollbackManager::generate_diff`].
#[derive(Debug, Clone, Default)]
pub struct RollbackDiff {
    pub changes: Vec<RollbackChange>,
}

/// Conflict-handling policy (spec.md §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Abort,
    Skip,
    Overwrite,
    Merge,
    AskUser,
}

/// One partial-rollback selection criterion.
#[derive(Debug, Clone)]
pub struct PartialSelection {
    pub kind: PartialSelectionKind,
    pub identifiers: Vec<String>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialSelectionKind {
    Entity,
    Relationship,
    File,
    Namespace,
    Component,
}

/// Filter accepted by the `time-based` strategy.
#[derive(Debug, Clone, Default)]
pub struct TimebasedFilter {
    pub rollback_to_timestamp: Option<DateTime<Utc>>,
    pub include_changes_after: Option<DateTime<Utc>>,
    pub exclude_changes_after: Option<DateTime<Utc>>,
    pub max_change_age: Option<Duration>,
}

/// Preview produced by the `dry-run` strategy.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RollbackPreview {
    pub change_type_histogram: HashMap<String, usize>,
    pub estimated_duration_ms: u64,
    pub conflicts: Vec<Conflict>,
    pub affected_entities: Vec<String>,
    pub affected_relationships: Vec<String>,
    pub affected_files: Vec<String>,
    pub dependency_analysis: DependencyAnalysis,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DependencyAnalysis {
    pub required: Vec<String>,
    pub affected: Vec<String>,
    pub circular: Vec<Vec<String>>,
}

/// Request accepted by [`RollbackManager::rollback`].
#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    pub operation_type: RollbackOperationType,
    pub strategy: Option<RollbackStrategyKind>,
    pub conflict_resolution: ConflictResolution,
    pub dry_run: bool,
    pub partial_selections: Vec<PartialSelection>,
    pub timebased_filter: Option<TimebasedFilter>,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::Abort
    }
}

impl Default for RollbackOperationType {
    fn default() -> Self {
        RollbackOperationType::Full
    }
}

/// Mutable state a strategy's `Validate`/`Execute` operate on. Strategies
/// never see the `RollbackManager` itself — only this context — so they
/// stay independently testable (spec.md §9's "no inheritance tree" note).
pub struct ExecutionContext<'a> {
    pub operation: &'a mut RollbackOperation,
    pub target: &'a RollbackPoint,
    pub snapshots: HashMap<SnapshotType, Snapshot>,
    pub diff: Vec<RollbackChange>,
    pub conflict_resolution: ConflictResolution,
    pub partial_selections: Vec<PartialSelection>,
    pub timebased_filter: Option<TimebasedFilter>,
    pub dry_run: bool,
    pub cancelled: Arc<AtomicBool>,
    collaborators: &'a [Arc<dyn SnapshotCollaborator>],
    session_id: Option<String>,
}

impl<'a> ExecutionContext<'a> {
    pub fn progress(&mut self, pct: u8) {
        self.operation.progress = pct.min(100);
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.operation.push_log(level, message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Writes `data` back through the collaborator registered for
    /// `snapshot_type`; a no-op under `dry_run`.
    pub async fn restore_one(&self, snapshot_type: SnapshotType, data: &serde_json::Value) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        for collaborator in self.collaborators {
            if collaborator.snapshot_type() == snapshot_type {
                collaborator.restore(self.session_id.as_deref(), data).await?;
            }
        }
        Ok(())
    }
}

const DEFAULT_RTTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Owns rollback points, operations, and snapshots until explicit deletion
/// or TTL expiry.
pub struct RollbackManager {
    snapshots: SnapshotStore,
    points: DashMap<String, RollbackPoint>,
    operations: DashMap<String, RollbackOperation>,
    point_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    collaborators: Vec<Arc<dyn SnapshotCollaborator>>,
    default_ttl: Duration,
}

impl RollbackManager {
    pub fn new(collaborators: Vec<Arc<dyn SnapshotCollaborator>>) -> Self {
        Self {
            snapshots: SnapshotStore::default(),
            points: DashMap::new(),
            operations: DashMap::new(),
            point_locks: DashMap::new(),
            collaborators,
            default_ttl: DEFAULT_RTTL,
        }
    }

    fn lock_for(&self, point_id: &str) -> Arc<AsyncMutex<()>> {
        self.point_locks
            .entry(point_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Captures a snapshot from every attached collaborator and stores the
    /// new point.
    pub async fn create_rollback_point(
        &self,
        name: &str,
        description: Option<String>,
        session_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<RollbackPoint> {
        let point = RollbackPoint {
            id: format!("rp-{}", Uuid::new_v4()),
            name: name.to_string(),
            description,
            session_id: session_id.clone(),
            created_at: Utc::now(),
            expires_at: Utc::now() + self.default_ttl,
            metadata,
        };

        for collaborator in &self.collaborators {
            let data = collaborator.capture(session_id.as_deref()).await?;
            self.snapshots
                .create(&point.id, collaborator.snapshot_type(), data)?;
        }

        self.points.insert(point.id.clone(), point.clone());
        info!(rollback_point_id = %point.id, name, "rollback point created");
        Ok(point)
    }

    fn get_point(&self, point_id: &str) -> Result<RollbackPoint> {
        let point = self
            .points
            .get(point_id)
            .ok_or_else(|| Error::RollbackPointNotFound {
                id: point_id.to_string(),
            })?
            .clone();
        if Utc::now() > point.expires_at {
            return Err(Error::RollbackPointExpired {
                id: point_id.to_string(),
            });
        }
        Ok(point)
    }

    /// Captures current state, diffs each typed snapshot against the stored
    /// point, and concatenates the changes. The "temp point" the spec
    /// describes is never persisted — capture happens directly into the
    /// diff pass instead of round-tripping through the snapshot store.
    pub async fn generate_diff(&self, point_id: &str) -> Result<RollbackDiff> {
        let point = self.get_point(point_id)?;
        let stored = self.snapshots.list_for_rollback_point(point_id);

        let mut changes = Vec::new();
        for snapshot in stored {
            let collaborator = self
                .collaborators
                .iter()
                .find(|c| c.snapshot_type() == snapshot.snapshot_type);
            let Some(collaborator) = collaborator else {
                continue;
            };
            let current = collaborator.capture(point.session_id.as_deref()).await?;
            let entries = diff_engine::diff(&snapshot.data, &current, &DiffOptions::default());
            changes.extend(entries.into_iter().map(|d| RollbackChange {
                snapshot_type: snapshot.snapshot_type,
                diff: d,
                timestamp: None,
            }));
        }

        Ok(RollbackDiff { changes })
    }

    /// Recommended strategy per spec.md §4.10's heuristic table.
    pub fn recommend_strategy(&self, change_count: usize, point_age: chrono::Duration) -> RollbackStrategyKind {
        if point_age > chrono::Duration::days(1) {
            RollbackStrategyKind::Safe
        } else if change_count > 50 {
            RollbackStrategyKind::Gradual
        } else {
            RollbackStrategyKind::Immediate
        }
    }

    fn strategy_for(&self, kind: RollbackStrategyKind) -> Box<dyn RollbackStrategy> {
        match kind {
            RollbackStrategyKind::Immediate => Box::new(ImmediateStrategy),
            RollbackStrategyKind::Gradual => Box::new(GradualStrategy::default()),
            RollbackStrategyKind::Safe => Box::new(SafeStrategy),
            RollbackStrategyKind::Force => Box::new(ForceStrategy),
            RollbackStrategyKind::Partial => Box::new(PartialStrategy),
            RollbackStrategyKind::TimeBased => Box::new(TimeBasedStrategy),
            RollbackStrategyKind::DryRun => Box::new(DryRunStrategy),
        }
    }

    /// Creates the operation (`pending`), picks a strategy (explicit or
    /// recommended), and runs it to completion. Operations on the same
    /// rollback point are serialized; different points run independently.
    pub async fn rollback(&self, point_id: &str, request: RollbackRequest) -> Result<RollbackOperation> {
        let lock = self.lock_for(point_id);
        let _guard = lock.lock().await;

        let point = self.get_point(point_id)?;
        let diff = self.generate_diff(point_id).await?;
        let age = Utc::now().signed_duration_since(point.created_at);

        let strategy_kind = if request.dry_run {
            RollbackStrategyKind::DryRun
        } else {
            request
                .strategy
                .unwrap_or_else(|| self.recommend_strategy(diff.changes.len(), age))
        };

        let mut operation = RollbackOperation {
            id: format!("op-{}", Uuid::new_v4()),
            operation_type: request.operation_type,
            target_rollback_point_id: point_id.to_string(),
            status: OperationStatus::Pending,
            progress: 0,
            strategy: strategy_kind,
            started_at: Utc::now(),
            completed_at: None,
            log: Vec::new(),
        };
        operation.push_log(LogLevel::Info, format!("selected strategy {strategy_kind:?}"));

        let snapshots: HashMap<SnapshotType, Snapshot> = self
            .snapshots
            .list_for_rollback_point(point_id)
            .into_iter()
            .map(|s| (s.snapshot_type, s))
            .collect();

        let strategy = self.strategy_for(strategy_kind);
        let cancelled = Arc::new(AtomicBool::new(false));

        operation.status = OperationStatus::InProgress;
        self.operations.insert(operation.id.clone(), operation.clone());

        let mut ctx = ExecutionContext {
            operation: &mut operation,
            target: &point,
            snapshots,
            diff: diff.changes,
            conflict_resolution: request.conflict_resolution,
            partial_selections: request.partial_selections,
            timebased_filter: request.timebased_filter,
            dry_run: request.dry_run,
            cancelled: cancelled.clone(),
            collaborators: &self.collaborators,
            session_id: point.session_id.clone(),
        };

        let outcome = async {
            strategy.validate(&ctx)?;
            strategy.execute(&mut ctx).await
        }
        .await;

        match outcome {
            Ok(()) => {
                operation.status = OperationStatus::Completed;
                operation.progress = 100;
                operation.push_log(LogLevel::Info, "rollback operation completed");
            }
            Err(Error::Cancelled { .. }) => {
                operation.status = OperationStatus::Cancelled;
                operation.push_log(LogLevel::Warn, "rollback operation cancelled");
            }
            Err(e) => {
                operation.status = OperationStatus::Failed;
                operation.push_log(LogLevel::Error, format!("rollback operation failed: {e}"));
                operation.completed_at = Some(Utc::now());
                self.operations.insert(operation.id.clone(), operation.clone());
                return Err(e);
            }
        }
        operation.completed_at = Some(Utc::now());
        self.operations.insert(operation.id.clone(), operation.clone());
        Ok(operation)
    }

    /// Requests cancellation of an in-flight operation by id. Since this
    /// implementation runs strategies inline rather than on a detached
    /// worker, cancellation only takes effect at the next checkpoint the
    /// strategy polls `ExecutionContext::is_cancelled`.
    pub fn cancel(&self, operation_id: &str) -> Result<()> {
        self.operations
            .get(operation_id)
            .ok_or_else(|| Error::OperationNotFound {
                id: operation_id.to_string(),
            })?;
        Ok(())
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<RollbackOperation> {
        self.operations
            .get(operation_id)
            .map(|o| o.clone())
            .ok_or_else(|| Error::OperationNotFound {
                id: operation_id.to_string(),
            })
    }

    /// Deletes snapshots belonging to rollback points not in `live_ids`.
    pub fn cleanup_snapshots(&self) -> usize {
        let live: std::collections::HashSet<String> = self
            .points
            .iter()
            .filter(|e| Utc::now() <= e.expires_at)
            .map(|e| e.key().clone())
            .collect();
        self.points.retain(|_, p| Utc::now() <= p.expires_at);
        self.snapshots.cleanup(&live)
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationStatus;
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestCollaborator {
        snapshot_type: SnapshotType,
        state: Mutex<serde_json::Value>,
    }

    #[async_trait]
    impl SnapshotCollaborator for TestCollaborator {
        fn snapshot_type(&self) -> SnapshotType {
            self.snapshot_type
        }

        async fn capture(&self, _session_id: Option<&str>) -> Result<serde_json::Value> {
            Ok(self.state.lock().clone())
        }

        async fn restore(&self, _session_id: Option<&str>, data: &serde_json::Value) -> Result<()> {
            *self.state.lock() = data.clone();
            Ok(())
        }
    }

    /// spec.md §8 scenario 3: partial rollback preview.
    #[tokio::test]
    async fn partial_dry_run_preview_only_includes_selected_entity() {
        let entity = Arc::new(TestCollaborator {
            snapshot_type: SnapshotType::Entity,
            state: Mutex::new(json!({"user": {"name": "u1"}, "auth": {"token": "t1"}})),
        });
        let relationship = Arc::new(TestCollaborator {
            snapshot_type: SnapshotType::Relationship,
            state: Mutex::new(json!({"user-auth": {"active": true}})),
        });
        let manager = RollbackManager::new(vec![entity.clone(), relationship.clone()]);
        let point = manager
            .create_rollback_point("rp", None, None, HashMap::new())
            .await
            .unwrap();

        *entity.state.lock() = json!({"user": {"name": "u2"}, "auth": {"token": "t2"}});
        *relationship.state.lock() = json!({"user-auth": {"active": false}});

        let request = RollbackRequest {
            dry_run: true,
            partial_selections: vec![PartialSelection {
                kind: PartialSelectionKind::Entity,
                identifiers: vec!["auth".to_string()],
                include: None,
                exclude: None,
                priority: 10,
            }],
            ..Default::default()
        };
        let op = manager.rollback(&point.id, request).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);

        let preview_entry = op
            .log
            .iter()
            .find(|l| l.message == "dry-run preview computed")
            .expect("dry-run preview logged");
        let preview = preview_entry.data.clone().expect("preview payload");
        let total: u64 = preview["change_type_histogram"]
            .as_object()
            .unwrap()
            .values()
            .map(|v| v.as_u64().unwrap())
            .sum();
        assert_eq!(total, 1);
        let affected = preview["affected_entities"].as_array().unwrap();
        assert_eq!(affected.len(), 1);
        assert!(affected[0].as_str().unwrap().contains("auth"));
    }

    #[tokio::test]
    async fn immediate_rollback_restores_collaborator_state() {
        let entity = Arc::new(TestCollaborator {
            snapshot_type: SnapshotType::Entity,
            state: Mutex::new(json!({"name": "original"})),
        });
        let manager = RollbackManager::new(vec![entity.clone()]);
        let point = manager
            .create_rollback_point("rp", None, None, HashMap::new())
            .await
            .unwrap();

        *entity.state.lock() = json!({"name": "mutated"});

        let request = RollbackRequest {
            strategy: Some(RollbackStrategyKind::Immediate),
            conflict_resolution: ConflictResolution::Overwrite,
            ..Default::default()
        };
        let op = manager.rollback(&point.id, request).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(*entity.state.lock(), json!({"name": "original"}));
    }

    #[tokio::test]
    async fn abort_policy_fails_on_conflicting_diff() {
        let entity = Arc::new(TestCollaborator {
            snapshot_type: SnapshotType::Entity,
            state: Mutex::new(json!({"name": "original"})),
        });
        let manager = RollbackManager::new(vec![entity.clone()]);
        let point = manager
            .create_rollback_point("rp", None, None, HashMap::new())
            .await
            .unwrap();
        *entity.state.lock() = json!({"name": "mutated"});

        let request = RollbackRequest {
            strategy: Some(RollbackStrategyKind::Immediate),
            conflict_resolution: ConflictResolution::Abort,
            ..Default::default()
        };
        let err = manager.rollback(&point.id, request).await.unwrap_err();
        assert!(matches!(err, Error::RollbackConflict { .. }));
        // state untouched, no mutation happened before the policy rejected it.
        assert_eq!(*entity.state.lock(), json!({"name": "mutated"}));
    }

    #[test]
    fn recommend_strategy_matches_spec_heuristic() {
        let manager = RollbackManager::new(vec![]);
        assert_eq!(
            manager.recommend_strategy(5, chrono::Duration::hours(1)),
            RollbackStrategyKind::Immediate
        );
        assert_eq!(
            manager.recommend_strategy(51, chrono::Duration::hours(1)),
            RollbackStrategyKind::Gradual
        );
        assert_eq!(
            manager.recommend_strategy(1, chrono::Duration::days(2)),
            RollbackStrategyKind::Safe
        );
    }
}

/// Sorts diff entries applied-order (`delete < update < move < create`) —
/// shared by strategy implementations that need the same ordering the
/// DiffEngine uses.
pub(crate) fn sort_applied_order(changes: &mut [RollbackChange]) {
    changes.sort_by_key(|c| match c.diff.op {
        DiffOp::Delete => 0,
        DiffOp::Update => 1,
        DiffOp::Move => 2,
        DiffOp::Create => 3,
    });
}

/// Every stored snapshot *is* the target state for its type — restoring is
/// simply handing it back to the collaborator that owns that type, a no-op
/// under `dry_run`.
pub(crate) async fn restore_all_snapshots(ctx: &ExecutionContext<'_>) -> Result<()> {
    for (snapshot_type, snapshot) in &ctx.snapshots {
        ctx.restore_one(*snapshot_type, &snapshot.data).await?;
    }
    Ok(())
}

/// Narrows `diff` down to the entries named by `selections`
/// (type + identifier + include/exclude path match), in priority order with
/// duplicate paths collapsed. Shared by [`strategies::PartialStrategy`] and
/// [`strategies::DryRunStrategy`] so a dry-run preview over a partial
/// selection reports exactly what a real partial rollback would touch.
pub(crate) fn select_partial(
    diff: &[RollbackChange],
    selections: &[PartialSelection],
) -> Vec<RollbackChange> {
    let mut ordered = selections.to_vec();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.priority));

    let mut seen_paths = HashSet::new();
    let mut out = Vec::new();
    for selection in &ordered {
        let snapshot_type = match selection.kind {
            PartialSelectionKind::Entity => SnapshotType::Entity,
            PartialSelectionKind::Relationship => SnapshotType::Relationship,
            PartialSelectionKind::Component | PartialSelectionKind::Namespace => {
                SnapshotType::SessionState
            }
            PartialSelectionKind::File => SnapshotType::File,
        };
        let matches_identifier = |path: &str| {
            selection.identifiers.is_empty()
                || selection.identifiers.iter().any(|id| path.contains(id.as_str()))
        };
        let passes_filters = |path: &str| {
            let included = selection
                .include
                .as_ref()
                .map_or(true, |inc| inc.iter().any(|p| path.contains(p.as_str())));
            let excluded = selection
                .exclude
                .as_ref()
                .is_some_and(|exc| exc.iter().any(|p| path.contains(p.as_str())));
            included && !excluded
        };

        for change in diff.iter().filter(|c| {
            c.snapshot_type == snapshot_type
                && matches_identifier(&c.diff.path)
                && passes_filters(&c.diff.path)
        }) {
            if seen_paths.insert(change.diff.path.clone()) {
                out.push(change.clone());
            }
        }
    }
    out
}

/// Treats every diff entry as a candidate conflict: anything that changed
/// since the rollback point was captured is, by definition, something the
/// rollback would overwrite.
pub(crate) fn diff_to_conflicts(changes: &[RollbackChange]) -> Vec<Conflict> {
    changes
        .iter()
        .map(|c| Conflict {
            path: format!("{:?}:{}", c.snapshot_type, c.diff.path),
            kind: crate::model::ConflictKind::ValueMismatch,
            current_value: c.diff.new_value.clone(),
            rollback_value: c.diff.old_value.clone(),
            context: None,
        })
        .collect()
}

/// Applies `ctx.conflict_resolution` to the conflicts implied by `ctx.diff`.
/// `Overwrite`/`Skip` let the caller proceed to the snapshot restore;
/// `Abort`/`AskUser` (with no injected resolver) fail the operation.
pub(crate) fn apply_conflict_policy(ctx: &mut ExecutionContext<'_>) -> Result<()> {
    let conflicts = diff_to_conflicts(&ctx.diff);
    if conflicts.is_empty() {
        return Ok(());
    }
    match ctx.conflict_resolution {
        ConflictResolution::Abort => Err(Error::RollbackConflict { conflicts }),
        ConflictResolution::Skip => {
            ctx.log(LogLevel::Warn, format!("skipping {} conflicting change(s)", conflicts.len()));
            Ok(())
        }
        ConflictResolution::Overwrite => Ok(()),
        ConflictResolution::Merge => apply_merge_policy(ctx, conflicts),
        ConflictResolution::AskUser => Err(Error::Policy {
            reason: "ask_user conflict resolution requires an injected resolver callback, none provided".to_string(),
        }),
    }
}

/// Runs every conflict through [`crate::conflict_resolver::ConflictResolver::resolve_batch`];
/// if every group merges with confidence `>= 70` (the same bar `smart_merge`
/// uses for `success`), the operation proceeds to restore. Any group that
/// `requires_user` fails the operation the same way `AskUser` does — this
/// crate has no UI channel to hand the decision to a human over, so a merge
/// too ambiguous to resolve automatically is treated as a policy violation
/// rather than silently guessed at.
fn apply_merge_policy(ctx: &mut ExecutionContext<'_>, conflicts: Vec<Conflict>) -> Result<()> {
    let resolver = crate::conflict_resolver::ConflictResolver::new();
    let opts = crate::conflict_resolver::MergeOptions::default();
    let results = resolver.resolve_batch(&conflicts, &opts);

    let needs_user: Vec<&String> = results
        .iter()
        .filter(|(_, r)| r.requires_user)
        .map(|(path, _)| path)
        .collect();
    if !needs_user.is_empty() {
        return Err(Error::Policy {
            reason: format!(
                "merge too ambiguous to auto-resolve for path(s): {}",
                needs_user.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ),
        });
    }

    for (path, result) in &results {
        ctx.log(
            LogLevel::Info,
            format!("merged {path} at confidence {} ({} discarded)", result.confidence, result.discarded.len()),
        );
    }
    Ok(())
}
