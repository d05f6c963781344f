//! The seven rollback strategies (spec.md §4.10's per-strategy contract
//! table). Each is a plain struct implementing [`RollbackStrategy`] rather
//! than a subclass of some base `Strategy` type, so they stay independently
//! constructible and testable.

use super::{
    apply_conflict_policy, diff_to_conflicts, restore_all_snapshots, sort_applied_order,
    DependencyAnalysis, ExecutionContext, PartialSelectionKind, RollbackChange, RollbackPreview,
};
use crate::diff_engine::Complexity;
use crate::error::{Error, Result};
use crate::model::LogLevel;
use async_trait::async_trait;
use std::time::Duration;

/// The strategy interface `RollbackManager` drives. Strategies receive an
/// [`ExecutionContext`], never the manager itself.
#[async_trait]
pub trait RollbackStrategy: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Pre-flight check run before `execute`; raises validation errors that
    /// shouldn't count as an in-flight failure.
    fn validate(&self, ctx: &ExecutionContext<'_>) -> Result<()>;

    /// Rough wall-clock estimate surfaced to callers before they commit.
    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration;

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()>;
}

fn check_cancelled(ctx: &ExecutionContext<'_>) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled {
            id: ctx.operation.id.clone(),
        });
    }
    Ok(())
}

/// Applies every change in one pass after resolving conflicts up front.
pub struct ImmediateStrategy;

#[async_trait]
impl RollbackStrategy for ImmediateStrategy {
    fn kind(&self) -> &'static str {
        "immediate"
    }

    fn validate(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if ctx.target.session_id.is_none() && ctx.snapshots.is_empty() {
            return Err(Error::Validation {
                reason: "rollback point has no captured snapshots".to_string(),
            });
        }
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(50 + ctx.diff.len() as u64 * 2)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        ctx.log(LogLevel::Info, "applying all changes immediately");
        apply_conflict_policy(ctx)?;
        check_cancelled(ctx)?;
        restore_all_snapshots(ctx).await?;
        ctx.progress(100);
        Ok(())
    }
}

/// Restores snapshots in fixed-size batches, yielding between batches so the
/// operation stays cancellable and progress is observable mid-flight.
pub struct GradualStrategy {
    pub batch_size: usize,
    pub delay: Duration,
}

impl Default for GradualStrategy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl RollbackStrategy for GradualStrategy {
    fn kind(&self) -> &'static str {
        "gradual"
    }

    fn validate(&self, _ctx: &ExecutionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        let batches = ctx.snapshots.len().div_ceil(self.batch_size.max(1)) as u32;
        self.delay * batches
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        apply_conflict_policy(ctx)?;

        let snapshot_types: Vec<_> = ctx.snapshots.keys().copied().collect();
        let total = snapshot_types.len().max(1);

        for (i, chunk) in snapshot_types.chunks(self.batch_size.max(1)).enumerate() {
            check_cancelled(ctx)?;
            for snapshot_type in chunk {
                let data = ctx.snapshots.get(snapshot_type).map(|s| s.data.clone());
                if let Some(data) = data {
                    ctx.restore_one(*snapshot_type, &data).await?;
                }
            }
            let applied = (i + 1) * self.batch_size.max(1);
            ctx.progress(((applied.min(total) * 100) / total) as u8);
            ctx.log(LogLevel::Debug, format!("batch {} applied", i + 1));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(())
    }
}

/// A rollback point older than this is refused by [`SafeStrategy`] (spec.md
/// §4.10): the snapshot is stale enough that "safe" can no longer promise
/// the restore matches intent, so it should go through `force` or
/// `time-based` instead.
const SAFE_MAX_POINT_AGE_DAYS: i64 = 7;

/// Refuses to proceed while any conflict remains, regardless of
/// `conflict_resolution` — the one strategy that won't honor `Overwrite`.
pub struct SafeStrategy;

#[async_trait]
impl RollbackStrategy for SafeStrategy {
    fn kind(&self) -> &'static str {
        "safe"
    }

    fn validate(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let age = chrono::Utc::now().signed_duration_since(ctx.target.created_at);
        if age > chrono::Duration::days(SAFE_MAX_POINT_AGE_DAYS) {
            return Err(Error::Validation {
                reason: format!(
                    "rollback point is {} day(s) old, exceeding the safe strategy's {}-day limit; use force or time-based instead",
                    age.num_days(),
                    SAFE_MAX_POINT_AGE_DAYS
                ),
            });
        }

        let conflicts = diff_to_conflicts(&ctx.diff);
        if !conflicts.is_empty() {
            return Err(Error::RollbackConflict { conflicts });
        }
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(100 + ctx.diff.len() as u64 * 3)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        ctx.log(LogLevel::Info, "no conflicts detected, restoring snapshots");
        check_cancelled(ctx)?;
        restore_all_snapshots(ctx).await?;
        ctx.progress(100);
        Ok(())
    }
}

/// Ignores conflicts entirely and overwrites current state unconditionally.
pub struct ForceStrategy;

#[async_trait]
impl RollbackStrategy for ForceStrategy {
    fn kind(&self) -> &'static str {
        "force"
    }

    fn validate(&self, _ctx: &ExecutionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(50 + ctx.diff.len() as u64)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        if !ctx.diff.is_empty() {
            ctx.log(
                LogLevel::Warn,
                format!("force strategy overwriting {} conflicting change(s)", ctx.diff.len()),
            );
        }
        check_cancelled(ctx)?;
        restore_all_snapshots(ctx).await?;
        ctx.progress(100);
        Ok(())
    }
}

/// Restores only the snapshot types named by `partial_selections`, applying
/// `include`/`exclude` path filters to each type's diff entries before
/// restoring. Ordering across selections falls back to `priority` since this
/// layer has no generic dependency-edge source to topologically sort on.
pub struct PartialStrategy;

#[async_trait]
impl RollbackStrategy for PartialStrategy {
    fn kind(&self) -> &'static str {
        "partial"
    }

    fn validate(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if ctx.partial_selections.is_empty() {
            return Err(Error::Validation {
                reason: "partial rollback requires at least one selection".to_string(),
            });
        }
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(50 + ctx.partial_selections.len() as u64 * 20)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut selections = ctx.partial_selections.clone();
        selections.sort_by_key(|s| std::cmp::Reverse(s.priority));

        for selection in &selections {
            check_cancelled(ctx)?;
            let snapshot_type = match selection.kind {
                PartialSelectionKind::Entity => crate::model::SnapshotType::Entity,
                PartialSelectionKind::Relationship => crate::model::SnapshotType::Relationship,
                PartialSelectionKind::Component | PartialSelectionKind::Namespace => {
                    crate::model::SnapshotType::SessionState
                }
                PartialSelectionKind::File => crate::model::SnapshotType::File,
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

            let selected: Vec<_> = ctx
                .diff
                .iter()
                .filter(|c| {
                    c.snapshot_type == snapshot_type
                        && matches_identifier(&c.diff.path)
                        && passes_filters(&c.diff.path)
                })
                .cloned()
                .collect();

            if selected.is_empty() {
                continue;
            }
            let Some(snapshot) = ctx.snapshots.get(&snapshot_type).cloned() else {
                continue;
            };
            ctx.log(
                LogLevel::Info,
                format!("restoring {} path(s) for {:?}", selected.len(), snapshot_type),
            );
            ctx.restore_one(snapshot_type, &snapshot.data).await?;
        }
        ctx.progress(100);
        Ok(())
    }
}

/// Restores only changes whose timestamp satisfies `timebased_filter`. Since
/// `generate_diff` doesn't currently attach a per-entry timestamp, this is
/// best-effort: changes with no timestamp are treated as always-eligible.
pub struct TimeBasedStrategy;

#[async_trait]
impl RollbackStrategy for TimeBasedStrategy {
    fn kind(&self) -> &'static str {
        "time_based"
    }

    fn validate(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if ctx.timebased_filter.is_none() {
            return Err(Error::Validation {
                reason: "time-based rollback requires a timebased_filter".to_string(),
            });
        }
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(50 + ctx.diff.len() as u64 * 2)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let filter = ctx.timebased_filter.clone().unwrap_or_default();
        let mut eligible: Vec<_> = ctx
            .diff
            .iter()
            .filter(|c| match c.timestamp {
                None => true,
                Some(ts) => {
                    filter.rollback_to_timestamp.map_or(true, |cutoff| ts <= cutoff)
                        && filter.include_changes_after.map_or(true, |after| ts >= after)
                        && filter.exclude_changes_after.map_or(true, |after| ts < after)
                        && filter.max_change_age.map_or(true, |max_age| {
                            chrono::Utc::now().signed_duration_since(ts)
                                <= chrono::Duration::from_std(max_age).unwrap_or_default()
                        })
                }
            })
            .cloned()
            .collect();

        sort_applied_order(&mut eligible);
        apply_conflict_policy(ctx)?;
        check_cancelled(ctx)?;

        let types: std::collections::HashSet<_> = eligible.iter().map(|c| c.snapshot_type).collect();
        for snapshot_type in types {
            if let Some(snapshot) = ctx.snapshots.get(&snapshot_type).cloned() {
                ctx.restore_one(snapshot_type, &snapshot.data).await?;
            }
        }
        ctx.progress(100);
        Ok(())
    }
}

/// Computes and logs a [`RollbackPreview`] without writing anything back —
/// `ExecutionContext::restore_one` is already a no-op under `dry_run`, so
/// this strategy just needs to build the preview and stop.
pub struct DryRunStrategy;

#[async_trait]
impl RollbackStrategy for DryRunStrategy {
    fn kind(&self) -> &'static str {
        "dry_run"
    }

    fn validate(&self, _ctx: &ExecutionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn estimate_time(&self, ctx: &ExecutionContext<'_>) -> Duration {
        Duration::from_millis(20 + ctx.diff.len() as u64)
    }

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<()> {
        let mut histogram = std::collections::HashMap::new();
        let mut affected_entities = Vec::new();
        let mut affected_relationships = Vec::new();
        let mut affected_files = Vec::new();

        // A dry-run combined with a partial selection previews exactly what
        // that partial rollback would touch, not the full diff.
        let selected;
        let diff: &[RollbackChange] = if ctx.partial_selections.is_empty() {
            &ctx.diff
        } else {
            selected = super::select_partial(&ctx.diff, &ctx.partial_selections);
            &selected
        };

        for change in diff {
            *histogram.entry(format!("{:?}", change.diff.op)).or_insert(0usize) += 1;
            match change.snapshot_type {
                crate::model::SnapshotType::Entity => affected_entities.push(change.diff.path.clone()),
                crate::model::SnapshotType::Relationship => {
                    affected_relationships.push(change.diff.path.clone())
                }
                crate::model::SnapshotType::File => affected_files.push(change.diff.path.clone()),
                _ => {}
            }
        }

        let summary = crate::diff_engine::summarize(
            &diff.iter().map(|c| c.diff.clone()).collect::<Vec<_>>(),
        );
        let estimated_duration_ms = match summary.complexity {
            Complexity::Low => 100,
            Complexity::Medium => 1_000,
            Complexity::High => 10_000,
        };

        let dependency_analysis = analyze_dependencies(diff, &affected_entities);

        let preview = RollbackPreview {
            change_type_histogram: histogram,
            estimated_duration_ms,
            conflicts: diff_to_conflicts(diff),
            affected_entities,
            affected_relationships,
            affected_files,
            dependency_analysis,
        };

        ctx.operation.log.push(crate::model::OperationLogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            message: "dry-run preview computed".to_string(),
            data: serde_json::to_value(&preview).ok(),
        });
        ctx.progress(100);
        Ok(())
    }
}

/// Builds a dependency graph from relationship-typed diff entries (each
/// expected to carry `from`/`to` entity-id fields on its new or old value,
/// the shape a KG relationship snapshot diffs to) and reports the entities
/// those relationships require, everything reachable from the rollback's
/// affected set, and any cycle among them via DFS.
fn analyze_dependencies(diff: &[RollbackChange], affected_entities: &[String]) -> DependencyAnalysis {
    let mut edges: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    let mut required: Vec<String> = Vec::new();

    for change in diff {
        if change.snapshot_type != crate::model::SnapshotType::Relationship {
            continue;
        }
        let value = change.diff.new_value.as_ref().or(change.diff.old_value.as_ref());
        let Some(obj) = value.and_then(|v| v.as_object()) else {
            continue;
        };
        let from = obj.get("from").and_then(|v| v.as_str());
        let to = obj.get("to").and_then(|v| v.as_str());
        if let (Some(from), Some(to)) = (from, to) {
            edges.entry(from.to_string()).or_default().push(to.to_string());
            required.push(from.to_string());
            required.push(to.to_string());
        }
    }
    required.sort();
    required.dedup();

    let mut affected: Vec<String> = affected_entities.to_vec();
    affected.extend(required.iter().cloned());
    affected.sort();
    affected.dedup();

    let circular = find_cycles(&edges);

    DependencyAnalysis {
        required,
        affected,
        circular,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum DfsMark {
    White,
    Gray,
    Black,
}

/// White/gray/black DFS cycle detection; returns each cycle found as the
/// ordered list of nodes from where it closes back on itself.
fn find_cycles(edges: &std::collections::HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut nodes: Vec<String> = edges.keys().cloned().collect();
    for targets in edges.values() {
        nodes.extend(targets.iter().cloned());
    }
    nodes.sort();
    nodes.dedup();

    fn dfs(
        node: &str,
        edges: &std::collections::HashMap<String, Vec<String>>,
        marks: &mut std::collections::HashMap<String, DfsMark>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node.to_string(), DfsMark::Gray);
        stack.push(node.to_string());

        if let Some(targets) = edges.get(node) {
            for target in targets {
                match marks.get(target.as_str()).copied().unwrap_or(DfsMark::White) {
                    DfsMark::White => dfs(target, edges, marks, stack, cycles),
                    DfsMark::Gray => {
                        let start = stack.iter().position(|n| n == target).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(target.clone());
                        cycles.push(cycle);
                    }
                    DfsMark::Black => {}
                }
            }
        }

        stack.pop();
        marks.insert(node.to_string(), DfsMark::Black);
    }

    let mut marks: std::collections::HashMap<String, DfsMark> =
        nodes.iter().map(|n| (n.clone(), DfsMark::White)).collect();
    let mut stack = Vec::new();
    let mut cycles = Vec::new();
    for node in &nodes {
        if marks.get(node).copied() == Some(DfsMark::White) {
            dfs(node, edges, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_a_simple_cycle() {
        let mut edges = std::collections::HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["c".to_string()]);
        edges.insert("c".to_string(), vec!["a".to_string()]);
        let cycles = find_cycles(&edges);
        assert_eq!(cycles.len(), 1);
    }

    #[test]
    fn acyclic_graph_reports_no_cycles() {
        let mut edges = std::collections::HashMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["c".to_string()]);
        assert!(find_cycles(&edges).is_empty());
    }
}
