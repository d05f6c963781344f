//! Cross-instance session migration and post-migration validation.
//!
//! Not one of the numbered components in spec.md §2 (the component table
//! apportions no share to it), but it is load-bearing for spec.md §8
//! scenario 5 ("Cross-instance migration validation") and spec.md §4.13's
//! optional `sessionMigration` health component. `SessionMigration` moves a
//! session's document and full event log from a source [`SessionStore`] to
//! a target one, then [`SessionMigration::validate`] re-reads both sides
//! and reports divergence without repeating the copy.

use crate::error::{Error, Result};
use crate::session_store::{CreateOptions, SessionStore};
use tracing::{info, warn};

/// Outcome of migrating a single session.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub session_id: String,
    pub events_copied: u64,
}

/// A single field mismatch found by [`SessionMigration::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub session_id: String,
    pub field: String,
}

/// Result of validating one or more migrated sessions (spec.md §8 scenario 5:
/// `totalChecked`, `passed`, `failed`).
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub total_checked: usize,
    pub passed: usize,
    pub failed: usize,
    pub mismatches: Vec<Mismatch>,
}

/// Copies sessions between two [`SessionStore`]s and validates the copy.
///
/// Holds only shared references to the stores it migrates between; it owns
/// no state of its own; it's safe to construct one per migration run.
pub struct SessionMigration<'a> {
    source: &'a SessionStore,
    target: &'a SessionStore,
}

impl<'a> SessionMigration<'a> {
    pub fn new(source: &'a SessionStore, target: &'a SessionStore) -> Self {
        Self { source, target }
    }

    /// Copies `session_id`'s document and full event log from source to
    /// target. Fails `SESSION_NOT_FOUND` if the source session is absent;
    /// fails `SESSION_EXISTS` if the target already has a session under the
    /// same id (migration is not a merge).
    pub async fn migrate(&self, session_id: &str) -> Result<MigrationReport> {
        let (session, _) = self
            .source
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let events = self.source.events().range(session_id, None, None).await?;

        let first_agent = session
            .agent_ids
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        self.target
            .create(
                session_id,
                &first_agent,
                CreateOptions {
                    ttl_secs: None,
                    metadata: session.metadata.clone(),
                    initial_entity_ids: Vec::new(),
                },
            )
            .await?;

        for agent_id in session.agent_ids.iter().skip(1) {
            self.target.add_agent(session_id, agent_id).await?;
        }

        for event in &events {
            self.target.events().append(session_id, event).await?;
        }

        info!(
            session_id,
            events = events.len(),
            "migrated session to target store"
        );

        Ok(MigrationReport {
            session_id: session_id.to_string(),
            events_copied: events.len() as u64,
        })
    }

    /// Re-reads `session_id` from both stores and reports field-level
    /// divergence: event count, session state, and agent-set membership.
    /// Does not re-copy anything.
    pub async fn validate(&self, session_id: &str) -> Result<ValidationReport> {
        let source = self.source.get(session_id).await?;
        let target = self.target.get(session_id).await?;

        let mut report = ValidationReport {
            total_checked: 1,
            ..Default::default()
        };

        let (Some((source_session, source_events)), Some((target_session, target_events))) =
            (source, target)
        else {
            report.failed = 1;
            report.mismatches.push(Mismatch {
                session_id: session_id.to_string(),
                field: "existence".to_string(),
            });
            return Ok(report);
        };

        let mut mismatches = Vec::new();

        if source_events.len() != target_events.len() {
            mismatches.push(Mismatch {
                session_id: session_id.to_string(),
                field: "Event count mismatch".to_string(),
            });
        } else if source_events != target_events {
            mismatches.push(Mismatch {
                session_id: session_id.to_string(),
                field: "Event content mismatch".to_string(),
            });
        }

        if source_session.state != target_session.state {
            mismatches.push(Mismatch {
                session_id: session_id.to_string(),
                field: "Session state mismatch".to_string(),
            });
        }

        if source_session.metadata != target_session.metadata {
            mismatches.push(Mismatch {
                session_id: session_id.to_string(),
                field: "Session metadata mismatch".to_string(),
            });
        }

        if mismatches.is_empty() {
            report.passed = 1;
        } else {
            warn!(session_id, mismatches = mismatches.len(), "migration validation failed");
            report.failed = 1;
            report.mismatches = mismatches;
        }

        Ok(report)
    }

    /// Migrates then validates every id in `session_ids`, aggregating into a
    /// single [`ValidationReport`].
    pub async fn migrate_and_validate(&self, session_ids: &[&str]) -> Result<ValidationReport> {
        let mut aggregate = ValidationReport::default();
        for id in session_ids {
            self.migrate(id).await?;
            let report = self.validate(id).await?;
            aggregate.total_checked += report.total_checked;
            aggregate.passed += report.passed;
            aggregate.failed += report.failed;
            aggregate.mismatches.extend(report.mismatches);
        }
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::model::{ChangeInfo, EventType, SessionEvent};
    use crate::test_support::in_memory_kv;

    fn store() -> SessionStore {
        SessionStore::new(in_memory_kv(), SessionConfig::default())
    }

    fn event(seq: u64) -> SessionEvent {
        SessionEvent {
            seq,
            timestamp: chrono::Utc::now(),
            event_type: EventType::Modified,
            actor: "A".into(),
            change_info: ChangeInfo {
                entity_ids: vec!["F1".into()],
                operation: "modified".into(),
            },
            state_transition: None,
            impact: None,
        }
    }

    #[tokio::test]
    async fn migrate_then_validate_reports_clean_pass() {
        let source = store();
        let target = store();
        source.create("s1", "A", CreateOptions::default()).await.unwrap();
        for seq in 1..=3 {
            source.events().append("s1", &event(seq)).await.unwrap();
        }

        let migration = SessionMigration::new(&source, &target);
        let report = migration.migrate("s1").await.unwrap();
        assert_eq!(report.events_copied, 3);

        let validation = migration.validate("s1").await.unwrap();
        assert_eq!(validation.total_checked, 1);
        assert_eq!(validation.passed, 1);
        assert_eq!(validation.failed, 0);
    }

    #[tokio::test]
    async fn validate_detects_event_count_mismatch_after_target_drift() {
        let source = store();
        let target = store();
        source.create("s1", "A", CreateOptions::default()).await.unwrap();
        source.events().append("s1", &event(1)).await.unwrap();

        let migration = SessionMigration::new(&source, &target);
        migration.migrate("s1").await.unwrap();

        // Drift the target by appending an extra event only there.
        target.events().append("s1", &event(2)).await.unwrap();

        let validation = migration.validate("s1").await.unwrap();
        assert_eq!(validation.failed, 1);
        assert!(validation
            .mismatches
            .iter()
            .any(|m| m.field == "Event count mismatch"));
    }

    #[tokio::test]
    async fn migrate_missing_source_session_fails_not_found() {
        let source = store();
        let target = store();
        let migration = SessionMigration::new(&source, &target);
        let err = migration.migrate("missing").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }
}
