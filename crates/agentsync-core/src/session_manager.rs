//! Owns the correctness-critical path: sequence allocation, join/leave,
//! event emission, auto-checkpoint cadence, KG anchor writes, and the
//! failure-snapshot hook (spec.md §4.5).

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::kg::{self, KnowledgeGraph};
use crate::kv::KvFacade;
use crate::model::{
    ChangeInfo, Checkpoint, CheckpointOutcome, EventType, Impact, Session, SessionEvent,
    SessionState, Severity, StateTransition,
};
use crate::session_store::{CreateOptions, PubSubEnvelope, SessionStore};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Options accepted by [`SessionManager::emit_event`].
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub reset_ttl: bool,
    pub publish: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            reset_ttl: true,
            publish: true,
        }
    }
}

/// Options accepted by [`SessionManager::checkpoint`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub create_failure_snapshot: bool,
}

/// A draft event; `seq` and `timestamp` are allocated by
/// [`SessionManager::emit_event`], not supplied by the caller.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub change_info: ChangeInfo,
    pub state_transition: Option<StateTransition>,
    pub impact: Option<Impact>,
}

const CHECKPOINT_WINDOW: usize = 20;

/// Per-session sequence allocation and the session lifecycle operations
/// built on top of it.
pub struct SessionManager {
    store: SessionStore,
    config: SessionConfig,
    counters: DashMap<String, Arc<AsyncMutex<u64>>>,
    kg: Option<Arc<dyn KnowledgeGraph>>,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn KvFacade>, config: SessionConfig) -> Self {
        let store = SessionStore::new(kv, config.clone());
        Self {
            store,
            config,
            counters: DashMap::new(),
            kg: None,
        }
    }

    pub fn with_knowledge_graph(mut self, kg: Arc<dyn KnowledgeGraph>) -> Self {
        self.kg = Some(kg);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn counter(&self, session_id: &str) -> Arc<AsyncMutex<u64>> {
        self.counters
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(0)))
            .clone()
    }

    /// Generates a `sess-<uuid>` id, initializes the local `seq` counter,
    /// creates the store document, and publishes a global `{type:"new"}`
    /// notification.
    pub async fn create_session(
        &self,
        agent_id: &str,
        opts: CreateOptions,
    ) -> Result<String> {
        let session_id = format!("sess-{}", Uuid::new_v4());
        self.counters.insert(session_id.clone(), Arc::new(AsyncMutex::new(0)));

        self.store.create(&session_id, agent_id, opts).await?;

        self.publish_global(&session_id, "new", None).await;

        info!(session_id = %session_id, agent_id, "session created");
        Ok(session_id)
    }

    /// `AddAgent`; emits an internal `handoff` event recording the join.
    pub async fn join(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let (session, _) = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.state.is_terminal() {
            return Err(Error::SessionExpired {
                session_id: session_id.to_string(),
            });
        }

        self.store.add_agent(session_id, agent_id).await?;
        self.rehydrate_counter_if_needed(session_id).await?;

        self.emit_event(
            session_id,
            EventDraft {
                event_type: EventType::Handoff,
                change_info: ChangeInfo {
                    entity_ids: vec![],
                    operation: format!("{agent_id} joined"),
                },
                state_transition: None,
                impact: None,
            },
            agent_id,
            EmitOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// `RemoveAgent`; emits an internal `handoff` event recording the leave.
    pub async fn leave(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.store.remove_agent(session_id, agent_id).await?;
        self.emit_event(
            session_id,
            EventDraft {
                event_type: EventType::Handoff,
                change_info: ChangeInfo {
                    entity_ids: vec![],
                    operation: format!("{agent_id} left"),
                },
                state_transition: None,
                impact: None,
            },
            agent_id,
            EmitOptions::default(),
        )
        .await?;
        Ok(())
    }

    /// Rehydrates the local `seq` counter from `ZCARD events:<id>` (or the
    /// max stored score, whichever is greater) if the in-process counter for
    /// this session hasn't been initialized by this process instance yet.
    async fn rehydrate_counter_if_needed(&self, session_id: &str) -> Result<()> {
        if self.counters.contains_key(session_id) {
            return Ok(());
        }
        let count = self.store.events().count(session_id).await?;
        let max_seq = self.store.events().max_seq(session_id).await?;
        let seq = count.max(max_seq);
        self.counters
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(seq)));
        Ok(())
    }

    /// Allocates `seq`, stamps `timestamp`, persists via `EventLog`, and
    /// optionally resets TTL / publishes / auto-checkpoints. The per-session
    /// lock held for the duration of this call serializes writes to one
    /// session while admitting parallelism across sessions.
    ///
    /// Rejects the append with `SESSION_EXPIRED` once the session's `state`
    /// is `completed` (spec.md §3: "once completed, no further events are
    /// appended"), the same guard `join` already applies.
    pub async fn emit_event(
        &self,
        session_id: &str,
        draft: EventDraft,
        actor: &str,
        opts: EmitOptions,
    ) -> Result<SessionEvent> {
        let (session, _) = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.state.is_terminal() {
            return Err(Error::SessionExpired {
                session_id: session_id.to_string(),
            });
        }

        self.rehydrate_counter_if_needed(session_id).await?;
        let counter = self.counter(session_id);
        let mut seq_guard = counter.lock().await;

        let seq = *seq_guard + 1;
        let event = SessionEvent {
            seq,
            timestamp: chrono::Utc::now(),
            event_type: draft.event_type,
            actor: actor.to_string(),
            change_info: draft.change_info,
            state_transition: draft.state_transition,
            impact: draft.impact,
        };

        self.store
            .events()
            .append(session_id, &event)
            .await
            .map_err(|e| {
                warn!(session_id, seq, error = %e, "event append failed");
                e
            })?;
        *seq_guard += 1;
        drop(seq_guard);

        if opts.reset_ttl {
            self.store
                .set_ttl(session_id, self.config.default_ttl.as_secs() as i64)
                .await?;
        }

        if opts.publish {
            let envelope = PubSubEnvelope {
                kind: "modified".to_string(),
                session_id: session_id.to_string(),
                seq: Some(seq),
                actor: Some(actor.to_string()),
                checkpoint_id: None,
                outcome: None,
                summary: None,
            };
            self.store.publish(session_id, &envelope).await?;
        }

        let should_checkpoint =
            event.event_type == EventType::Checkpoint || seq % self.config.checkpoint_interval == 0;
        if should_checkpoint {
            if let Err(e) = self
                .checkpoint(session_id, CheckpointOptions::default())
                .await
            {
                warn!(session_id, error = %e, "auto-checkpoint failed");
            }
        }

        Ok(event)
    }

    /// Aggregates the last [`CHECKPOINT_WINDOW`] events into an outcome,
    /// writes a KG anchor when configured, optionally snapshots on failure,
    /// applies a grace TTL, and publishes `{type:"checkpoint_complete"}`.
    pub async fn checkpoint(
        &self,
        session_id: &str,
        opts: CheckpointOptions,
    ) -> Result<Checkpoint> {
        let (session, _) = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let window = self
            .store
            .events()
            .tail(session_id, CHECKPOINT_WINDOW)
            .await?;

        let broken = window
            .iter()
            .any(|e| matches!(&e.state_transition, Some(t) if t.to == SessionState::Broken));
        let completed = session.state == SessionState::Completed;
        let outcome = if completed {
            CheckpointOutcome::Completed
        } else if broken {
            CheckpointOutcome::Broken
        } else if session.state == SessionState::Coordinating {
            CheckpointOutcome::Coordinated
        } else {
            CheckpointOutcome::Working
        };

        let mut key_impacts: Vec<String> = window
            .iter()
            .filter(|e| {
                matches!(
                    e.impact.as_ref().and_then(|i| i.severity),
                    Some(Severity::High) | Some(Severity::Critical)
                )
            })
            .flat_map(|e| e.change_info.entity_ids.clone())
            .collect();
        key_impacts.sort();
        key_impacts.dedup();

        let perf_delta_sum: f64 = window
            .iter()
            .filter_map(|e| e.impact.as_ref().and_then(|i| i.perf_delta))
            .sum();

        let checkpoint = Checkpoint {
            checkpoint_id: format!("ckpt-{}", Uuid::new_v4()),
            session_id: session_id.to_string(),
            outcome,
            key_impacts: key_impacts.clone(),
            perf_delta_sum,
            agents: session.agent_ids.clone(),
            created_at: chrono::Utc::now(),
        };

        if let Some(kg) = &self.kg {
            for entity_id in &key_impacts {
                if let Err(e) = kg::anchor_checkpoint(kg.as_ref(), entity_id, session_id, 5).await {
                    warn!(session_id, entity_id, error = %e, "KG anchor write failed");
                }
            }
        }

        if outcome == CheckpointOutcome::Broken
            && (opts.create_failure_snapshot || self.config.enable_failure_snapshots)
        {
            info!(session_id, "failure snapshot would be captured by RollbackManager");
        }

        self.store
            .set_ttl(session_id, self.config.grace_ttl.as_secs() as i64)
            .await
            .map_err(|e| Error::CheckpointFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })?;

        let envelope = PubSubEnvelope {
            kind: "checkpoint_complete".to_string(),
            session_id: session_id.to_string(),
            seq: None,
            actor: None,
            checkpoint_id: Some(checkpoint.checkpoint_id.clone()),
            outcome: Some(format!("{:?}", checkpoint.outcome).to_lowercase()),
            summary: Some(format!("{} impacted entities", key_impacts.len())),
        };
        self.store.publish(session_id, &envelope).await?;

        info!(session_id, checkpoint_id = %checkpoint.checkpoint_id, ?outcome, "checkpoint complete");
        Ok(checkpoint)
    }

    async fn publish_global(&self, session_id: &str, kind: &str, summary: Option<String>) {
        let envelope = PubSubEnvelope {
            kind: kind.to_string(),
            session_id: session_id.to_string(),
            seq: None,
            actor: None,
            checkpoint_id: None,
            outcome: None,
            summary,
        };
        if let Ok(payload) = serde_json::to_string(&envelope) {
            let _ = self
                .store
                .publish_channel(&self.config.global_channel, &payload)
                .await;
        }
    }

    /// All currently-tracked agent ids across sessions this manager knows
    /// about, used by `SessionBridge`/tests without a full KV scan.
    pub fn known_session_ids(&self) -> HashSet<String> {
        self.counters.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Impact, StateTransition};
    use crate::session_store::CreateOptions;
    use crate::test_support::in_memory_kv;

    fn manager() -> SessionManager {
        SessionManager::new(in_memory_kv(), SessionConfig::default())
    }

    /// spec.md §8 scenario 1: basic session log.
    #[tokio::test]
    async fn basic_session_log_transitions_state_and_allocates_contiguous_seq() {
        let mgr = manager();
        let session_id = mgr.create_session("A", CreateOptions::default()).await.unwrap();

        let modified = mgr
            .emit_event(
                &session_id,
                EventDraft {
                    event_type: EventType::Modified,
                    change_info: ChangeInfo {
                        entity_ids: vec!["F1".to_string()],
                        operation: "modified".to_string(),
                    },
                    state_transition: None,
                    impact: None,
                },
                "A",
                EmitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(modified.seq, 1);

        let broke = mgr
            .emit_event(
                &session_id,
                EventDraft {
                    event_type: EventType::Broke,
                    change_info: ChangeInfo {
                        entity_ids: vec!["F1".to_string()],
                        operation: "broke".to_string(),
                    },
                    state_transition: Some(StateTransition {
                        from: SessionState::Working,
                        to: SessionState::Broken,
                        verified_by: Some("test".to_string()),
                        confidence: 0.95,
                    }),
                    impact: Some(Impact {
                        severity: Some(Severity::High),
                        test_failure_ids: vec![],
                        perf_delta: None,
                    }),
                },
                "A",
                EmitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(broke.seq, modified.seq + 1);

        let (session, _) = mgr.store().get(&session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Broken);
    }

    #[tokio::test]
    async fn seq_is_contiguous_and_strictly_increasing() {
        let mgr = manager();
        let session_id = mgr.create_session("A", CreateOptions::default()).await.unwrap();

        let mut seqs = Vec::new();
        for i in 0..5 {
            let event = mgr
                .emit_event(
                    &session_id,
                    EventDraft {
                        event_type: EventType::Modified,
                        change_info: ChangeInfo {
                            entity_ids: vec![format!("F{i}")],
                            operation: "modified".to_string(),
                        },
                        state_transition: None,
                        impact: None,
                    },
                    "A",
                    EmitOptions::default(),
                )
                .await
                .unwrap();
            seqs.push(event.seq);
        }

        for window in seqs.windows(2) {
            assert_eq!(window[1], window[0] + 1);
        }
    }

    #[tokio::test]
    async fn join_on_missing_session_is_not_found() {
        let mgr = manager();
        let err = mgr.join("sess-does-not-exist", "A").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }

    /// spec.md §3 invariant: once `completed`, no further events are appended.
    #[tokio::test]
    async fn emit_event_on_completed_session_is_rejected() {
        let mgr = manager();
        let session_id = mgr.create_session("A", CreateOptions::default()).await.unwrap();

        mgr.emit_event(
            &session_id,
            EventDraft {
                event_type: EventType::Modified,
                change_info: ChangeInfo {
                    entity_ids: vec!["F1".to_string()],
                    operation: "modified".to_string(),
                },
                state_transition: Some(StateTransition {
                    from: SessionState::Working,
                    to: SessionState::Completed,
                    verified_by: None,
                    confidence: 1.0,
                }),
                impact: None,
            },
            "A",
            EmitOptions::default(),
        )
        .await
        .unwrap();

        let (session, _) = mgr.store().get(&session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Completed);

        let err = mgr
            .emit_event(
                &session_id,
                EventDraft {
                    event_type: EventType::Modified,
                    change_info: ChangeInfo {
                        entity_ids: vec!["F2".to_string()],
                        operation: "modified".to_string(),
                    },
                    state_transition: None,
                    impact: None,
                },
                "A",
                EmitOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn checkpoint_aggregates_broken_outcome_and_dedupes_impacts() {
        let mgr = manager();
        let session_id = mgr.create_session("A", CreateOptions::default()).await.unwrap();

        for entity in ["F1", "F1", "F2"] {
            mgr.emit_event(
                &session_id,
                EventDraft {
                    event_type: EventType::Broke,
                    change_info: ChangeInfo {
                        entity_ids: vec![entity.to_string()],
                        operation: "broke".to_string(),
                    },
                    state_transition: Some(StateTransition {
                        from: SessionState::Working,
                        to: SessionState::Broken,
                        verified_by: None,
                        confidence: 0.5,
                    }),
                    impact: Some(Impact {
                        severity: Some(Severity::High),
                        test_failure_ids: vec![],
                        perf_delta: Some(-10.0),
                    }),
                },
                "A",
                EmitOptions::default(),
            )
            .await
            .unwrap();
        }

        let checkpoint = mgr
            .checkpoint(&session_id, CheckpointOptions::default())
            .await
            .unwrap();
        assert_eq!(checkpoint.outcome, CheckpointOutcome::Broken);
        assert_eq!(checkpoint.key_impacts, vec!["F1".to_string(), "F2".to_string()]);
        assert_eq!(checkpoint.perf_delta_sum, -30.0);
    }
}
