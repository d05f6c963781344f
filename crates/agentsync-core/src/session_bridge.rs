//! Read-side analytics over sessions plus an optional knowledge graph
//! (spec.md §4.6). Takes an [`SessionReader`] capability rather than a
//! `SessionManager` reference, breaking the cyclic dependency the source
//! had between the two (spec.md §9 Design Notes).

use crate::error::Result;
use crate::kg::KnowledgeGraph;
use crate::model::{Session, SessionEvent, Severity};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A read-only capability `SessionBridge` depends on instead of a concrete
/// `SessionManager`/`SessionStore` type.
#[async_trait]
pub trait SessionReader: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<Option<(Session, Vec<SessionEvent>)>>;
    async fn range_events(
        &self,
        session_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>>;
    async fn list_active(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl SessionReader for crate::session_store::SessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<(Session, Vec<SessionEvent>)>> {
        self.get(session_id).await
    }

    async fn range_events(
        &self,
        session_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>> {
        self.events().range(session_id, from_seq, to_seq).await
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        SessionStore::list_active(self).await
    }
}

/// A notable state change detected between two consecutive events.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub from_seq: u64,
    pub to_seq: u64,
    pub reason: TransitionReason,
    pub kg_context: Option<Vec<crate::kg::KgRow>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    WorkingToBroken,
    TestPassToBroke,
    HighSeverityImpact,
    PerfRegression,
}

/// Per-agent slice of a session, produced by [`SessionBridge::isolate_session`].
#[derive(Debug, Clone)]
pub struct IsolationResult {
    pub agent_events: Vec<SessionEvent>,
    pub touched_entities: HashSet<String>,
    pub perf_delta_sum: f64,
}

/// Context handed to an agent joining an in-progress session.
#[derive(Debug, Clone)]
pub struct HandoffContext {
    pub recent_events: Vec<SessionEvent>,
    pub kg_context: Option<Vec<crate::kg::KgRow>>,
    pub advisory: String,
}

/// Filters accepted by [`SessionBridge::query_sessions_by_entity`].
#[derive(Debug, Clone, Default)]
pub struct SessionQueryOptions {
    pub agent_id: Option<String>,
    pub state: Option<crate::model::SessionState>,
}

/// Options accepted by [`SessionBridge::aggregates`].
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub state: Option<crate::model::SessionState>,
}

/// Cross-entity rollup produced by [`SessionBridge::aggregates`].
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    pub session_count: usize,
    pub active_agents: HashSet<String>,
    pub outcomes: HashMap<String, usize>,
    pub perf_total: f64,
    pub perf_avg: f64,
    pub perf_worst: f64,
    pub per_entity: HashMap<String, usize>,
}

pub struct SessionBridge {
    reader: Arc<dyn SessionReader>,
    kg: Option<Arc<dyn KnowledgeGraph>>,
}

impl SessionBridge {
    pub fn new(reader: Arc<dyn SessionReader>, kg: Option<Arc<dyn KnowledgeGraph>>) -> Self {
        Self { reader, kg }
    }

    /// Scans consecutive event pairs, emitting a transition whenever one of
    /// the documented triggers fires (spec.md §4.6).
    pub async fn transitions(
        &self,
        session_id: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<TransitionResult>> {
        let events = self.reader.range_events(session_id, None, None).await?;
        let mut out = Vec::new();

        for pair in events.windows(2) {
            let (prev, curr) = (&pair[0], &pair[1]);

            if let Some(entity) = entity_id {
                if !curr.change_info.entity_ids.iter().any(|e| e == entity) {
                    continue;
                }
            }

            let reason = if matches!(
                (&prev.state_transition, &curr.state_transition),
                (Some(p), Some(c)) if p.to == crate::model::SessionState::Working
                    && c.to == crate::model::SessionState::Broken
            ) {
                Some(TransitionReason::WorkingToBroken)
            } else if prev.event_type == crate::model::EventType::TestPass
                && curr.event_type == crate::model::EventType::Broke
            {
                Some(TransitionReason::TestPassToBroke)
            } else if matches!(
                curr.impact.as_ref().and_then(|i| i.severity),
                Some(Severity::High) | Some(Severity::Critical)
            ) {
                Some(TransitionReason::HighSeverityImpact)
            } else if curr.impact.as_ref().and_then(|i| i.perf_delta).is_some_and(|d| d < -5.0) {
                Some(TransitionReason::PerfRegression)
            } else {
                None
            };

            if let Some(reason) = reason {
                let kg_context = self.enrich_entities(&curr.change_info.entity_ids).await;
                out.push(TransitionResult {
                    from_seq: prev.seq,
                    to_seq: curr.seq,
                    reason,
                    kg_context,
                });
            }
        }

        Ok(out)
    }

    async fn enrich_entities(&self, entity_ids: &[String]) -> Option<Vec<crate::kg::KgRow>> {
        let kg = self.kg.as_ref()?;
        if entity_ids.is_empty() {
            return None;
        }
        let mut params = HashMap::new();
        params.insert(
            "entityIds".to_string(),
            serde_json::Value::from(entity_ids.to_vec()),
        );
        kg.query(
            "MATCH (e) WHERE e.id IN $entityIds RETURN e",
            params,
        )
        .await
        .ok()
    }

    /// Filters events by `actor == agent_id`; sums perf deltas; collects
    /// touched entity ids.
    pub async fn isolate_session(&self, session_id: &str, agent_id: &str) -> Result<IsolationResult> {
        let events = self.reader.range_events(session_id, None, None).await?;
        let agent_events: Vec<SessionEvent> = events
            .into_iter()
            .filter(|e| e.actor == agent_id)
            .collect();

        let mut touched_entities = HashSet::new();
        let mut perf_delta_sum = 0.0;
        for event in &agent_events {
            touched_entities.extend(event.change_info.entity_ids.iter().cloned());
            if let Some(delta) = event.impact.as_ref().and_then(|i| i.perf_delta) {
                perf_delta_sum += delta;
            }
        }

        Ok(IsolationResult {
            agent_events,
            touched_entities,
            perf_delta_sum,
        })
    }

    /// Last 10 events, KG context for their entities, and a textual advisory
    /// listing active agents and warning flags.
    pub async fn handoff_context(
        &self,
        session_id: &str,
        _joining_agent: &str,
    ) -> Result<HandoffContext> {
        let Some((session, _)) = self.reader.get_session(session_id).await? else {
            return Ok(HandoffContext {
                recent_events: vec![],
                kg_context: None,
                advisory: "session not found".to_string(),
            });
        };

        let all_events = self.reader.range_events(session_id, None, None).await?;
        let recent: Vec<SessionEvent> = all_events.iter().rev().take(10).cloned().collect();
        let recent: Vec<SessionEvent> = recent.into_iter().rev().collect();

        let entity_ids: Vec<String> = recent
            .iter()
            .flat_map(|e| e.change_info.entity_ids.clone())
            .collect();
        let kg_context = self.enrich_entities(&entity_ids).await;

        let recent_breaks = recent
            .iter()
            .filter(|e| e.event_type == crate::model::EventType::Broke)
            .count();
        let high_impact = recent
            .iter()
            .filter(|e| {
                matches!(
                    e.impact.as_ref().and_then(|i| i.severity),
                    Some(Severity::High) | Some(Severity::Critical)
                )
            })
            .count();

        let mut advisory = format!(
            "active agents: {}",
            session.agent_ids.join(", ")
        );
        if recent_breaks > 0 {
            advisory.push_str(&format!("; {recent_breaks} recent break(s)"));
        }
        if high_impact > 0 {
            advisory.push_str(&format!("; {high_impact} high-impact change(s)"));
        }

        Ok(HandoffContext {
            recent_events: recent,
            kg_context,
            advisory,
        })
    }

    /// Union of KG-anchored sessions and active sessions the reader knows
    /// about that reference `entity_id`, deduplicated and filtered.
    pub async fn query_sessions_by_entity(
        &self,
        entity_id: &str,
        opts: SessionQueryOptions,
    ) -> Result<Vec<String>> {
        let mut ids: HashSet<String> = HashSet::new();

        if let Some(kg) = &self.kg {
            let mut params = HashMap::new();
            params.insert(
                "entityId".to_string(),
                serde_json::Value::String(entity_id.to_string()),
            );
            if let Ok(rows) = kg
                .query(
                    "MATCH (e {id: $entityId}) RETURN e.metadata_sessions AS sessions",
                    params,
                )
                .await
            {
                for row in rows {
                    if let Some(serde_json::Value::Array(sessions)) = row.get("sessions") {
                        ids.extend(sessions.iter().filter_map(|v| v.as_str().map(str::to_string)));
                    }
                }
            }
        }

        for session_id in self.reader.list_active().await? {
            let events = self.reader.range_events(&session_id, None, None).await?;
            if events
                .iter()
                .any(|e| e.change_info.entity_ids.iter().any(|id| id == entity_id))
            {
                ids.insert(session_id);
            }
        }

        let mut filtered = Vec::new();
        for id in ids {
            let Some((session, _)) = self.reader.get_session(&id).await? else {
                continue;
            };
            if let Some(agent_id) = &opts.agent_id {
                if !session.agent_ids.iter().any(|a| a == agent_id) {
                    continue;
                }
            }
            if let Some(state) = opts.state {
                if session.state != state {
                    continue;
                }
            }
            filtered.push(id);
        }
        filtered.sort();
        Ok(filtered)
    }

    /// Count of sessions, active agents, outcome breakdown, perf-impact
    /// summary, and per-entity breakdown across `entity_ids`.
    pub async fn aggregates(
        &self,
        entity_ids: &[String],
        opts: AggregateOptions,
    ) -> Result<Aggregates> {
        let mut result = Aggregates::default();
        let mut session_ids: HashSet<String> = HashSet::new();
        let mut perf_values: Vec<f64> = Vec::new();

        for entity_id in entity_ids {
            let sessions = self
                .query_sessions_by_entity(
                    entity_id,
                    SessionQueryOptions {
                        agent_id: None,
                        state: opts.state,
                    },
                )
                .await?;
            result.per_entity.insert(entity_id.clone(), sessions.len());
            session_ids.extend(sessions);
        }

        for session_id in &session_ids {
            let Some((session, events)) = self.reader.get_session(session_id).await? else {
                continue;
            };
            result.active_agents.extend(session.agent_ids.iter().cloned());
            *result
                .outcomes
                .entry(format!("{:?}", session.state).to_lowercase())
                .or_insert(0) += 1;
            for event in &events {
                if let Some(delta) = event.impact.as_ref().and_then(|i| i.perf_delta) {
                    perf_values.push(delta);
                }
            }
        }

        result.session_count = session_ids.len();
        result.perf_total = perf_values.iter().sum();
        result.perf_avg = if perf_values.is_empty() {
            0.0
        } else {
            result.perf_total / perf_values.len() as f64
        };
        result.perf_worst = perf_values.iter().cloned().fold(0.0_f64, f64::min);

        Ok(result)
    }
}
