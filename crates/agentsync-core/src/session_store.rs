//! CRUD on session documents; wraps [`EventLog`]; TTL management; pub/sub
//! publish/subscribe (spec.md §4.4).

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event_log::{self, EventLog};
use crate::kv::{Channels, KvFacade, PubSubMessage};
use crate::model::{Session, SessionEvent, SessionState};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options accepted by [`SessionStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub ttl_secs: Option<i64>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub initial_entity_ids: Vec<String>,
}

/// A partial update applied by [`SessionStore::update`].
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub state: Option<SessionState>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Aggregated, possibly-sampled statistics over active sessions (spec.md
/// §4.4, and spec.md §9 Open Question #2 — kept as an explicit estimate).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_events: u64,
    pub distinct_agents: usize,
    pub approx_memory_bytes: usize,
    /// `true` when this reflects a sample rather than an exact count.
    pub sampled: bool,
    pub sample_size: usize,
}

const STATS_SAMPLE_LIMIT: usize = 100;

/// Wraps [`EventLog`] and the `session:<id>` document hash.
pub struct SessionStore {
    kv: Arc<dyn KvFacade>,
    events: EventLog,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvFacade>, config: SessionConfig) -> Self {
        let events = EventLog::new(kv.clone());
        Self { kv, events, config }
    }

    /// `EXISTS` check; write the document hash, set TTL on both keys, insert
    /// the `INIT` sentinel; if `initial_entity_ids` is non-empty, append a
    /// `seq=1, type=start` event.
    pub async fn create(
        &self,
        session_id: &str,
        agent_id: &str,
        opts: CreateOptions,
    ) -> Result<()> {
        let key = event_log::session_key(session_id);
        if self.kv.exists(&key).await.map_err(Error::Kv)? {
            return Err(Error::SessionExists {
                session_id: session_id.to_string(),
            });
        }

        let agent_ids_json = serde_json::to_string(&vec![agent_id.to_string()])
            .unwrap_or_else(|_| "[]".to_string());
        let metadata_json = serde_json::to_string(&opts.metadata).unwrap_or_else(|_| "{}".to_string());

        self.kv
            .hset_multiple(
                &key,
                &[
                    ("agentIds", agent_ids_json.as_str()),
                    ("state", "working"),
                    ("events", "0"),
                    ("metadata", metadata_json.as_str()),
                ],
            )
            .await
            .map_err(Error::Kv)?;

        self.events.init(session_id).await?;

        let ttl = opts.ttl_secs.unwrap_or(self.config.default_ttl.as_secs() as i64);
        self.set_ttl(session_id, ttl).await?;

        if !opts.initial_entity_ids.is_empty() {
            let start_event = SessionEvent {
                seq: 1,
                timestamp: chrono::Utc::now(),
                event_type: crate::model::EventType::Start,
                actor: agent_id.to_string(),
                change_info: crate::model::ChangeInfo {
                    entity_ids: opts.initial_entity_ids.clone(),
                    operation: "start".to_string(),
                },
                state_transition: None,
                impact: None,
            };
            self.events.append(session_id, &start_event).await?;
        }

        info!(session_id, agent_id, "session created");
        Ok(())
    }

    /// Returns the document plus the last `max_events` (default from
    /// [`SessionConfig`]) events, or `None` if absent.
    pub async fn get(&self, session_id: &str) -> Result<Option<(Session, Vec<SessionEvent>)>> {
        let key = event_log::session_key(session_id);
        let fields = self.kv.hgetall(&key).await.map_err(Error::Kv)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let session = self.parse_session(session_id, &fields)?;
        let recent = self.events.tail(session_id, self.config.max_events).await?;
        Ok(Some((session, recent)))
    }

    fn parse_session(&self, session_id: &str, fields: &HashMap<String, String>) -> Result<Session> {
        let agent_ids: Vec<String> = fields
            .get("agentIds")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let state = fields
            .get("state")
            .and_then(|v| serde_json::from_str(&format!("\"{v}\"")).ok())
            .unwrap_or(SessionState::Working);
        let events = fields
            .get("events")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let metadata = fields
            .get("metadata")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();

        Ok(Session {
            session_id: session_id.to_string(),
            agent_ids,
            state,
            events,
            metadata,
        })
    }

    /// Partial `HSET`; fails `SESSION_NOT_FOUND` if the document is missing.
    pub async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        let key = event_log::session_key(session_id);
        if !self.kv.exists(&key).await.map_err(Error::Kv)? {
            return Err(Error::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        if let Some(state) = patch.state {
            let state_json = serde_json::to_string(&state).unwrap_or_default();
            let value = state_json.trim_matches('"').to_string();
            self.kv.hset(&key, "state", &value).await.map_err(Error::Kv)?;
        }
        if let Some(metadata) = patch.metadata {
            let json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());
            self.kv.hset(&key, "metadata", &json).await.map_err(Error::Kv)?;
        }
        Ok(())
    }

    /// Read-modify-write the agent set on a single connection; no-op if the
    /// agent is already present.
    pub async fn add_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.modify_agents(session_id, |ids| {
            if !ids.iter().any(|a| a == agent_id) {
                ids.push(agent_id.to_string());
            }
        })
        .await
    }

    /// Removes `agent_id` from the agent set. When the last agent leaves,
    /// applies the configured grace TTL to both keys rather than deleting
    /// them, so the session can be rejoined.
    pub async fn remove_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let became_empty = {
            let mut empty = false;
            self.modify_agents(session_id, |ids| {
                ids.retain(|a| a != agent_id);
                empty = ids.is_empty();
            })
            .await?;
            empty
        };

        if became_empty {
            debug!(session_id, "last agent left, applying grace TTL");
            self.set_ttl(session_id, self.config.grace_ttl.as_secs() as i64)
                .await?;
        }
        Ok(())
    }

    async fn modify_agents(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Vec<String>),
    ) -> Result<()> {
        let key = event_log::session_key(session_id);
        let current = self
            .kv
            .hget(&key, "agentIds")
            .await
            .map_err(Error::Kv)?
            .ok_or_else(|| Error::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let mut ids: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
        f(&mut ids);
        let json = serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string());
        self.kv.hset(&key, "agentIds", &json).await.map_err(Error::Kv)
    }

    /// `EXPIRE` on both `session:<id>` and `events:<id>`.
    pub async fn set_ttl(&self, session_id: &str, ttl_secs: i64) -> Result<()> {
        self.events.set_ttl(session_id, ttl_secs).await
    }

    pub async fn publish(&self, session_id: &str, msg: &PubSubEnvelope) -> Result<()> {
        let payload = serde_json::to_string(msg).map_err(|e| Error::EventAddFailed {
            session_id: session_id.to_string(),
            reason: format!("failed to encode pub/sub envelope: {e}"),
        })?;
        self.kv
            .publish(&Channels::session(session_id), &payload)
            .await
            .map_err(Error::Kv)
    }

    /// Publishes a raw payload to an arbitrary channel (used for the global
    /// lifecycle channel and agent recovery pings, which aren't scoped to a
    /// single session).
    pub async fn publish_channel(&self, channel: &str, payload: &str) -> Result<()> {
        self.kv.publish(channel, payload).await.map_err(Error::Kv)
    }

    /// Subscribes to the session's channel, yielding parsed envelopes;
    /// malformed payloads are dropped silently with a `warn!` log rather
    /// than terminating the subscription.
    pub async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = PubSubEnvelope> + Send>>> {
        let channel = Channels::session(session_id);
        let raw: Pin<Box<dyn Stream<Item = PubSubMessage> + Send>> =
            self.kv.subscribe(&channel).await.map_err(Error::Kv)?;
        Ok(Box::pin(futures::StreamExt::filter_map(raw, |msg| async move {
            match serde_json::from_str::<PubSubEnvelope>(&msg.payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, "dropping malformed pub/sub envelope");
                    None
                }
            }
        })))
    }

    /// Enumerates `session:*` keys (spec.md §4.4).
    pub async fn list_active(&self) -> Result<Vec<String>> {
        let keys = self.kv.keys("session:*").await.map_err(Error::Kv)?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("session:").map(str::to_string))
            .collect())
    }

    /// Aggregates up to [`STATS_SAMPLE_LIMIT`] sampled sessions.
    pub async fn stats(&self) -> Result<SessionStats> {
        let ids = self.list_active().await?;
        let sampled = ids.len() > STATS_SAMPLE_LIMIT;
        let sample: Vec<&String> = ids.iter().take(STATS_SAMPLE_LIMIT).collect();

        let mut total_events = 0u64;
        let mut agents = std::collections::HashSet::new();
        let mut approx_bytes = 0usize;

        for id in &sample {
            if let Some((session, _)) = self.get(id).await? {
                total_events += session.events;
                agents.extend(session.agent_ids.iter().cloned());
                approx_bytes += serde_json::to_string(&session).map(|s| s.len()).unwrap_or(0);
            }
        }

        Ok(SessionStats {
            active_sessions: ids.len(),
            total_events,
            distinct_agents: agents.len(),
            approx_memory_bytes: approx_bytes,
            sampled,
            sample_size: sample.len(),
        })
    }

    /// Periodic sweep: deletes session hashes with no TTL (`TTL == -1`),
    /// treating them as abandoned.
    pub async fn cleanup_abandoned(&self) -> Result<usize> {
        let ids = self.list_active().await?;
        let mut deleted = 0;
        for id in ids {
            let key = event_log::session_key(&id);
            let ttl = self.kv.ttl(&key).await.map_err(Error::Kv)?;
            if ttl == -1 {
                self.kv.del(&key).await.map_err(Error::Kv)?;
                self.kv
                    .del(&event_log::events_key(&id))
                    .await
                    .map_err(Error::Kv)?;
                deleted += 1;
                warn!(session_id = %id, "deleted abandoned session with no TTL");
            }
        }
        Ok(deleted)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::in_memory_kv;

    fn store() -> SessionStore {
        SessionStore::new(in_memory_kv(), SessionConfig::default())
    }

    #[tokio::test]
    async fn create_twice_fails_session_exists() {
        let store = store();
        store.create("sess-1", "A", CreateOptions::default()).await.unwrap();
        let err = store
            .create("sess-1", "A", CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionExists { .. }));
    }

    #[tokio::test]
    async fn get_missing_session_returns_none() {
        let store = store();
        assert!(store.get("sess-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_missing_session_fails_not_found() {
        let store = store();
        let err = store
            .update("sess-missing", SessionPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn add_and_remove_agent_applies_grace_ttl_when_last_leaves() {
        let mut config = SessionConfig::default();
        config.grace_ttl = std::time::Duration::from_secs(42);
        let store = SessionStore::new(in_memory_kv(), config);
        store.create("sess-1", "A", CreateOptions::default()).await.unwrap();
        store.add_agent("sess-1", "B").await.unwrap();

        let (session, _) = store.get("sess-1").await.unwrap().unwrap();
        assert_eq!(session.agent_ids, vec!["A".to_string(), "B".to_string()]);

        store.remove_agent("sess-1", "A").await.unwrap();
        let (session, _) = store.get("sess-1").await.unwrap().unwrap();
        assert_eq!(session.agent_ids, vec!["B".to_string()]);

        store.remove_agent("sess-1", "B").await.unwrap();
        let (session, _) = store.get("sess-1").await.unwrap().unwrap();
        assert!(session.agent_ids.is_empty());
    }

    #[tokio::test]
    async fn update_patches_state_and_metadata() {
        let store = store();
        store.create("sess-1", "A", CreateOptions::default()).await.unwrap();

        let mut metadata = HashMap::new();
        metadata.insert("key".to_string(), serde_json::json!("value"));
        store
            .update(
                "sess-1",
                SessionPatch {
                    state: Some(SessionState::Coordinating),
                    metadata: Some(metadata.clone()),
                },
            )
            .await
            .unwrap();

        let (session, _) = store.get("sess-1").await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Coordinating);
        assert_eq!(session.metadata, metadata);
    }

    #[tokio::test]
    async fn cleanup_abandoned_deletes_only_ttl_less_sessions() {
        let store = store();
        store.create("sess-1", "A", CreateOptions::default()).await.unwrap();
        store.set_ttl("sess-1", -1).await.unwrap();
        store.create("sess-2", "A", CreateOptions::default()).await.unwrap();

        let deleted = store.cleanup_abandoned().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("sess-1").await.unwrap().is_none());
        assert!(store.get("sess-2").await.unwrap().is_some());
    }
}

/// JSON envelope published on a session's pub/sub channel (spec.md §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PubSubEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub seq: Option<u64>,
    pub actor: Option<String>,
    pub checkpoint_id: Option<String>,
    pub outcome: Option<String>,
    pub summary: Option<String>,
}
