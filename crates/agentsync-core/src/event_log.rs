//! Per-session ordered event stream (spec.md §4.3).
//!
//! Each session owns two keys: a hash `session:<id>` holding the document
//! fields, and a sorted set `events:<id>` scored by `seq` holding
//! JSON-encoded events. The zero-score member `"INIT"` is a sentinel
//! ensuring the zset exists as soon as the session does, even before the
//! first real event is appended.

use crate::error::{Error, KvError, Result};
use crate::kv::KvFacade;
use crate::model::SessionEvent;
use std::sync::Arc;

/// The sentinel member guaranteeing `events:<id>` exists at session creation.
pub const INIT_SENTINEL: &str = "INIT";

pub fn events_key(session_id: &str) -> String {
    format!("events:{session_id}")
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Ordered event log over a [`KvFacade`].
pub struct EventLog {
    kv: Arc<dyn KvFacade>,
}

impl EventLog {
    pub fn new(kv: Arc<dyn KvFacade>) -> Self {
        Self { kv }
    }

    /// Insert the `INIT` sentinel so the zset exists before any real event
    /// is appended. Idempotent: re-adding the sentinel at score 0 is a no-op
    /// if it's already present.
    pub async fn init(&self, session_id: &str) -> Result<()> {
        self.kv
            .zadd(&events_key(session_id), INIT_SENTINEL, 0.0)
            .await
            .map_err(Error::Kv)
    }

    /// Append `event`, and if it carries a `state_transition.to`, flip the
    /// session document's `state` field atomically with the append (the
    /// underlying facade call order guarantees the state write happens
    /// immediately after the event becomes visible; callers on a pipelined
    /// facade get this as a single round trip).
    pub async fn append(&self, session_id: &str, event: &SessionEvent) -> Result<()> {
        let payload = serde_json::to_string(event).map_err(|e| Error::EventAddFailed {
            session_id: session_id.to_string(),
            reason: format!("failed to encode event: {e}"),
        })?;

        self.kv
            .zadd(&events_key(session_id), &payload, event.seq as f64)
            .await
            .map_err(|e| Error::EventAddFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(transition) = &event.state_transition {
            let state_json =
                serde_json::to_string(&transition.to).map_err(|e| Error::EventAddFailed {
                    session_id: session_id.to_string(),
                    reason: format!("failed to encode state: {e}"),
                })?;
            // serde_json encodes the bare enum as a quoted string; store the
            // inner value so the session hash field reads as a plain token.
            let state_value = state_json.trim_matches('"').to_string();
            self.kv
                .hset(&session_key(session_id), "state", &state_value)
                .await
                .map_err(|e| Error::EventAddFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// `ZRANGEBYSCORE` with `-inf`/`+inf` defaults; filters the sentinel,
    /// deserializes, and sorts by `seq` defensively (ordering is by `seq`,
    /// not by insertion time).
    pub async fn range(
        &self,
        session_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<SessionEvent>> {
        let min = from_seq.map(|s| s as f64).unwrap_or(f64::NEG_INFINITY);
        let max = to_seq.map(|s| s as f64).unwrap_or(f64::INFINITY);

        let members = self
            .kv
            .zrangebyscore(&events_key(session_id), min, max)
            .await
            .map_err(Error::Kv)?;

        let mut events: Vec<SessionEvent> = members
            .into_iter()
            .filter(|m| m.member != INIT_SENTINEL)
            .filter_map(|m| serde_json::from_str(&m.member).ok())
            .collect();

        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    /// `ZRANGE -n -1`: the last `n` events in insertion order.
    pub async fn tail(&self, session_id: &str, n: usize) -> Result<Vec<SessionEvent>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = -(n as i64);
        let members = self
            .kv
            .zrange(&events_key(session_id), start, -1)
            .await
            .map_err(Error::Kv)?;

        let mut events: Vec<SessionEvent> = members
            .into_iter()
            .filter(|m| m != INIT_SENTINEL)
            .filter_map(|m| serde_json::from_str(&m).ok())
            .collect();

        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    /// Number of real events (excludes the `INIT` sentinel), used to
    /// rehydrate the sequence counter after a process restart.
    pub async fn count(&self, session_id: &str) -> Result<u64> {
        let total = self.kv.zcard(&events_key(session_id)).await.map_err(Error::Kv)?;
        Ok(total.saturating_sub(1))
    }

    /// The highest `seq` currently persisted, used as an alternate recovery
    /// path to `count` when events were appended out of a contiguous order
    /// by an external writer.
    pub async fn max_seq(&self, session_id: &str) -> Result<u64> {
        match self
            .kv
            .zmax_score(&events_key(session_id))
            .await
            .map_err(Error::Kv)?
        {
            Some(score) if score > 0.0 => Ok(score as u64),
            _ => Ok(0),
        }
    }

    pub async fn set_ttl(&self, session_id: &str, ttl_secs: i64) -> Result<()> {
        self.kv
            .expire(&events_key(session_id), ttl_secs)
            .await
            .map_err(Error::Kv)?;
        self.kv
            .expire(&session_key(session_id), ttl_secs)
            .await
            .map_err(Error::Kv)
    }
}

/// KV-error helper: map a `NotFound` into [`Error::SessionNotFound`] for
/// callers that already know the session-id context.
pub fn map_not_found(session_id: &str, err: KvError) -> Error {
    match err {
        KvError::NotFound(_) => Error::SessionNotFound {
            session_id: session_id.to_string(),
        },
        other => Error::Kv(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryKv;
    use crate::model::{ChangeInfo, EventType};

    fn make_event(seq: u64) -> SessionEvent {
        SessionEvent {
            seq,
            timestamp: chrono::Utc::now(),
            event_type: EventType::Modified,
            actor: "agent-a".into(),
            change_info: ChangeInfo {
                entity_ids: vec!["F1".into()],
                operation: "modified".into(),
            },
            state_transition: None,
            impact: None,
        }
    }

    #[tokio::test]
    async fn append_and_range_round_trip_in_seq_order() {
        let kv = Arc::new(InMemoryKv::new());
        let log = EventLog::new(kv);
        log.init("s1").await.unwrap();
        log.append("s1", &make_event(1)).await.unwrap();
        log.append("s1", &make_event(2)).await.unwrap();

        let events = log.range("s1", None, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn count_excludes_init_sentinel() {
        let kv = Arc::new(InMemoryKv::new());
        let log = EventLog::new(kv);
        log.init("s1").await.unwrap();
        log.append("s1", &make_event(1)).await.unwrap();
        assert_eq!(log.count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tail_returns_last_n_in_seq_order() {
        let kv = Arc::new(InMemoryKv::new());
        let log = EventLog::new(kv);
        log.init("s1").await.unwrap();
        for seq in 1..=5 {
            log.append("s1", &make_event(seq)).await.unwrap();
        }
        let tail = log.tail("s1", 2).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }
}
