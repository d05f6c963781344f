//! Session replay capture (spec.md §6 key layout: `replay:meta:<id>`,
//! `replay:frames:<id>`, `replay:index`).
//!
//! Not apportioned a share in spec.md §2's component table, but named by
//! spec.md §4.13's optional `sessionReplay` health component. A replay is a
//! recorded walk over one session's event log, frame-by-frame, that can be
//! validated and later replayed for debugging or demoing a session without
//! re-running the agents that produced it.

use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::model::SessionEvent;
use crate::kv::KvFacade;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

fn meta_key(replay_id: &str) -> String {
    format!("replay:meta:{replay_id}")
}

fn frames_key(replay_id: &str) -> String {
    format!("replay:frames:{replay_id}")
}

const REPLAY_INDEX_KEY: &str = "replay:index";

/// `status` of a replay recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Recording,
    Complete,
    Failed,
}

/// `replay:meta:<replayId>` hash contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMeta {
    pub replay_id: String,
    pub original_session_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
    pub total_frames: u64,
    pub validation_passed: Option<bool>,
    /// `frames serialized / events serialized`, a rough measure of how much
    /// frame recording added on top of the raw event payloads.
    pub compression_ratio: Option<f64>,
    pub status: ReplayStatus,
}

/// One recorded frame: a session event plus the offset into the replay at
/// which it was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub seq: u64,
    pub event: SessionEvent,
}

/// Records and replays a session's event log via the `replay:*` key family.
pub struct SessionReplay {
    kv: Arc<dyn KvFacade>,
    events: EventLog,
}

impl SessionReplay {
    pub fn new(kv: Arc<dyn KvFacade>) -> Self {
        let events = EventLog::new(kv.clone());
        Self { kv, events }
    }

    /// Snapshots every event currently in `original_session_id`'s log as
    /// frames under a freshly generated `replay_id`, then marks the replay
    /// `complete`. Returns the populated [`ReplayMeta`].
    pub async fn record(&self, original_session_id: &str) -> Result<ReplayMeta> {
        let replay_id = format!("replay-{}", uuid::Uuid::new_v4());
        let start_time = chrono::Utc::now();

        let events = self.events.range(original_session_id, None, None).await?;

        let mut raw_bytes = 0usize;
        let mut frame_bytes = 0usize;
        for event in &events {
            let frame = ReplayFrame { seq: event.seq, event: event.clone() };
            let frame_json = serde_json::to_string(&frame).map_err(|e| Error::CheckpointFailed {
                session_id: original_session_id.to_string(),
                reason: format!("failed to encode replay frame: {e}"),
            })?;
            raw_bytes += serde_json::to_string(event).map(|s| s.len()).unwrap_or(0);
            frame_bytes += frame_json.len();

            self.kv
                .zadd(&frames_key(&replay_id), &frame_json, event.seq as f64)
                .await
                .map_err(Error::Kv)?;
        }

        let end_time = chrono::Utc::now();
        let compression_ratio = if raw_bytes > 0 {
            Some(frame_bytes as f64 / raw_bytes as f64)
        } else {
            None
        };

        let meta = ReplayMeta {
            replay_id: replay_id.clone(),
            original_session_id: original_session_id.to_string(),
            start_time,
            end_time: Some(end_time),
            duration_ms: Some((end_time - start_time).num_milliseconds()),
            total_frames: events.len() as u64,
            validation_passed: None,
            compression_ratio,
            status: ReplayStatus::Complete,
        };

        self.persist_meta(&meta).await?;
        self.kv
            .zadd(REPLAY_INDEX_KEY, &replay_id, start_time.timestamp() as f64)
            .await
            .map_err(Error::Kv)?;

        info!(replay_id, original_session_id, frames = meta.total_frames, "recorded session replay");
        Ok(meta)
    }

    /// Returns a replay's metadata plus its frames in `seq` order, or `None`
    /// if no such replay exists.
    pub async fn get(&self, replay_id: &str) -> Result<Option<(ReplayMeta, Vec<ReplayFrame>)>> {
        let fields = self.kv.hgetall(&meta_key(replay_id)).await.map_err(Error::Kv)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let meta = Self::parse_meta(replay_id, &fields)?;

        let members = self
            .kv
            .zrangebyscore(&frames_key(replay_id), f64::NEG_INFINITY, f64::INFINITY)
            .await
            .map_err(Error::Kv)?;
        let mut frames: Vec<ReplayFrame> = members
            .into_iter()
            .filter_map(|m| serde_json::from_str(&m.member).ok())
            .collect();
        frames.sort_by_key(|f| f.seq);

        Ok(Some((meta, frames)))
    }

    /// Replays frames one at a time through `sink`, in `seq` order, stopping
    /// and returning `false` the first time `sink` rejects a frame.
    /// Validates the recording is internally consistent (frames form a
    /// contiguous ascending `seq` run matching `total_frames`) before
    /// persisting `validation_passed`.
    pub async fn replay<F>(&self, replay_id: &str, mut sink: F) -> Result<bool>
    where
        F: FnMut(&ReplayFrame) -> bool,
    {
        let (mut meta, frames) = self
            .get(replay_id)
            .await?
            .ok_or_else(|| Error::ReplayNotFound { id: replay_id.to_string() })?;

        let contiguous = frames
            .iter()
            .enumerate()
            .all(|(i, f)| f.seq == frames.first().map(|first| first.seq + i as u64).unwrap_or(f.seq));
        let count_matches = frames.len() as u64 == meta.total_frames;
        let mut passed = contiguous && count_matches;

        for frame in &frames {
            if !sink(frame) {
                passed = false;
                debug!(replay_id, seq = frame.seq, "replay sink rejected frame");
                break;
            }
        }

        meta.validation_passed = Some(passed);
        meta.status = if passed { ReplayStatus::Complete } else { ReplayStatus::Failed };
        self.persist_meta(&meta).await?;

        Ok(passed)
    }

    /// All replay ids, most recently started first.
    pub async fn list(&self) -> Result<Vec<String>> {
        let members = self
            .kv
            .zrangebyscore(REPLAY_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await
            .map_err(Error::Kv)?;
        let mut scored = members;
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().map(|m| m.member).collect())
    }

    async fn persist_meta(&self, meta: &ReplayMeta) -> Result<()> {
        let key = meta_key(&meta.replay_id);
        let start_time = meta.start_time.to_rfc3339();
        let end_time = meta.end_time.map(|t| t.to_rfc3339()).unwrap_or_default();
        let duration = meta.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let total_frames = meta.total_frames.to_string();
        let validation_passed = meta.validation_passed.map(|v| v.to_string()).unwrap_or_default();
        let compression_ratio = meta.compression_ratio.map(|r| r.to_string()).unwrap_or_default();

        self.kv
            .hset_multiple(
                &key,
                &[
                    ("originalSessionId", meta.original_session_id.as_str()),
                    ("startTime", start_time.as_str()),
                    ("endTime", end_time.as_str()),
                    ("duration", duration.as_str()),
                    ("totalFrames", total_frames.as_str()),
                    ("validationPassed", validation_passed.as_str()),
                    ("compressionRatio", compression_ratio.as_str()),
                    ("status", replay_status_str(meta.status)),
                ],
            )
            .await
            .map_err(Error::Kv)
    }

    fn parse_meta(replay_id: &str, fields: &crate::kv::Fields) -> Result<ReplayMeta> {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let original_session_id = get("originalSessionId");
        let start_time = chrono::DateTime::parse_from_rfc3339(&get("startTime"))
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        let end_time = chrono::DateTime::parse_from_rfc3339(&get("endTime"))
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc));
        let duration_ms = get("duration").parse().ok();
        let total_frames = get("totalFrames").parse().unwrap_or(0);
        let validation_passed = get("validationPassed").parse().ok();
        let compression_ratio = get("compressionRatio").parse().ok();
        let status = match get("status").as_str() {
            "failed" => ReplayStatus::Failed,
            "recording" => ReplayStatus::Recording,
            _ => ReplayStatus::Complete,
        };

        Ok(ReplayMeta {
            replay_id: replay_id.to_string(),
            original_session_id,
            start_time,
            end_time,
            duration_ms,
            total_frames,
            validation_passed,
            compression_ratio,
            status,
        })
    }
}

fn replay_status_str(status: ReplayStatus) -> &'static str {
    match status {
        ReplayStatus::Recording => "recording",
        ReplayStatus::Complete => "complete",
        ReplayStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLog as EventLogHandle;
    use crate::model::{ChangeInfo, EventType};
    use crate::test_support::in_memory_kv;

    fn event(seq: u64) -> SessionEvent {
        SessionEvent {
            seq,
            timestamp: chrono::Utc::now(),
            event_type: EventType::Modified,
            actor: "A".into(),
            change_info: ChangeInfo { entity_ids: vec!["F1".into()], operation: "modified".into() },
            state_transition: None,
            impact: None,
        }
    }

    #[tokio::test]
    async fn record_and_get_round_trips_frames_in_seq_order() {
        let kv = in_memory_kv();
        let log = EventLogHandle::new(kv.clone());
        log.init("s1").await.unwrap();
        for seq in 1..=3 {
            log.append("s1", &event(seq)).await.unwrap();
        }

        let replay = SessionReplay::new(kv);
        let meta = replay.record("s1").await.unwrap();
        assert_eq!(meta.total_frames, 3);
        assert_eq!(meta.status, ReplayStatus::Complete);

        let (meta, frames) = replay.get(&meta.replay_id).await.unwrap().unwrap();
        assert_eq!(meta.original_session_id, "s1");
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn replay_validates_contiguous_frames() {
        let kv = in_memory_kv();
        let log = EventLogHandle::new(kv.clone());
        log.init("s1").await.unwrap();
        for seq in 1..=3 {
            log.append("s1", &event(seq)).await.unwrap();
        }

        let replay = SessionReplay::new(kv);
        let meta = replay.record("s1").await.unwrap();

        let mut seen = Vec::new();
        let passed = replay
            .replay(&meta.replay_id, |frame| {
                seen.push(frame.seq);
                true
            })
            .await
            .unwrap();
        assert!(passed);
        assert_eq!(seen, vec![1, 2, 3]);

        let (reloaded, _) = replay.get(&meta.replay_id).await.unwrap().unwrap();
        assert_eq!(reloaded.validation_passed, Some(true));
    }

    #[tokio::test]
    async fn replay_sink_rejection_marks_failed() {
        let kv = in_memory_kv();
        let log = EventLogHandle::new(kv.clone());
        log.init("s1").await.unwrap();
        log.append("s1", &event(1)).await.unwrap();

        let replay = SessionReplay::new(kv);
        let meta = replay.record("s1").await.unwrap();

        let passed = replay.replay(&meta.replay_id, |_| false).await.unwrap();
        assert!(!passed);

        let (reloaded, _) = replay.get(&meta.replay_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ReplayStatus::Failed);
    }

    #[tokio::test]
    async fn list_orders_most_recent_first() {
        let kv = in_memory_kv();
        let log = EventLogHandle::new(kv.clone());
        log.init("s1").await.unwrap();
        log.append("s1", &event(1)).await.unwrap();

        let replay = SessionReplay::new(kv);
        let first = replay.record("s1").await.unwrap();
        let second = replay.record("s1").await.unwrap();

        let ids = replay.list().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.replay_id));
        assert!(ids.contains(&second.replay_id));
    }

    #[tokio::test]
    async fn get_missing_replay_returns_none() {
        let kv = in_memory_kv();
        let replay = SessionReplay::new(kv);
        assert!(replay.get("replay-missing").await.unwrap().is_none());
    }
}
