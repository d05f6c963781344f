//! An in-process [`KvFacade`] test double, grounded on the teacher's use of
//! in-memory mock backends in `dashflow-memory`'s test suites. Lets
//! `SessionStore`/`SessionManager`/`AgentCoordinator` unit tests run without
//! a live Redis server; integration tests against the real thing live in
//! `agentsync-redis`.

use crate::error::KvError;
use crate::kv::{Fields, KvFacade, PubSubMessage, ScoredMember};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    ttls: HashMap<String, i64>,
}

/// An in-memory stand-in for a Redis-compatible store.
pub struct InMemoryKv {
    state: Mutex<State>,
    sender: broadcast::Sender<PubSubMessage>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            sender,
        }
    }
}

#[async_trait]
impl KvFacade for InMemoryKv {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), (*value).to_string());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<Fields, KvError> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        if let Some(hash) = self.state.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        self.state
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let state = self.state.lock();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut sorted: Vec<(&String, &f64)> = zset.iter().collect();
        sorted.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
        let len = sorted.len() as i64;
        let (s, e) = normalize_range(start, stop, len);
        Ok(sorted[s..e].iter().map(|(m, _)| (*m).clone()).collect())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>, KvError> {
        let state = self.state.lock();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<ScoredMember> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect();
        out.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        Ok(self.state.lock().zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(zset) = self.state.lock().zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zmax_score(&self, key: &str) -> Result<Option<f64>, KvError> {
        Ok(self
            .state
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.values().cloned().fold(None, |acc, v| match acc {
                None => Some(v),
                Some(a) if v > a => Some(v),
                Some(a) => Some(a),
            })))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        self.state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(set) = self.state.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError> {
        self.state.lock().ttls.insert(key.to_string(), ttl_secs);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        let state = self.state.lock();
        if !key_exists(&state, key) {
            return Ok(-2);
        }
        Ok(*state.ttls.get(key).unwrap_or(&-1))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(key_exists(&self.state.lock(), key))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.hashes.remove(key);
        state.zsets.remove(key);
        state.sets.remove(key);
        state.ttls.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let prefix = pattern.trim_end_matches('*');
        let state = self.state.lock();
        let mut out: HashSet<String> = HashSet::new();
        for key in state.hashes.keys().chain(state.zsets.keys()).chain(state.sets.keys()) {
            if key.starts_with(prefix) {
                out.insert(key.clone());
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let _ = self.sender.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = PubSubMessage> + Send>>, KvError> {
        let channel = channel.to_string();
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(move |msg| {
                let channel = channel.clone();
                async move {
                    match msg {
                        Ok(m) if m.channel == channel => Some(m),
                        _ => None,
                    }
                }
            });
        Ok(Box::pin(stream))
    }
}

fn key_exists(state: &State, key: &str) -> bool {
    state.hashes.contains_key(key) || state.zsets.contains_key(key) || state.sets.contains_key(key)
}

fn normalize_range(start: i64, stop: i64, len: i64) -> (usize, usize) {
    if len == 0 {
        return (0, 0);
    }
    let norm = |i: i64| -> i64 {
        if i < 0 {
            (len + i).max(0)
        } else {
            i.min(len)
        }
    };
    let s = norm(start) as usize;
    let e = (norm(stop) + 1).clamp(0, len) as usize;
    if s >= e {
        (0, 0)
    } else {
        (s, e)
    }
}

/// Convenience constructor for tests that just need a ready-made facade.
pub fn in_memory_kv() -> Arc<dyn KvFacade> {
    Arc::new(InMemoryKv::new())
}
