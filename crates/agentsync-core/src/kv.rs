//! [`KvFacade`]: the thin abstraction over a Redis-compatible KV+pub/sub
//! store that the rest of this crate is written against (spec.md §4.1).
//!
//! The facade is pure: no caching, no retries, no connection pooling — those
//! concerns belong to a `ConnPool` wrapper (implemented for Redis in
//! `agentsync-redis`) and to `EnhancedSessionStore`'s batching layer.

use crate::error::KvError;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// A Redis-compatible ordered field set, as returned by `HGETALL`.
pub type Fields = HashMap<String, String>;

/// A single `ZRANGE`/`ZRANGEBYSCORE` member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Which side of a pool the caller wants a connection of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Read,
    Write,
    Any,
}

/// A message delivered to a pub/sub subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// The minimal command surface this crate needs from a Redis-compatible
/// store (spec.md §4.1). Implementations return a typed [`KvError`] so
/// callers can distinguish transient/auth/not-found/protocol failures.
#[async_trait]
pub trait KvFacade: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hgetall(&self, key: &str) -> Result<Fields, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>, KvError>;
    async fn zcard(&self, key: &str) -> Result<u64, KvError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError>;
    /// Highest score currently stored under `key`, if any.
    async fn zmax_score(&self, key: &str) -> Result<Option<f64>, KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError>;
    /// `-1` means "no TTL set", `-2` means "key does not exist" (Redis convention).
    async fn ttl(&self, key: &str) -> Result<i64, KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;

    /// Subscribe to a channel, yielding every message published to it from
    /// this point on. The stream ends when the facade is dropped or the
    /// underlying connection is lost.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>, KvError>;
}

/// The per-session and global channel names used for pub/sub, per spec.md §6.
pub struct Channels;

impl Channels {
    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub fn global(prefix: &str) -> String {
        prefix.to_string()
    }

    pub fn agent_recovery(agent_id: &str) -> String {
        format!("agent:{agent_id}:recovery")
    }
}
