//! [`RedisKv`]: the Redis-backed [`KvFacade`] implementation, built on top
//! of [`RConnPool`] (spec.md §4.1, §6 "KV wire").

use crate::pool::RConnPool;
use agentsync_core::{ConnKind, Fields, KvError, PubSubMessage, ScoredMember};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::pin::Pin;

/// A [`KvFacade`](agentsync_core::KvFacade) backed by a pooled Redis client.
/// Pure command dispatch: no caching, no retries beyond what `redis-rs`
/// itself performs on the wire.
pub struct RedisKv {
    pool: RConnPool,
}

impl RedisKv {
    pub fn new(pool: RConnPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RConnPool {
        &self.pool
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    use redis::ErrorKind;
    match e.kind() {
        ErrorKind::AuthenticationFailed => KvError::Auth(e.to_string()),
        ErrorKind::TypeError | ErrorKind::ParseError => KvError::Protocol(e.to_string()),
        _ if e.is_timeout() || e.is_connection_dropped() || e.is_io_error() => {
            KvError::Transient(e.to_string())
        }
        _ => KvError::Transient(e.to_string()),
    }
}

#[async_trait]
impl agentsync_core::KvFacade for RedisKv {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().hset(key, field, value).await.map_err(map_err)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease
            .conn()
            .hset_multiple(key, fields)
            .await
            .map_err(map_err)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().hget(key, field).await.map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> Result<Fields, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().hgetall(key).await.map_err(map_err)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().hdel(key, field).await.map_err(map_err)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().zadd(key, member, score).await.map_err(map_err)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease
            .conn()
            .zrange(key, start as isize, stop as isize)
            .await
            .map_err(map_err)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        let raw: Vec<(String, f64)> = lease
            .conn()
            .zrangebyscore_withscores(key, fmt_bound(min), fmt_bound(max))
            .await
            .map_err(map_err)?;
        Ok(raw
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().zcard(key).await.map_err(map_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().zrem(key, member).await.map_err(map_err)
    }

    async fn zmax_score(&self, key: &str) -> Result<Option<f64>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        let top: Vec<(String, f64)> = lease
            .conn()
            .zrevrange_withscores(key, 0, 0)
            .await
            .map_err(map_err)?;
        Ok(top.into_iter().next().map(|(_, score)| score))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().sadd(key, member).await.map_err(map_err)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().srem(key, member).await.map_err(map_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().smembers(key).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().expire(key, ttl_secs).await.map_err(map_err)
    }

    async fn ttl(&self, key: &str) -> Result<i64, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().ttl(key).await.map_err(map_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().exists(key).await.map_err(map_err)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        lease.conn().del(key).await.map_err(map_err)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut lease = self.pool.acquire(ConnKind::Read).await?;
        lease.conn().keys(pattern).await.map_err(map_err)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Any).await?;
        let _: String = redis::cmd("PING")
            .query_async(lease.conn())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut lease = self.pool.acquire(ConnKind::Write).await?;
        let _: i64 = lease
            .conn()
            .publish(channel, payload)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Pin<Box<dyn futures::Stream<Item = PubSubMessage> + Send>>, KvError> {
        let conn = self.pool.dedicated_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(map_err)?;

        let channel_owned = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel = channel_owned.clone();
            async move {
                let payload: String = msg.get_payload().ok()?;
                Some(PubSubMessage { channel, payload })
            }
        });
        Ok(Box::pin(stream))
    }
}

/// `ZRANGEBYSCORE` accepts `-inf`/`+inf` literals; `redis-rs` wants these
/// spelled out rather than relying on `f64::INFINITY`'s `Display`.
fn fmt_bound(v: f64) -> String {
    if v == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if v == f64::INFINITY {
        "+inf".to_string()
    } else {
        v.to_string()
    }
}
