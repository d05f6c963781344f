//! Redis-backed [`KvFacade`](agentsync_core::KvFacade) and connection pool
//! for `agentsync-core` (spec.md §4.1, §4.2).
//!
//! This crate supplies the one concrete backend the core is written
//! against its [`KvFacade`](agentsync_core::KvFacade) trait for: a real
//! Redis (or Redis-compatible) server reached through `redis-rs`'s
//! multiplexed async connections, pooled by [`RConnPool`].

pub mod facade;
pub mod pool;

pub use facade::RedisKv;
pub use pool::{Lease, RConnPool};

#[cfg(test)]
mod tests {
    use super::*;
    use agentsync_core::RedisConfig;

    /// Connection pooling tests need a live Redis; they're marked `ignore`
    /// so `cargo test` doesn't fail in environments without one (mirrors
    /// how the corpus gates its Redis-requiring integration tests).
    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn connects_and_pings() {
        let pool = RConnPool::connect(RedisConfig::default()).await.unwrap();
        let kv = RedisKv::new(pool);
        agentsync_core::KvFacade::ping(&kv).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn acquire_respects_pool_max() {
        let mut config = RedisConfig::default();
        config.pool_min = 1;
        config.pool_max = 2;
        config.acquire_timeout = std::time::Duration::from_millis(200);
        let pool = RConnPool::connect(config).await.unwrap();

        let l1 = pool.acquire(agentsync_core::ConnKind::Any).await.unwrap();
        let l2 = pool.acquire(agentsync_core::ConnKind::Any).await.unwrap();
        let l3 = pool.acquire(agentsync_core::ConnKind::Any).await;
        assert!(l3.is_err(), "third acquire should time out at pool_max=2");
        drop(l1);
        drop(l2);
    }
}
