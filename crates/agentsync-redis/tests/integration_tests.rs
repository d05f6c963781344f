//! Integration tests for the Redis-backed `KvFacade` and `ConnPool`.
//!
//! These tests require a running Redis instance:
//!
//! ```bash
//! docker run -d --rm -p 6379:6379 redis:7
//! cargo test --package agentsync-redis --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use agentsync_core::model::{ChangeInfo, EventType};
use agentsync_core::{
    session_manager::EventDraft, CreateOptions, RedisConfig, SessionConfig, SessionManager,
    SessionStore,
};
use agentsync_redis::{RConnPool, RedisKv};
use std::sync::Arc;

fn connection_string() -> String {
    std::env::var("REDIS_CONNECTION_STRING").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
}

async fn redis_kv() -> Arc<dyn agentsync_core::KvFacade> {
    let mut config = RedisConfig::default();
    config.url = connection_string();
    let pool = RConnPool::connect(config).await.expect("failed to connect to redis");
    Arc::new(RedisKv::new(pool))
}

#[tokio::test]
#[ignore = "requires running Redis (run with --ignored)"]
async fn session_store_create_and_get_round_trips_through_redis() {
    let kv = redis_kv().await;
    let store = SessionStore::new(kv, SessionConfig::default());

    let session_id = format!("sess-it-{}", uuid::Uuid::new_v4());
    store
        .create(&session_id, "agent-A", CreateOptions::default())
        .await
        .expect("create session");

    let (session, events) = store.get(&session_id).await.unwrap().expect("session exists");
    assert_eq!(session.agent_ids, vec!["agent-A".to_string()]);
    assert!(events.is_empty());
}

#[tokio::test]
#[ignore = "requires running Redis (run with --ignored)"]
async fn session_manager_emit_event_allocates_contiguous_sequence() {
    let kv = redis_kv().await;
    let config = SessionConfig::default();
    let manager = SessionManager::new(kv, config);

    let session_id = manager.create_session("agent-A", CreateOptions::default()).await.unwrap();

    for _ in 0..2 {
        manager
            .emit_event(
                &session_id,
                EventDraft {
                    event_type: EventType::Modified,
                    change_info: ChangeInfo {
                        entity_ids: vec!["F1".into()],
                        operation: "modified".into(),
                    },
                    state_transition: None,
                    impact: None,
                },
                "agent-A",
                Default::default(),
            )
            .await
            .unwrap();
    }

    let (_, events) = manager.store().get(&session_id).await.unwrap().unwrap();
    let mut seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
#[ignore = "requires running Redis (run with --ignored)"]
async fn connection_pool_acquire_and_release_cycles_connections() {
    let mut config = RedisConfig::default();
    config.url = connection_string();
    config.pool_min = 1;
    config.pool_max = 4;
    let pool = RConnPool::connect(config).await.unwrap();

    let leases: Vec<_> = futures::future::join_all(
        (0..3).map(|_| pool.acquire(agentsync_core::ConnKind::Any)),
    )
    .await
    .into_iter()
    .map(|l| l.unwrap())
    .collect();
    assert!(pool.in_use() >= 1);
    drop(leases);
}
