//! `GracefulShutdown`: draining, checkpointing, and recovery-data
//! persistence on termination (spec.md §4.13).
//!
//! Phases run in order — `initiated` -> `draining` -> `checkpointing` ->
//! `cleanup` -> `complete`. Any phase exceeding [`ShutdownConfig::force_close_after`]
//! switches to the `forced` path, which races component close against
//! [`ShutdownConfig::forced_close_deadline`] instead of waiting on it.

use crate::config::ShutdownConfig;
use agentsync_core::kv::KvFacade;
use agentsync_core::session_manager::{CheckpointOptions, SessionManager};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Initiated,
    Draining,
    Checkpointing,
    Cleanup,
    Complete,
    Forced,
}

/// One active session's id plus its last-activity timestamp (the most
/// recent event's `timestamp`, or the moment of shutdown if it has none
/// yet), recorded so a replacement process knows how stale each session is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

/// Snapshot of in-flight sessions persisted under `session:recovery:data` so
/// a replacement process can pick up where this one left off (spec.md
/// §4.13 step (4)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryData {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub active_sessions: Vec<SessionActivity>,
    pub configuration: serde_json::Value,
    pub statistics: agentsync_core::SessionStats,
    pub errors: Vec<String>,
}

const RECOVERY_DATA_KEY: &str = "session:recovery:data";

/// Orchestrates an ordered, checkpoint-then-close shutdown of the session
/// coordination core. Register with [`GracefulShutdown::install_signal_handlers`]
/// to drive it from SIGTERM/SIGINT/SIGQUIT, or call [`GracefulShutdown::run`]
/// directly (e.g. from a test or an explicit admin command).
pub struct GracefulShutdown {
    config: ShutdownConfig,
    manager: Arc<SessionManager>,
    kv: Arc<dyn KvFacade>,
    shutting_down: AtomicBool,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig, manager: Arc<SessionManager>, kv: Arc<dyn KvFacade>) -> Self {
        Self {
            config,
            manager,
            kv,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Awaits SIGTERM, SIGINT, or SIGQUIT and runs [`GracefulShutdown::run`]
    /// once one arrives. Intended to be spawned as a background task.
    pub async fn install_signal_handlers(self: Arc<Self>) {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGQUIT handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
            _ = quit.recv() => info!("received SIGQUIT"),
        }

        self.run().await;
    }

    /// Runs the full drain -> checkpoint -> cleanup sequence, switching to
    /// the forced path if it overruns `force_close_after`.
    pub async fn run(&self) -> ShutdownPhase {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return ShutdownPhase::Complete;
        }

        info!(phase = ?ShutdownPhase::Initiated, "graceful shutdown starting");
        match tokio::time::timeout(self.config.force_close_after, self.drain_and_checkpoint()).await {
            Ok(Ok(phase)) => phase,
            Ok(Err(e)) => {
                warn!(error = %e, "shutdown phase failed, forcing close");
                self.forced_close().await
            }
            Err(_) => {
                warn!("shutdown exceeded force_close_after, forcing close");
                self.forced_close().await
            }
        }
    }

    async fn drain_and_checkpoint(&self) -> agentsync_core::error::Result<ShutdownPhase> {
        let mut errors = Vec::new();

        info!(phase = ?ShutdownPhase::Draining, "shortening TTL on active sessions");
        let active = self.manager.store().list_active().await?;
        for id in &active {
            let _ = self
                .manager
                .store()
                .set_ttl(id, self.config.drain_ttl.as_secs() as i64)
                .await;
        }

        info!(phase = ?ShutdownPhase::Checkpointing, count = active.len(), "checkpointing active sessions");
        for id in &active {
            if let Err(e) = self
                .manager
                .checkpoint(id, CheckpointOptions { create_failure_snapshot: true })
                .await
            {
                warn!(session_id = %id, error = %e, "checkpoint during shutdown failed");
                errors.push(format!("checkpoint {id}: {e}"));
            }
        }

        info!(phase = ?ShutdownPhase::Cleanup, "persisting recovery data");
        let mut active_sessions = Vec::with_capacity(active.len());
        for id in &active {
            let last_activity = match self.manager.store().events().tail(id, 1).await {
                Ok(events) => events.last().map(|e| e.timestamp).unwrap_or_else(Utc::now),
                Err(e) => {
                    errors.push(format!("last-activity lookup {id}: {e}"));
                    Utc::now()
                }
            };
            active_sessions.push(SessionActivity {
                session_id: id.clone(),
                last_activity,
            });
        }

        let statistics = match self.manager.store().stats().await {
            Ok(stats) => stats,
            Err(e) => {
                errors.push(format!("stats: {e}"));
                agentsync_core::SessionStats::default()
            }
        };

        let configuration = serde_json::json!({
            "drain_ttl_secs": self.config.drain_ttl.as_secs(),
            "force_close_after_secs": self.config.force_close_after.as_secs(),
            "forced_close_deadline_secs": self.config.forced_close_deadline.as_secs(),
            "recovery_data_ttl_secs": self.config.recovery_data_ttl.as_secs(),
        });

        let recovery = RecoveryData {
            timestamp: Utc::now(),
            active_sessions,
            configuration,
            statistics,
            errors,
        };
        if let Ok(payload) = serde_json::to_string(&recovery) {
            self.kv.hset(RECOVERY_DATA_KEY, "blob", &payload).await?;
            self.kv
                .expire(RECOVERY_DATA_KEY, self.config.recovery_data_ttl.as_secs() as i64)
                .await?;
        }

        info!(phase = ?ShutdownPhase::Complete, "graceful shutdown complete");
        Ok(ShutdownPhase::Complete)
    }

    /// The forced path: skip per-session checkpointing, race the KV
    /// connection's close against `forced_close_deadline`.
    async fn forced_close(&self) -> ShutdownPhase {
        let deadline = self.config.forced_close_deadline;
        let _ = tokio::time::timeout(deadline, self.kv.ping()).await;
        warn!(phase = ?ShutdownPhase::Forced, "shutdown forced, session state may not be fully checkpointed");
        ShutdownPhase::Forced
    }

    /// Reads back a previously persisted [`RecoveryData`] blob, if present.
    pub async fn load_recovery_data(kv: &dyn KvFacade) -> agentsync_core::error::Result<Option<RecoveryData>> {
        let raw = kv.hget(RECOVERY_DATA_KEY, "blob").await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentsync_core::config::SessionConfig;
    use agentsync_core::test_support::InMemoryKv;

    #[tokio::test]
    async fn drains_and_persists_recovery_data() {
        let kv: Arc<dyn KvFacade> = Arc::new(InMemoryKv::new());
        let manager = Arc::new(SessionManager::new(kv.clone(), SessionConfig::default()));
        let session_id = manager
            .create_session("agent-1", Default::default())
            .await
            .unwrap();

        let shutdown = GracefulShutdown::new(ShutdownConfig::default(), manager, kv.clone());
        let phase = shutdown.run().await;
        assert_eq!(phase, ShutdownPhase::Complete);

        let recovery = GracefulShutdown::load_recovery_data(kv.as_ref())
            .await
            .unwrap()
            .expect("recovery data persisted");
        let entry = recovery
            .active_sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .expect("session present in recovery data");
        assert!(entry.last_activity <= Utc::now());

        let ttl = kv.as_ref().ttl(RECOVERY_DATA_KEY).await.unwrap();
        assert!(ttl > 0 && ttl <= 86400, "ttl {ttl} out of (0, 86400]");
    }

    #[tokio::test]
    async fn second_call_is_a_no_op() {
        let kv: Arc<dyn KvFacade> = Arc::new(InMemoryKv::new());
        let manager = Arc::new(SessionManager::new(kv.clone(), SessionConfig::default()));
        let shutdown = GracefulShutdown::new(ShutdownConfig::default(), manager, kv);
        assert_eq!(shutdown.run().await, ShutdownPhase::Complete);
        assert_eq!(shutdown.run().await, ShutdownPhase::Complete);
    }
}
