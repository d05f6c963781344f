//! Periodic `SessionMetricsSnapshot` ring buffer (spec.md §4.12).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionPoolStats {
    pub in_use: u64,
    pub acquire_timeouts_total: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
    pub registered: u64,
    pub dead_total: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub process_uptime_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorMetrics {
    pub kv_errors_total: u64,
    pub rollback_conflicts_total: u64,
}

/// A single point-in-time rollup, recorded every `collection_interval`
/// (spec.md §4.12).
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_sessions: u64,
    pub total_events: u64,
    pub event_rate_per_sec: f64,
    pub session_creation_rate_per_sec: f64,
    pub average_session_duration_secs: f64,
    pub connection_pool_stats: ConnectionPoolStats,
    pub agent_metrics: AgentMetrics,
    pub system_metrics: SystemMetrics,
    pub error_metrics: ErrorMetrics,
}

/// A fixed-retention ring buffer of [`SessionMetricsSnapshot`]s. Capacity is
/// derived from `retention_days / collection_interval` at construction time;
/// pushing past capacity evicts the oldest entry.
pub struct SnapshotRing {
    capacity: usize,
    buf: Mutex<VecDeque<SessionMetricsSnapshot>>,
}

impl SnapshotRing {
    pub fn new(retention_days: u32, collection_interval: std::time::Duration) -> Self {
        let interval_secs = collection_interval.as_secs().max(1);
        let capacity = ((retention_days as u64 * 86_400) / interval_secs).max(1) as usize;
        Self {
            capacity,
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn push(&self, snapshot: SessionMetricsSnapshot) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<SessionMetricsSnapshot> {
        self.buf.lock().back().cloned()
    }

    pub fn recent(&self, n: usize) -> Vec<SessionMetricsSnapshot> {
        let buf = self.buf.lock();
        buf.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            timestamp: Utc::now(),
            active_sessions: 1,
            total_events: 1,
            event_rate_per_sec: 0.0,
            session_creation_rate_per_sec: 0.0,
            average_session_duration_secs: 0.0,
            connection_pool_stats: ConnectionPoolStats::default(),
            agent_metrics: AgentMetrics::default(),
            system_metrics: SystemMetrics::default(),
            error_metrics: ErrorMetrics::default(),
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let ring = SnapshotRing::new(1, std::time::Duration::from_secs(43_200));
        assert_eq!(ring.capacity, 2);
        ring.push(sample());
        ring.push(sample());
        ring.push(sample());
        assert_eq!(ring.len(), 2);
    }
}
