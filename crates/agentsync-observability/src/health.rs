//! Aggregated component health (spec.md §4.13).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Warning,
    Critical,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub last_check: DateTime<Utc>,
    pub details: Option<String>,
}

/// `GetHealth()`'s response shape: per-component health plus the worst
/// status among them as `overall`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: ComponentStatus,
    pub components: std::collections::HashMap<String, ComponentHealth>,
}

/// Aggregates health across named components (`sessionManager`, `redis`,
/// `sessionStore`, and optionally `sessionReplay`/`sessionMigration` when
/// those collaborators are wired in). Each component reports its own status
/// via [`HealthCheck::record`]; `report()` computes `overall` as the worst.
#[derive(Default)]
pub struct HealthCheck {
    components: DashMap<String, ComponentHealth>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        component: &str,
        status: ComponentStatus,
        latency_ms: f64,
        error_rate: f64,
        details: Option<String>,
    ) {
        self.components.insert(
            component.to_string(),
            ComponentHealth {
                status,
                latency_ms,
                error_rate,
                last_check: Utc::now(),
                details,
            },
        );
    }

    pub fn report(&self) -> HealthReport {
        let components: std::collections::HashMap<String, ComponentHealth> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let overall = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthReport { overall, components }
    }
}

/// Probes a KV facade's `ping` latency and classifies it into a
/// [`ComponentStatus`]: `<50ms` healthy, `<500ms` warning, responds-but-slow
/// critical, unreachable down.
pub fn classify_ping_latency(latency: std::time::Duration, ok: bool) -> ComponentStatus {
    if !ok {
        return ComponentStatus::Down;
    }
    let ms = latency.as_secs_f64() * 1000.0;
    if ms < 50.0 {
        ComponentStatus::Healthy
    } else if ms < 500.0 {
        ComponentStatus::Warning
    } else {
        ComponentStatus::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_worst_component() {
        let hc = HealthCheck::new();
        hc.record("sessionManager", ComponentStatus::Healthy, 1.0, 0.0, None);
        hc.record("redis", ComponentStatus::Critical, 600.0, 0.1, Some("slow ping".into()));
        let report = hc.report();
        assert_eq!(report.overall, ComponentStatus::Critical);
        assert_eq!(report.components.len(), 2);
    }

    #[test]
    fn empty_report_is_healthy() {
        let hc = HealthCheck::new();
        assert_eq!(hc.report().overall, ComponentStatus::Healthy);
    }

    #[test]
    fn latency_classification_bands() {
        assert_eq!(
            classify_ping_latency(std::time::Duration::from_millis(10), true),
            ComponentStatus::Healthy
        );
        assert_eq!(
            classify_ping_latency(std::time::Duration::from_millis(200), true),
            ComponentStatus::Warning
        );
        assert_eq!(
            classify_ping_latency(std::time::Duration::from_millis(900), true),
            ComponentStatus::Critical
        );
        assert_eq!(
            classify_ping_latency(std::time::Duration::from_millis(5), false),
            ComponentStatus::Down
        );
    }
}
