//! Alert rule evaluation over the metrics a [`crate::snapshot::SnapshotRing`]
//! accumulates (spec.md §4.12).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// One alerting rule: fires when `condition(metric_value, threshold)` holds
/// for at least `duration`.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub condition: Condition,
    pub threshold: f64,
    pub duration: Duration,
    pub severity: Severity,
    pub enabled: bool,
}

impl AlertRule {
    fn holds(&self, value: f64) -> bool {
        match self.condition {
            Condition::GreaterThan => value > self.threshold,
            Condition::LessThan => value < self.threshold,
            Condition::Equals => (value - self.threshold).abs() < f64::EPSILON,
        }
    }
}

/// The spec.md §4.12 default rule set.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "high_session_count".to_string(),
            metric: "active_sessions".to_string(),
            condition: Condition::GreaterThan,
            threshold: 1000.0,
            duration: Duration::from_secs(0),
            severity: Severity::Warning,
            enabled: true,
        },
        AlertRule {
            name: "high_error_rate".to_string(),
            metric: "error_rate".to_string(),
            condition: Condition::GreaterThan,
            threshold: 0.05,
            duration: Duration::from_secs(0),
            severity: Severity::Critical,
            enabled: true,
        },
        AlertRule {
            name: "dead_agents".to_string(),
            metric: "dead_agents".to_string(),
            condition: Condition::GreaterThan,
            threshold: 0.0,
            duration: Duration::from_secs(0),
            severity: Severity::Warning,
            enabled: true,
        },
        AlertRule {
            name: "high_latency".to_string(),
            metric: "latency_ms_p99".to_string(),
            condition: Condition::GreaterThan,
            threshold: 1000.0,
            duration: Duration::from_secs(0),
            severity: Severity::Warning,
            enabled: true,
        },
    ]
}

/// A currently-firing alert, tracked from the moment its condition first
/// held so `duration` can be honored before it's reported as firing.
#[derive(Debug, Clone, Serialize)]
pub struct FiringAlert {
    pub rule_name: String,
    pub severity: Severity,
    pub since: DateTime<Utc>,
    pub value: f64,
}

struct PendingState {
    first_true_at: DateTime<Utc>,
    value: f64,
}

/// Evaluates [`AlertRule`]s against a metric snapshot every tick, firing once
/// a condition has held continuously for `rule.duration` and resolving when
/// it stops holding.
pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    pending: DashMap<String, PendingState>,
    firing: DashMap<String, FiringAlert>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            pending: DashMap::new(),
            firing: DashMap::new(),
        }
    }

    /// One evaluation tick. `metrics` maps metric name to its current value;
    /// the caller assembles this from [`crate::snapshot::SessionMetricsSnapshot`]
    /// and the MetricsHub gauges, since the rules reference logical names,
    /// not raw Prometheus series.
    pub fn evaluate(&self, metrics: &std::collections::HashMap<String, f64>) -> Vec<FiringAlert> {
        let now = Utc::now();
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let Some(value) = metrics.get(&rule.metric).copied() else {
                continue;
            };
            if rule.holds(value) {
                let first_true_at = self
                    .pending
                    .entry(rule.name.clone())
                    .or_insert_with(|| PendingState {
                        first_true_at: now,
                        value,
                    })
                    .first_true_at;
                self.pending.insert(
                    rule.name.clone(),
                    PendingState {
                        first_true_at,
                        value,
                    },
                );

                let held_for = now.signed_duration_since(first_true_at);
                if held_for >= chrono::Duration::from_std(rule.duration).unwrap_or_default() {
                    self.firing.insert(
                        rule.name.clone(),
                        FiringAlert {
                            rule_name: rule.name.clone(),
                            severity: rule.severity,
                            since: first_true_at,
                            value,
                        },
                    );
                }
            } else {
                self.pending.remove(&rule.name);
                self.firing.remove(&rule.name);
            }
        }

        self.firing.iter().map(|e| e.value().clone()).collect()
    }

    pub fn firing(&self) -> Vec<FiringAlert> {
        self.firing.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn fires_immediately_for_zero_duration_rule() {
        let evaluator = AlertEvaluator::new(default_rules());
        let mut metrics = HashMap::new();
        metrics.insert("dead_agents".to_string(), 1.0);

        let firing = evaluator.evaluate(&metrics);
        assert!(firing.iter().any(|a| a.rule_name == "dead_agents"));
    }

    #[test]
    fn resolves_once_condition_stops_holding() {
        let evaluator = AlertEvaluator::new(default_rules());
        let mut metrics = HashMap::new();
        metrics.insert("dead_agents".to_string(), 1.0);
        evaluator.evaluate(&metrics);
        assert!(!evaluator.firing().is_empty());

        metrics.insert("dead_agents".to_string(), 0.0);
        evaluator.evaluate(&metrics);
        assert!(evaluator.firing().is_empty());
    }
}
