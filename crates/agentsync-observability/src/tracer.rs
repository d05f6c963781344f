//! Span-based tracing API: `StartSpan`/`FinishSpan`/`AddLog` (spec.md
//! §4.12). Each span is also a `tracing::Span` so the usual subscriber-based
//! log/trace pipeline keeps working; this module layers the explicit,
//! callback-free API the spec asks for on top, and feeds span duration into
//! [`crate::metrics::MetricsHub`]'s `session_operation_duration_seconds`.

use crate::error::{Error, Result};
use crate::metrics::MetricsHub;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub fields: serde_json::Value,
}

struct SpanRecord {
    name: String,
    parent: Option<String>,
    tags: serde_json::Value,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    logs: Vec<SpanLog>,
    _guard_span: tracing::Span,
}

/// An immutable view of a span after it has finished.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSpan {
    pub span_id: String,
    pub name: String,
    pub parent: Option<String>,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub tags: serde_json::Value,
    pub logs: Vec<SpanLog>,
}

/// In-process span registry. `StartSpan`/`FinishSpan`/`AddLog` from
/// spec.md §4.12, with duration recorded into the injected `MetricsHub`.
pub struct Tracer {
    metrics: Arc<MetricsHub>,
    open: DashMap<String, SpanRecord>,
}

impl Tracer {
    pub fn new(metrics: Arc<MetricsHub>) -> Self {
        Self {
            metrics,
            open: DashMap::new(),
        }
    }

    /// Opens a new span, optionally nested under `parent`. Returns the span id.
    pub fn start_span(
        &self,
        name: &str,
        parent: Option<&str>,
        tags: serde_json::Value,
    ) -> String {
        let span_id = Uuid::new_v4().to_string();
        let guard_span = tracing::info_span!("operation", name = %name, span_id = %span_id, parent = parent);
        self.open.insert(
            span_id.clone(),
            SpanRecord {
                name: name.to_string(),
                parent: parent.map(str::to_string),
                tags,
                started_at: Instant::now(),
                started_at_wall: Utc::now(),
                logs: Vec::new(),
                _guard_span: guard_span,
            },
        );
        span_id
    }

    /// Appends a structured log line to an open span.
    pub fn add_log(
        &self,
        span_id: &str,
        level: LogLevel,
        message: impl Into<String>,
        fields: serde_json::Value,
    ) -> Result<()> {
        let mut record = self
            .open
            .get_mut(span_id)
            .ok_or_else(|| Error::SpanNotFound(span_id.to_string()))?;
        let message = message.into();
        tracing::event!(Level::from(level), span_id, %message);
        record.logs.push(SpanLog {
            timestamp: Utc::now(),
            level,
            message,
            fields,
        });
        Ok(())
    }

    /// Closes a span, merges `tags` into the ones it was opened with, and
    /// records its duration into `session_operation_duration_seconds{operation=name}`.
    pub fn finish_span(
        &self,
        span_id: &str,
        status: SpanStatus,
        tags: serde_json::Value,
    ) -> Result<FinishedSpan> {
        let (_, mut record) = self
            .open
            .remove(span_id)
            .ok_or_else(|| Error::SpanNotFound(span_id.to_string()))?;

        if let (serde_json::Value::Object(base), serde_json::Value::Object(extra)) =
            (&mut record.tags, tags)
        {
            base.extend(extra);
        }

        let elapsed = record.started_at.elapsed();
        self.metrics
            .operation_histogram(&record.name)
            .observe(elapsed.as_secs_f64());

        Ok(FinishedSpan {
            span_id: span_id.to_string(),
            name: record.name,
            parent: record.parent,
            status,
            started_at: record.started_at_wall,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            tags: record.tags,
            logs: record.logs,
        })
    }

    pub fn open_span_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_duration_feeds_histogram() {
        let metrics = Arc::new(MetricsHub::new().unwrap());
        let tracer = Tracer::new(metrics.clone());

        let span = tracer.start_span("checkpoint", None, serde_json::json!({"session_id": "s1"}));
        tracer
            .add_log(&span, LogLevel::Info, "window aggregated", serde_json::json!({}))
            .unwrap();
        let finished = tracer
            .finish_span(&span, SpanStatus::Ok, serde_json::json!({"outcome": "working"}))
            .unwrap();

        assert_eq!(finished.name, "checkpoint");
        assert_eq!(finished.logs.len(), 1);
        assert_eq!(finished.tags["outcome"], "working");
        assert_eq!(tracer.open_span_count(), 0);

        let body = metrics.export().unwrap();
        assert!(body.contains("agentsync_session_operation_duration_seconds"));
    }

    #[test]
    fn finishing_unknown_span_errors() {
        let metrics = Arc::new(MetricsHub::new().unwrap());
        let tracer = Tracer::new(metrics);
        let err = tracer.finish_span("nope", SpanStatus::Ok, serde_json::json!({}));
        assert!(matches!(err, Err(Error::SpanNotFound(_))));
    }
}
