//! Visual diffs and confidence-scored merges over conflicting values
//! (spec.md §4.11). Invoked by rollback strategies under `merge` conflict
//! resolution; also usable standalone for an API surface that needs to show
//! a human a diff before they pick a resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `mergeStrings` reduces confidence by this amount per discarded rollback
/// line. A documented heuristic, not a derived bound — kept as a named
/// constant so it can be retuned without reshaping the algorithm.
const DISCARD_CONFIDENCE_PENALTY: i32 = 5;

const MAX_COMPLEXITY_DEFAULT: f64 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Json,
    Line,
    Word,
    Char,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineType {
    Added,
    Removed,
    Modified,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One rendered line of a [`VisualDiff`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffLine {
    pub line_type: DiffLineType,
    pub line_number: Option<usize>,
    pub content: String,
    /// Present for `word`/`char` modes: the sub-spans that actually differ.
    pub tokens: Option<Vec<String>>,
}

/// Result of [`ConflictResolver::visual_diff`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualDiff {
    pub mode: DiffMode,
    pub lines: Vec<DiffLine>,
    /// Fraction of unchanged lines over total lines, in `[0, 100]`.
    pub similarity: f64,
    pub severity: DiffSeverity,
    pub auto_resolvable: bool,
}

/// Result of a merge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub merged: Value,
    /// In `[0, 100]`.
    pub confidence: i32,
    pub success: bool,
    pub discarded: Vec<String>,
    pub requires_user: bool,
}

/// Tunables for [`ConflictResolver::smart_merge`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub prefer_newer: bool,
    pub preserve_structure: bool,
    pub max_complexity: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            prefer_newer: true,
            preserve_structure: true,
            max_complexity: MAX_COMPLEXITY_DEFAULT,
        }
    }
}

/// Stateless diff/merge engine; every method takes its inputs by reference
/// and returns owned output, same deep-clone discipline as `DiffEngine` and
/// `SnapshotStore`.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Picks a diff mode from the shape of `current`/`rollback` and renders
    /// a [`VisualDiff`].
    pub fn visual_diff(&self, current: &Value, rollback: &Value) -> VisualDiff {
        if current.is_object() && rollback.is_object() {
            return self.json_diff(current, rollback);
        }

        if let (Some(a), Some(b)) = (current.as_str(), rollback.as_str()) {
            if a.contains('\n') || b.contains('\n') {
                return self.line_diff(a, b);
            }
            if a.len() > 60 || b.len() > 60 {
                return self.word_diff(a, b);
            }
            return self.char_diff(a, b);
        }

        self.semantic_diff(current, rollback)
    }

    fn json_diff(&self, current: &Value, rollback: &Value) -> VisualDiff {
        let entries = crate::diff_engine::diff(rollback, current, &crate::diff_engine::DiffOptions::default());
        let total = entries.len().max(1);
        let lines: Vec<DiffLine> = entries
            .iter()
            .map(|e| {
                let line_type = match e.op {
                    crate::diff_engine::DiffOp::Create => DiffLineType::Added,
                    crate::diff_engine::DiffOp::Delete => DiffLineType::Removed,
                    _ => DiffLineType::Modified,
                };
                DiffLine {
                    line_type,
                    line_number: None,
                    content: format!(
                        "{}: {} -> {}",
                        e.path,
                        e.old_value.as_ref().map(Value::to_string).unwrap_or_else(|| "null".into()),
                        e.new_value.as_ref().map(Value::to_string).unwrap_or_else(|| "null".into()),
                    ),
                    tokens: None,
                }
            })
            .collect();

        let unchanged = total.saturating_sub(entries.len());
        self.finish(DiffMode::Json, lines, unchanged, total, false)
    }

    fn line_diff(&self, current: &str, rollback: &str) -> VisualDiff {
        let cur_lines: Vec<&str> = current.lines().collect();
        let roll_lines: Vec<&str> = rollback.lines().collect();
        let max_len = cur_lines.len().max(roll_lines.len()).max(1);

        let mut lines = Vec::new();
        let mut unchanged = 0usize;
        for i in 0..max_len {
            match (roll_lines.get(i), cur_lines.get(i)) {
                (Some(r), Some(c)) if r == c => {
                    unchanged += 1;
                    lines.push(DiffLine {
                        line_type: DiffLineType::Context,
                        line_number: Some(i),
                        content: (*c).to_string(),
                        tokens: None,
                    });
                }
                (Some(r), Some(c)) => {
                    lines.push(DiffLine {
                        line_type: DiffLineType::Modified,
                        line_number: Some(i),
                        content: format!("{r} -> {c}"),
                        tokens: None,
                    });
                }
                (Some(r), None) => lines.push(DiffLine {
                    line_type: DiffLineType::Removed,
                    line_number: Some(i),
                    content: (*r).to_string(),
                    tokens: None,
                }),
                (None, Some(c)) => lines.push(DiffLine {
                    line_type: DiffLineType::Added,
                    line_number: Some(i),
                    content: (*c).to_string(),
                    tokens: None,
                }),
                (None, None) => {}
            }
        }

        self.finish(DiffMode::Line, lines, unchanged, max_len, false)
    }

    fn word_diff(&self, current: &str, rollback: &str) -> VisualDiff {
        self.token_diff(DiffMode::Word, current, rollback, |s| {
            s.split_whitespace().map(str::to_string).collect()
        })
    }

    fn char_diff(&self, current: &str, rollback: &str) -> VisualDiff {
        self.token_diff(DiffMode::Char, current, rollback, |s| {
            s.chars().map(String::from).collect()
        })
    }

    fn token_diff(
        &self,
        mode: DiffMode,
        current: &str,
        rollback: &str,
        tokenize: impl Fn(&str) -> Vec<String>,
    ) -> VisualDiff {
        let cur_tokens = tokenize(current);
        let roll_tokens = tokenize(rollback);
        let max_len = cur_tokens.len().max(roll_tokens.len()).max(1);

        let mut unchanged = 0usize;
        let mut changed_tokens = Vec::new();
        for i in 0..max_len {
            match (roll_tokens.get(i), cur_tokens.get(i)) {
                (Some(r), Some(c)) if r == c => unchanged += 1,
                (Some(r), Some(c)) => changed_tokens.push(format!("{r}->{c}")),
                (Some(r), None) => changed_tokens.push(format!("-{r}")),
                (None, Some(c)) => changed_tokens.push(format!("+{c}")),
                (None, None) => {}
            }
        }

        let line_type = if unchanged == max_len {
            DiffLineType::Context
        } else {
            DiffLineType::Modified
        };
        let lines = vec![DiffLine {
            line_type,
            line_number: None,
            content: format!("{rollback} -> {current}"),
            tokens: if changed_tokens.is_empty() { None } else { Some(changed_tokens) },
        }];

        self.finish(mode, lines, unchanged, max_len, false)
    }

    fn semantic_diff(&self, current: &Value, rollback: &Value) -> VisualDiff {
        let equal = crate::snapshot_store::canonicalize(current) == crate::snapshot_store::canonicalize(rollback);
        let type_mismatch = std::mem::discriminant(current) != std::mem::discriminant(rollback);
        let lines = vec![DiffLine {
            line_type: if equal { DiffLineType::Context } else { DiffLineType::Modified },
            line_number: None,
            content: format!("{rollback} -> {current}"),
            tokens: None,
        }];
        self.finish(DiffMode::Semantic, lines, usize::from(equal), 1, type_mismatch)
    }

    fn finish(
        &self,
        mode: DiffMode,
        lines: Vec<DiffLine>,
        unchanged: usize,
        total: usize,
        type_mismatch: bool,
    ) -> VisualDiff {
        let similarity = (unchanged as f64 / total.max(1) as f64) * 100.0;
        let changes = lines
            .iter()
            .filter(|l| l.line_type != DiffLineType::Context)
            .count();

        let severity = if type_mismatch {
            DiffSeverity::High
        } else if similarity < 30.0 {
            DiffSeverity::Critical
        } else if similarity < 60.0 {
            DiffSeverity::Medium
        } else {
            DiffSeverity::Low
        };

        let auto_resolvable = severity != DiffSeverity::Critical && similarity > 50.0 && changes < 20;

        VisualDiff {
            mode,
            lines,
            similarity,
            severity,
            auto_resolvable,
        }
    }

    /// Complexity score used to gate [`smart_merge`](Self::smart_merge) —
    /// above `max_complexity` the merge bails out to `ask_user`.
    fn complexity(&self, kind: crate::model::ConflictKind, current: &Value, rollback: &Value) -> f64 {
        let base = match kind {
            crate::model::ConflictKind::ValueMismatch => 10.0,
            crate::model::ConflictKind::TypeMismatch => 50.0,
            crate::model::ConflictKind::DependencyConflict => 100.0,
            _ => 25.0,
        };
        let current_size = serde_json::to_vec(current).map(|b| b.len()).unwrap_or(0);
        let rollback_size = serde_json::to_vec(rollback).map(|b| b.len()).unwrap_or(0);
        let size_term = current_size.max(rollback_size) as f64 / 100.0;
        let key_term = current.as_object().map(|m| m.len()).unwrap_or(0) as f64 * 5.0;
        base + size_term + key_term
    }

    /// Confidence-scored merge of `current` against `rollback` for a single
    /// conflict.
    pub fn smart_merge(
        &self,
        kind: crate::model::ConflictKind,
        current: &Value,
        rollback: &Value,
        opts: &MergeOptions,
    ) -> MergeResult {
        let score = self.complexity(kind, current, rollback);
        if score > opts.max_complexity {
            return MergeResult {
                merged: current.clone(),
                confidence: 0,
                success: false,
                discarded: vec![],
                requires_user: true,
            };
        }

        match (current, rollback) {
            (Value::Object(_), Value::Object(_)) => self.merge_objects(current, rollback, opts),
            (Value::String(c), Value::String(r)) => self.merge_strings(c, r, opts),
            _ => {
                let (merged, discarded) = if opts.prefer_newer {
                    (current.clone(), vec![])
                } else {
                    (rollback.clone(), vec!["current".to_string()])
                };
                MergeResult {
                    merged,
                    confidence: 100,
                    success: true,
                    discarded,
                    requires_user: false,
                }
            }
        }
    }

    fn merge_objects(&self, current: &Value, rollback: &Value, opts: &MergeOptions) -> MergeResult {
        let current_map = current.as_object().cloned().unwrap_or_default();
        let rollback_map = rollback.as_object().cloned().unwrap_or_default();

        let mut merged = current_map.clone();
        let mut discarded = Vec::new();
        let mut confidence = 100i32;

        for (key, rollback_value) in &rollback_map {
            match current_map.get(key) {
                None => {
                    merged.insert(key.clone(), rollback_value.clone());
                }
                Some(current_value) if current_value == rollback_value => {}
                Some(current_value) => {
                    if current_value.is_object() && rollback_value.is_object() && opts.preserve_structure {
                        let sub = self.merge_objects(current_value, rollback_value, opts);
                        confidence = confidence.min(sub.confidence);
                        discarded.extend(sub.discarded.iter().map(|d| format!("{key}.{d}")));
                        merged.insert(key.clone(), sub.merged);
                    } else if opts.prefer_newer {
                        discarded.push(key.clone());
                        confidence -= DISCARD_CONFIDENCE_PENALTY;
                    } else {
                        merged.insert(key.clone(), rollback_value.clone());
                    }
                }
            }
        }

        let confidence = confidence.clamp(0, 100);
        MergeResult {
            merged: Value::Object(merged),
            confidence,
            success: confidence >= 70,
            discarded,
            requires_user: false,
        }
    }

    /// Line-based string merge: unchanged lines kept, added/removed lines
    /// taken per `prefer_newer`; confidence drops by
    /// [`DISCARD_CONFIDENCE_PENALTY`] for every rollback line dropped.
    fn merge_strings(&self, current: &str, rollback: &str, opts: &MergeOptions) -> MergeResult {
        let current_lines: Vec<&str> = current.lines().collect();
        let rollback_lines: Vec<&str> = rollback.lines().collect();
        let max_len = current_lines.len().max(rollback_lines.len());

        let mut merged_lines = Vec::with_capacity(max_len);
        let mut discarded = Vec::new();
        let mut confidence = 100i32;

        for i in 0..max_len {
            match (rollback_lines.get(i), current_lines.get(i)) {
                (Some(r), Some(c)) if r == c => merged_lines.push((*c).to_string()),
                (Some(r), Some(c)) => {
                    if opts.prefer_newer {
                        merged_lines.push((*c).to_string());
                        discarded.push((*r).to_string());
                        confidence -= DISCARD_CONFIDENCE_PENALTY;
                    } else {
                        merged_lines.push((*r).to_string());
                    }
                }
                (Some(r), None) => {
                    if opts.prefer_newer {
                        discarded.push((*r).to_string());
                        confidence -= DISCARD_CONFIDENCE_PENALTY;
                    } else {
                        merged_lines.push((*r).to_string());
                    }
                }
                (None, Some(c)) => merged_lines.push((*c).to_string()),
                (None, None) => {}
            }
        }

        let confidence = confidence.clamp(0, 100);
        MergeResult {
            merged: Value::String(merged_lines.join("\n")),
            confidence,
            success: confidence >= 70,
            discarded,
            requires_user: false,
        }
    }

    /// Resolves `conflicts` grouped by the top path segment (everything
    /// before the first `.`), one group at a time, in the order the groups
    /// first appear.
    pub fn resolve_batch(
        &self,
        conflicts: &[crate::model::Conflict],
        opts: &MergeOptions,
    ) -> HashMap<String, MergeResult> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&crate::model::Conflict>> = HashMap::new();
        for conflict in conflicts {
            let top = conflict
                .path
                .trim_start_matches('$')
                .trim_start_matches('.')
                .split('.')
                .next()
                .unwrap_or(conflict.path.as_str())
                .to_string();
            if !groups.contains_key(&top) {
                order.push(top.clone());
            }
            groups.entry(top).or_default().push(conflict);
        }

        let mut results = HashMap::new();
        for path in order {
            let Some(group) = groups.get(&path) else { continue };
            let Some(first) = group.first() else { continue };
            let current = first.current_value.clone().unwrap_or(Value::Null);
            let rollback = first.rollback_value.clone().unwrap_or(Value::Null);
            let result = self.smart_merge(first.kind, &current, &rollback, opts);
            results.insert(path, result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_diff_reports_similarity_and_severity() {
        let resolver = ConflictResolver::new();
        let current = json!({"a": 1, "b": 2});
        let rollback = json!({"a": 1, "b": 3});
        let diff = resolver.visual_diff(&current, &rollback);
        assert_eq!(diff.mode, DiffMode::Json);
        assert!(diff.auto_resolvable);
    }

    #[test]
    fn type_mismatch_is_high_severity() {
        let resolver = ConflictResolver::new();
        let diff = resolver.visual_diff(&json!(1), &json!("one"));
        assert_eq!(diff.severity, DiffSeverity::High);
    }

    #[test]
    fn smart_merge_keeps_non_conflicting_keys_and_prefers_newer() {
        let resolver = ConflictResolver::new();
        let current = json!({"port": 8080, "env": "prod", "features": ["auth", "logging", "metrics"]});
        let rollback = json!({"port": 3000, "env": "dev", "features": ["auth", "logging"]});
        let result = resolver.smart_merge(
            crate::model::ConflictKind::ValueMismatch,
            &current,
            &rollback,
            &MergeOptions::default(),
        );
        assert_eq!(result.merged, current);
        assert!(result.confidence >= 70);
    }

    #[test]
    fn merge_strings_penalizes_discarded_rollback_lines() {
        let resolver = ConflictResolver::new();
        let result = resolver.merge_strings("a\nb\nc", "a\nx\nc", &MergeOptions::default());
        assert_eq!(result.confidence, 100 - DISCARD_CONFIDENCE_PENALTY);
        assert_eq!(result.discarded, vec!["x".to_string()]);
    }

    #[test]
    fn complexity_above_max_forces_ask_user() {
        let resolver = ConflictResolver::new();
        let opts = MergeOptions {
            max_complexity: 1.0,
            ..MergeOptions::default()
        };
        let result = resolver.smart_merge(
            crate::model::ConflictKind::DependencyConflict,
            &json!({"a": 1}),
            &json!({"a": 2}),
            &opts,
        );
        assert!(result.requires_user);
        assert_eq!(result.confidence, 0);
    }

    #[test]
    fn resolve_batch_groups_by_top_path_segment() {
        let resolver = ConflictResolver::new();
        let conflicts = vec![
            crate::model::Conflict {
                path: "$.config.port".to_string(),
                kind: crate::model::ConflictKind::ValueMismatch,
                current_value: Some(json!(8080)),
                rollback_value: Some(json!(3000)),
                context: None,
            },
            crate::model::Conflict {
                path: "$.agents.count".to_string(),
                kind: crate::model::ConflictKind::ValueMismatch,
                current_value: Some(json!(3)),
                rollback_value: Some(json!(1)),
                context: None,
            },
        ];
        let results = resolver.resolve_batch(&conflicts, &MergeOptions::default());
        assert_eq!(results.len(), 2);
    }
}
