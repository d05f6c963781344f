//! Deep structural diff over JSON-like values; diff application; equality
//! with custom comparators (spec.md §4.9).

use serde_json::Value;
use std::collections::HashMap;

/// The kind of change a [`DiffEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffOp {
    Create,
    Update,
    Delete,
    Move,
}

impl DiffOp {
    /// Apply order: `delete < update < move < create`.
    fn priority(self) -> u8 {
        match self {
            DiffOp::Delete => 0,
            DiffOp::Update => 1,
            DiffOp::Move => 2,
            DiffOp::Create => 3,
        }
    }
}

/// One structural change at `path` (a dotted path with `[n]` index segments).
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub op: DiffOp,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Options controlling a diff pass.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub ignore_properties: Vec<String>,
    pub max_depth: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignore_properties: vec![
                "__timestamp".to_string(),
                "__version".to_string(),
                "__metadata".to_string(),
            ],
            max_depth: 10,
        }
    }
}

/// Change-count summary produced by [`summarize`].
#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub moves: usize,
    pub complexity: Complexity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

/// A per-type override for [`deep_equals`], keyed by `"*"` (applies to every
/// value) or a discriminating `"type"` tag found on both sides.
pub type Comparator = fn(&Value, &Value) -> bool;

/// Recursively diffs `source` against `target`.
pub fn diff(source: &Value, target: &Value, opts: &DiffOptions) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    diff_at("$", source, target, opts, 0, &mut entries);
    entries
}

fn diff_at(
    path: &str,
    source: &Value,
    target: &Value,
    opts: &DiffOptions,
    depth: usize,
    out: &mut Vec<DiffEntry>,
) {
    if depth >= opts.max_depth {
        if !values_equal(source, target) {
            out.push(DiffEntry {
                path: path.to_string(),
                op: DiffOp::Update,
                old_value: Some(source.clone()),
                new_value: Some(target.clone()),
            });
        }
        return;
    }

    match (source, target) {
        (Value::Object(src_map), Value::Object(tgt_map)) => {
            let mut keys: Vec<&String> = src_map.keys().chain(tgt_map.keys()).collect();
            keys.sort();
            keys.dedup();

            for key in keys {
                if opts.ignore_properties.iter().any(|p| p == key) {
                    continue;
                }
                let child_path = format!("{path}.{key}");
                match (src_map.get(key), tgt_map.get(key)) {
                    (Some(s), Some(t)) => diff_at(&child_path, s, t, opts, depth + 1, out),
                    (Some(s), None) => out.push(DiffEntry {
                        path: child_path,
                        op: DiffOp::Delete,
                        old_value: Some(s.clone()),
                        new_value: None,
                    }),
                    (None, Some(t)) => out.push(DiffEntry {
                        path: child_path,
                        op: DiffOp::Create,
                        old_value: None,
                        new_value: Some(t.clone()),
                    }),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(src_arr), Value::Array(tgt_arr)) => {
            let max_len = src_arr.len().max(tgt_arr.len());
            for i in 0..max_len {
                let child_path = format!("{path}[{i}]");
                match (src_arr.get(i), tgt_arr.get(i)) {
                    (Some(s), Some(t)) => diff_at(&child_path, s, t, opts, depth + 1, out),
                    (Some(s), None) => out.push(DiffEntry {
                        path: child_path,
                        op: DiffOp::Delete,
                        old_value: Some(s.clone()),
                        new_value: None,
                    }),
                    (None, Some(t)) => out.push(DiffEntry {
                        path: child_path,
                        op: DiffOp::Create,
                        old_value: None,
                        new_value: Some(t.clone()),
                    }),
                    (None, None) => {}
                }
            }
        }
        _ => {
            if !values_equal(source, target) {
                out.push(DiffEntry {
                    path: path.to_string(),
                    op: DiffOp::Update,
                    old_value: Some(source.clone()),
                    new_value: Some(target.clone()),
                });
            }
        }
    }
}

/// Epoch-based comparison for RFC-3339 date strings; falls back to structural
/// equality otherwise.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(a_str), Some(b_str)) = (a.as_str(), b.as_str()) {
        if let (Ok(da), Ok(db)) = (
            chrono::DateTime::parse_from_rfc3339(a_str),
            chrono::DateTime::parse_from_rfc3339(b_str),
        ) {
            return da == db;
        }
    }
    a == b
}

/// A single dotted-path segment, either an object key or an array index.
enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment<'_>> {
    let stripped = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    let mut segments = Vec::new();
    for part in stripped.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut remainder = part;
        if let Some(bracket) = remainder.find('[') {
            let key = &remainder[..bracket];
            if !key.is_empty() {
                segments.push(PathSegment::Key(key));
            }
            remainder = &remainder[bracket..];
            while let Some(close) = remainder.find(']') {
                if let Ok(idx) = remainder[1..close].parse::<usize>() {
                    segments.push(PathSegment::Index(idx));
                }
                remainder = &remainder[close + 1..];
            }
        } else {
            segments.push(PathSegment::Key(remainder));
        }
    }
    segments
}

/// The last path segment's array index, if any, e.g. `"$.d[2]" -> Some(2)`.
/// Used to order same-priority array deletes so earlier removals don't shift
/// indices a later entry still needs to address.
fn trailing_index(path: &str) -> Option<usize> {
    match parse_path(path).last()? {
        PathSegment::Index(idx) => Some(*idx),
        PathSegment::Key(_) => None,
    }
}

/// Applies `entries` (sorted `delete < update < move < create`) to a deep
/// clone of `source`. Among deletes, array-index entries are additionally
/// ordered highest-index-first so `arr.remove` calls against the same array
/// never shift an index a later entry still needs.
pub fn apply(source: &Value, entries: &[DiffEntry]) -> Value {
    let mut result = source.clone();
    let mut sorted: Vec<&DiffEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        a.op.priority().cmp(&b.op.priority()).then_with(|| {
            if a.op == DiffOp::Delete {
                trailing_index(&b.path).cmp(&trailing_index(&a.path))
            } else {
                std::cmp::Ordering::Equal
            }
        })
    });

    for entry in sorted {
        let segments = parse_path(&entry.path);
        apply_entry(&mut result, &segments, entry);
    }
    result
}

fn apply_entry(root: &mut Value, segments: &[PathSegment<'_>], entry: &DiffEntry) {
    let Some((last, prefix)) = segments.split_last() else {
        return;
    };
    let mut cursor = root;
    for segment in prefix {
        cursor = match segment {
            PathSegment::Key(key) => {
                if !cursor.is_object() {
                    *cursor = Value::Object(Default::default());
                }
                cursor
                    .as_object_mut()
                    .expect("just coerced to an object above")
                    .entry((*key).to_string())
                    .or_insert(Value::Null)
            }
            PathSegment::Index(idx) => {
                if !cursor.is_array() {
                    *cursor = Value::Array(Default::default());
                }
                let arr = cursor.as_array_mut().expect("just coerced to an array above");
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                &mut arr[*idx]
            }
        };
    }

    match last {
        PathSegment::Key(key) => {
            if !cursor.is_object() {
                *cursor = Value::Object(Default::default());
            }
            let obj = cursor.as_object_mut().expect("just coerced to an object above");
            match entry.op {
                DiffOp::Delete => {
                    obj.remove(*key);
                }
                _ => {
                    if let Some(v) = &entry.new_value {
                        obj.insert((*key).to_string(), v.clone());
                    }
                }
            }
        }
        PathSegment::Index(idx) => {
            if !cursor.is_array() {
                *cursor = Value::Array(Default::default());
            }
            let arr = cursor.as_array_mut().expect("just coerced to an array above");
            match entry.op {
                DiffOp::Delete => {
                    if *idx < arr.len() {
                        arr.remove(*idx);
                    }
                }
                _ => {
                    while arr.len() <= *idx {
                        arr.push(Value::Null);
                    }
                    if let Some(v) = &entry.new_value {
                        arr[*idx] = v.clone();
                    }
                }
            }
        }
    }
}

/// Counts by operation; complexity banded by total change count
/// (`<=20 low, <=100 medium, else high`).
pub fn summarize(entries: &[DiffEntry]) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for entry in entries {
        match entry.op {
            DiffOp::Create => summary.creates += 1,
            DiffOp::Update => summary.updates += 1,
            DiffOp::Delete => summary.deletes += 1,
            DiffOp::Move => summary.moves += 1,
        }
    }
    let total = entries.len();
    summary.complexity = if total <= 20 {
        Complexity::Low
    } else if total <= 100 {
        Complexity::Medium
    } else {
        Complexity::High
    };
    summary
}

/// Structural equality allowing per-type overrides keyed by a `"type"` tag
/// present on both sides, or `"*"` for a blanket override.
pub fn deep_equals(a: &Value, b: &Value, comparators: &HashMap<String, Comparator>) -> bool {
    if let Some(cmp) = comparators.get("*") {
        return cmp(a, b);
    }
    if let (Some(ta), Some(tb)) = (type_tag(a), type_tag(b)) {
        if ta == tb {
            if let Some(cmp) = comparators.get(ta) {
                return cmp(a, b);
            }
        }
    }
    values_equal(a, b)
}

fn type_tag(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn apply_diff_reconstructs_target() {
        let source = json!({"a": 1, "b": {"c": 2}, "d": [1, 2, 3]});
        let target = json!({"a": 1, "b": {"c": 3}, "d": [1, 2], "e": "new"});
        let entries = diff(&source, &target, &DiffOptions::default());
        let result = apply(&source, &entries);
        assert_eq!(result, target);
    }

    #[test]
    fn apply_shrinking_array_by_more_than_one_element_reconstructs_target() {
        let source = json!({"d": [1, 2, 3, 4]});
        let target = json!({"d": [1]});
        let entries = diff(&source, &target, &DiffOptions::default());
        let result = apply(&source, &entries);
        assert_eq!(result, target);
    }

    #[test]
    fn diff_of_identical_values_is_empty() {
        let value = json!({"a": 1, "nested": {"b": [1, 2, 3]}});
        assert!(diff(&value, &value, &DiffOptions::default()).is_empty());
    }

    #[test]
    fn summarize_bands_complexity() {
        let entries: Vec<DiffEntry> = (0..25)
            .map(|i| DiffEntry {
                path: format!("$.k{i}"),
                op: DiffOp::Create,
                old_value: None,
                new_value: Some(json!(i)),
            })
            .collect();
        assert_eq!(summarize(&entries).complexity, Complexity::Medium);
    }

    #[test]
    fn ignore_properties_are_skipped() {
        let source = json!({"__version": 1, "value": 1});
        let target = json!({"__version": 2, "value": 1});
        assert!(diff(&source, &target, &DiffOptions::default()).is_empty());
    }

    fn arb_flat_object() -> impl Strategy<Value = Value> {
        prop::collection::hash_map("[a-c]", any::<i32>(), 0..4)
            .prop_map(|m| json!(m.into_iter().collect::<std::collections::BTreeMap<_, _>>()))
    }

    proptest! {
        #[test]
        fn apply_of_diff_round_trips(source in arb_flat_object(), target in arb_flat_object()) {
            let entries = diff(&source, &target, &DiffOptions::default());
            let result = apply(&source, &entries);
            prop_assert_eq!(result, target);
        }

        #[test]
        fn diff_is_idempotent_against_self(value in arb_flat_object()) {
            prop_assert!(diff(&value, &value, &DiffOptions::default()).is_empty());
        }
    }
}
