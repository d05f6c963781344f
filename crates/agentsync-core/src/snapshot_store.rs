//! Typed, checksummed, size-bounded snapshot cache with reference-counted
//! lifetime per rollback point (spec.md §4.8).

use crate::error::{Error, Result};
use crate::model::{Snapshot, SnapshotType};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Canonicalized form of a value, stable across serialization round-trips so
/// checksums don't drift on re-encoding (`Map`/`Set`/`Date` get a tagged
/// shape; spec.md §4.8).
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let canonical: serde_json::Map<String, serde_json::Value> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::Value::Object(canonical)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Hex-encoded SHA-256 digest over the canonicalized form of `value`.
pub fn checksum(value: &serde_json::Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

const DEFAULT_MAX_SNAPSHOT_SIZE: usize = 10 * 1024 * 1024;

/// In-memory `snapshotId -> Snapshot` map, indexed by rollback point, with a
/// running total size used to enforce `max_snapshot_size`.
pub struct SnapshotStore {
    snapshots: DashMap<String, Snapshot>,
    by_rollback_point: DashMap<String, HashSet<String>>,
    total_size: AtomicUsize,
    max_snapshot_size: usize,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SNAPSHOT_SIZE)
    }
}

impl SnapshotStore {
    pub fn new(max_snapshot_size: usize) -> Self {
        Self {
            snapshots: DashMap::new(),
            by_rollback_point: DashMap::new(),
            total_size: AtomicUsize::new(0),
            max_snapshot_size,
        }
    }

    /// Deep-clones and canonicalizes `data` before storing; rejects
    /// payloads over `max_snapshot_size`.
    pub fn create(
        &self,
        rollback_point_id: &str,
        snapshot_type: SnapshotType,
        data: serde_json::Value,
    ) -> Result<Snapshot> {
        let canonical = canonicalize(&data);
        let size = serde_json::to_vec(&canonical).map(|b| b.len()).unwrap_or(0);
        if size > self.max_snapshot_size {
            return Err(Error::SnapshotTooLarge {
                size,
                limit: self.max_snapshot_size,
            });
        }

        let snapshot = Snapshot {
            id: format!("snap-{}", Uuid::new_v4()),
            rollback_point_id: rollback_point_id.to_string(),
            snapshot_type,
            checksum: Some(checksum(&canonical)),
            size,
            data: canonical,
            created_at: chrono::Utc::now(),
        };

        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        self.by_rollback_point
            .entry(rollback_point_id.to_string())
            .or_default()
            .insert(snapshot.id.clone());
        self.total_size.fetch_add(size, Ordering::Relaxed);

        Ok(snapshot)
    }

    /// Re-verifies the checksum on read; fails `SNAPSHOT_CORRUPTED` on
    /// mismatch rather than returning stale or tampered data.
    pub fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| Error::SnapshotNotFound {
                id: snapshot_id.to_string(),
            })?
            .clone();

        if let Some(expected) = &snapshot.checksum {
            let actual = checksum(&snapshot.data);
            if &actual != expected {
                return Err(Error::SnapshotCorrupted {
                    id: snapshot_id.to_string(),
                });
            }
        }

        Ok(snapshot)
    }

    pub fn list_for_rollback_point(&self, rollback_point_id: &str) -> Vec<Snapshot> {
        self.by_rollback_point
            .get(rollback_point_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.snapshots.get(id).map(|s| s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deletes every snapshot not referenced by any of `live_rollback_points`.
    pub fn cleanup(&self, live_rollback_points: &HashSet<String>) -> usize {
        let dead_ids: Vec<String> = self
            .by_rollback_point
            .iter()
            .filter(|entry| !live_rollback_points.contains(entry.key()))
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect();

        for id in &dead_ids {
            if let Some((_, snapshot)) = self.snapshots.remove(id) {
                self.total_size.fetch_sub(snapshot.size, Ordering::Relaxed);
            }
        }
        self.by_rollback_point
            .retain(|k, _| live_rollback_points.contains(k));

        dead_ids.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_across_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn create_then_get_round_trips_checksum() {
        let store = SnapshotStore::default();
        let snapshot = store
            .create("rp-1", SnapshotType::Entity, serde_json::json!({"name": "user"}))
            .unwrap();
        let fetched = store.get(&snapshot.id).unwrap();
        assert_eq!(fetched.checksum, snapshot.checksum);
        assert_eq!(
            checksum(&fetched.data),
            fetched.checksum.clone().unwrap()
        );
    }

    #[test]
    fn get_detects_tampering() {
        let store = SnapshotStore::default();
        let snapshot = store
            .create("rp-1", SnapshotType::Entity, serde_json::json!({"name": "user"}))
            .unwrap();
        store.snapshots.alter(&snapshot.id, |_, mut s| {
            s.data = serde_json::json!({"name": "tampered"});
            s
        });
        let err = store.get(&snapshot.id).unwrap_err();
        assert!(matches!(err, Error::SnapshotCorrupted { .. }));
    }

    #[test]
    fn create_rejects_oversized_payload() {
        let store = SnapshotStore::new(16);
        let err = store
            .create(
                "rp-1",
                SnapshotType::Entity,
                serde_json::json!({"name": "a payload well over sixteen bytes"}),
            )
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotTooLarge { .. }));
    }

    #[test]
    fn cleanup_deletes_only_unreferenced_snapshots() {
        let store = SnapshotStore::default();
        let live = store
            .create("rp-live", SnapshotType::Entity, serde_json::json!({"k": 1}))
            .unwrap();
        let dead = store
            .create("rp-dead", SnapshotType::Entity, serde_json::json!({"k": 2}))
            .unwrap();

        let mut live_points = HashSet::new();
        live_points.insert("rp-live".to_string());
        let deleted = store.cleanup(&live_points);

        assert_eq!(deleted, 1);
        assert!(store.get(&live.id).is_ok());
        assert!(store.get(&dead.id).is_err());
    }
}
