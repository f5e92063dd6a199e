//! Field-level delta encoding of queued operations
//!
//! The first time an operation id is seen it travels in full. Later
//! observations carry only added or changed fields, plus deleted fields as
//! `null` (also listed in `deleted_fields` so a real `null` value survives
//! reconstruction). A delta whose serialized size exceeds the threshold is
//! promoted back to a full snapshot.

use crate::core_queue::Operation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaType {
    Full,
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub session_id: String,
    pub delta_type: DeltaType,
    /// Complete data, set for `Full`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Changed fields, set for `Delta`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_fields: Vec<String>,
    pub full_size: usize,
    pub delta_size: usize,
}

impl DeltaOperation {
    /// Full snapshot of an operation, bypassing any history
    pub fn full(op: &Operation) -> Self {
        let full_size = json_len(&op.data);
        Self {
            id: op.id.clone(),
            op_type: op.op_type.clone(),
            session_id: op.session_id.clone(),
            delta_type: DeltaType::Full,
            data: Some(op.data.clone()),
            changes: None,
            deleted_fields: Vec::new(),
            full_size,
            delta_size: full_size,
        }
    }

    /// Bytes saved versus sending the full data
    pub fn savings(&self) -> usize {
        self.full_size.saturating_sub(self.delta_size)
    }
}

/// Data rebuilt from a delta
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedOperation {
    pub id: String,
    pub data: Value,
    /// Set when only the partial changes could be returned
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaStats {
    pub total_operations: u64,
    pub full_operations: u64,
    pub delta_operations: u64,
    pub total_full_bytes: u64,
    pub total_sent_bytes: u64,
}

impl DeltaStats {
    /// Percentage of bytes saved, 0.0..=100.0
    pub fn savings_percent(&self) -> f64 {
        if self.total_full_bytes == 0 {
            return 0.0;
        }
        let saved = self.total_full_bytes.saturating_sub(self.total_sent_bytes);
        saved as f64 / self.total_full_bytes as f64 * 100.0
    }
}

pub struct DeltaSyncOptimizer {
    full_operation_threshold: usize,
    /// Last known full data per operation id
    snapshots: HashMap<String, Value>,
    stats: DeltaStats,
}

fn json_len(value: &impl Serialize) -> usize {
    serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0)
}

impl DeltaSyncOptimizer {
    pub fn new(full_operation_threshold: usize) -> Self {
        Self { full_operation_threshold, snapshots: HashMap::new(), stats: DeltaStats::default() }
    }

    pub fn compute_delta(&mut self, op: &Operation) -> DeltaOperation {
        let full_size = json_len(&op.data);
        let previous = self.snapshots.insert(op.id.clone(), op.data.clone());

        let diff = match (previous, &op.data) {
            (Some(Value::Object(before)), Value::Object(after)) => Some(diff_objects(&before, after)),
            _ => None,
        };

        let delta = diff.and_then(|(changes, deleted)| {
            let delta_size = json_len(&changes);
            (delta_size <= self.full_operation_threshold).then_some((changes, deleted, delta_size))
        });

        self.stats.total_operations += 1;
        self.stats.total_full_bytes += full_size as u64;

        let result = match delta {
            Some((changes, deleted_fields, delta_size)) => {
                self.stats.delta_operations += 1;
                DeltaOperation {
                    id: op.id.clone(),
                    op_type: op.op_type.clone(),
                    session_id: op.session_id.clone(),
                    delta_type: DeltaType::Delta,
                    data: None,
                    changes: Some(changes),
                    deleted_fields,
                    full_size,
                    delta_size,
                }
            }
            None => {
                self.stats.full_operations += 1;
                DeltaOperation::full(op)
            }
        };
        self.stats.total_sent_bytes += result.delta_size as u64;
        result
    }

    pub fn compute_batch(&mut self, ops: &[Operation]) -> Vec<DeltaOperation> {
        ops.iter().map(|op| self.compute_delta(op)).collect()
    }

    /// Rebuild the current data of a received delta
    ///
    /// Merges `changes` onto the last known snapshot. With no snapshot the
    /// partial changes are returned as-is and a warning is attached.
    pub fn decompress_delta(&mut self, delta: &DeltaOperation) -> ReconstructedOperation {
        let (data, warning) = match (delta.delta_type, &delta.data, &delta.changes) {
            (DeltaType::Full, Some(data), _) => (data.clone(), None),
            (DeltaType::Delta, _, Some(changes)) => match self.snapshots.get(&delta.id) {
                Some(Value::Object(base)) => {
                    let mut merged = base.clone();
                    for (key, value) in changes {
                        if delta.deleted_fields.contains(key) {
                            merged.remove(key);
                        } else {
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                    (Value::Object(merged), None)
                }
                _ => {
                    let message = format!("no snapshot for operation {}, using partial changes", delta.id);
                    warn!(id = %delta.id, "Reconstructing delta without a snapshot");
                    (Value::Object(changes.clone()), Some(message))
                }
            },
            _ => {
                let message = format!("delta for {} carries no payload", delta.id);
                warn!(id = %delta.id, "Delta carries no payload");
                (Value::Null, Some(message))
            }
        };

        if warning.is_none() {
            self.snapshots.insert(delta.id.clone(), data.clone());
        }
        ReconstructedOperation { id: delta.id.clone(), data, warning }
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn forget(&mut self, id: &str) {
        self.snapshots.remove(id);
    }

    pub fn clear_history(&mut self) {
        self.snapshots.clear();
    }

    pub fn stats(&self) -> DeltaStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DeltaStats::default();
    }
}

impl Default for DeltaSyncOptimizer {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn diff_objects(before: &Map<String, Value>, after: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut changes = Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }

    let mut deleted = Vec::new();
    for key in before.keys().filter(|k| !after.contains_key(*k)) {
        changes.insert(key.clone(), Value::Null);
        deleted.push(key.clone());
    }
    (changes, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_queue::OperationPriority;
    use serde_json::json;

    fn op(id: &str, data: Value) -> Operation {
        Operation::new("update", "s1", data, OperationPriority::Normal, 3).with_id(id)
    }

    #[test]
    fn test_first_observation_is_full() {
        let mut optimizer = DeltaSyncOptimizer::default();
        let delta = optimizer.compute_delta(&op("a", json!({"title": "A"})));
        assert_eq!(delta.delta_type, DeltaType::Full);
        assert_eq!(delta.data, Some(json!({"title": "A"})));
    }

    #[test]
    fn test_field_diff_with_deletions() {
        let mut optimizer = DeltaSyncOptimizer::default();
        optimizer.compute_delta(&op("a", json!({"title": "A", "body": "x", "tags": [1]})));
        let delta = optimizer.compute_delta(&op("a", json!({"title": "B", "body": "x", "pinned": true})));

        assert_eq!(delta.delta_type, DeltaType::Delta);
        assert_eq!(delta.changes, Some(json!({"title": "B", "pinned": true, "tags": null}).as_object().unwrap().clone()));
        assert_eq!(delta.deleted_fields, vec!["tags".to_string()]);
        assert!(delta.delta_size < delta.full_size);
    }

    #[test]
    fn test_large_delta_promoted_to_full() {
        let mut optimizer = DeltaSyncOptimizer::new(16);
        optimizer.compute_delta(&op("a", json!({"body": "short"})));
        let delta = optimizer.compute_delta(&op("a", json!({"body": "a much longer body than sixteen bytes"})));
        assert_eq!(delta.delta_type, DeltaType::Full);
    }

    #[test]
    fn test_reconstruct_onto_snapshot() {
        let mut sender = DeltaSyncOptimizer::default();
        let mut receiver = DeltaSyncOptimizer::default();

        let v1 = json!({"title": "A", "note": null, "gone": 1});
        let v2 = json!({"title": "B", "note": null});

        let first = sender.compute_delta(&op("a", v1.clone()));
        assert_eq!(receiver.decompress_delta(&first).data, v1);

        let second = sender.compute_delta(&op("a", v2.clone()));
        let rebuilt = receiver.decompress_delta(&second);
        assert_eq!(rebuilt.data, v2);
        assert!(rebuilt.warning.is_none());
    }

    #[test]
    fn test_reconstruct_without_snapshot_is_partial() {
        let mut sender = DeltaSyncOptimizer::default();
        sender.compute_delta(&op("a", json!({"title": "A", "body": "x"})));
        let delta = sender.compute_delta(&op("a", json!({"title": "B", "body": "x"})));

        let mut receiver = DeltaSyncOptimizer::default();
        let rebuilt = receiver.decompress_delta(&delta);
        assert_eq!(rebuilt.data, json!({"title": "B"}));
        assert!(rebuilt.warning.is_some());
        assert!(!receiver.has_snapshot("a"));
    }

    #[test]
    fn test_non_object_data_is_always_full() {
        let mut optimizer = DeltaSyncOptimizer::default();
        optimizer.compute_delta(&op("a", json!([1, 2])));
        assert_eq!(optimizer.compute_delta(&op("a", json!([1, 2, 3]))).delta_type, DeltaType::Full);
    }

    #[test]
    fn test_stats() {
        let mut optimizer = DeltaSyncOptimizer::default();
        let body = "x".repeat(200);
        optimizer.compute_delta(&op("a", json!({"body": body, "n": 1})));
        optimizer.compute_delta(&op("a", json!({"body": body, "n": 2})));

        let stats = optimizer.stats();
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.full_operations, 1);
        assert_eq!(stats.delta_operations, 1);
        assert!(stats.savings_percent() > 40.0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::core_queue::OperationPriority;
    use proptest::prelude::*;

    fn document() -> impl Strategy<Value = Value> {
        let field = prop_oneof![any::<i64>().prop_map(Value::from), "[a-z]{0,12}".prop_map(Value::from)];
        prop::collection::btree_map("[a-e]", field, 0..5).prop_map(|fields| Value::Object(fields.into_iter().collect()))
    }

    // Property: a receiver that saw every earlier edit rebuilds each edit exactly
    proptest! {
        #[test]
        fn prop_receiver_tracks_sender(edits in prop::collection::vec(document(), 1..8), threshold in 0usize..64) {
            let mut sender = DeltaSyncOptimizer::new(threshold);
            let mut receiver = DeltaSyncOptimizer::new(threshold);

            for data in edits {
                let op = Operation::new("update", "s1", data.clone(), OperationPriority::Normal, 3).with_id("doc");
                let delta = sender.compute_delta(&op);
                let rebuilt = receiver.decompress_delta(&delta);
                prop_assert!(rebuilt.warning.is_none());
                prop_assert_eq!(rebuilt.data, data);
            }
        }
    }
}
