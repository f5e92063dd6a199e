/*
    resolver.rs - ConflictResolver

    Detects divergent writes to the same session and settles them with a
    strategy. Detection never fails: a pair that cannot conflict yields
    `None`.

    Rules:
    - different sessions never conflict
    - two deletes never conflict
    - identical writes are not divergent
    - at most one open conflict per (session, operation); detecting again
      while it is open returns the open one
    - low severity, or update/update above the merge threshold, is resolved
      on the spot
    - resolving again with the same strategy keeps the existing resolution;
      a different strategy replaces it
*/

use super::conflict::{
    merge_values, similarity, Conflict, ConflictSeverity, ConflictType, Resolution, ResolutionStrategy,
};
use crate::core_queue::Operation;
use crate::metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStatistics {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_type: BTreeMap<ConflictType, usize>,
    pub by_severity: BTreeMap<ConflictSeverity, usize>,
    pub by_strategy: BTreeMap<ResolutionStrategy, usize>,
}

pub struct ConflictResolver {
    conflicts: HashMap<String, Conflict>,
    /// (session id, operation id) -> open conflict id
    open: HashMap<(String, String), String>,
    merge_threshold: f64,
}

impl ConflictResolver {
    /// # Arguments
    /// * `merge_threshold` - similarity above which update/update conflicts auto-resolve
    pub fn new(merge_threshold: f64) -> Self {
        Self { conflicts: HashMap::new(), open: HashMap::new(), merge_threshold }
    }

    pub fn detect_conflict(&mut self, local: &Operation, remote: &Operation) -> Option<Conflict> {
        if local.session_id != remote.session_id {
            return None;
        }
        let conflict_type = ConflictType::classify(local, remote)?;
        if local.op_type == remote.op_type && local.data == remote.data {
            return None;
        }

        let key = (local.session_id.clone(), local.id.clone());
        if let Some(existing) = self.open.get(&key).and_then(|id| self.conflicts.get(id)) {
            debug!(conflict_id = %existing.id, operation_id = %local.id, "Conflict already open");
            return Some(existing.clone());
        }

        let score = similarity(&local.data, &remote.data);
        let severity = if conflict_type.involves_delete() {
            ConflictSeverity::High
        } else {
            ConflictSeverity::from_similarity(score)
        };

        let conflict = Conflict {
            id: format!("conflict-{}", uuid::Uuid::new_v4()),
            operation_id: local.id.clone(),
            session_id: local.session_id.clone(),
            local_data: local.data.clone(),
            remote_data: remote.data.clone(),
            conflict_type,
            severity,
            similarity: score,
            detected_at: Utc::now(),
            resolution: None,
        };
        ::metrics::counter!(metrics::CONFLICTS_DETECTED).increment(1);
        info!(
            conflict_id = %conflict.id,
            operation_id = %conflict.operation_id,
            kind = %conflict_type,
            severity = severity.as_str(),
            "Conflict detected"
        );

        let id = conflict.id.clone();
        let auto = severity == ConflictSeverity::Low
            || (conflict_type == ConflictType::UpdateUpdate && score > self.merge_threshold);
        self.conflicts.insert(id.clone(), conflict);

        if auto {
            let strategy = if local.data.is_object() && remote.data.is_object() {
                ResolutionStrategy::Merge
            } else {
                ResolutionStrategy::LastModified
            };
            self.apply_resolution(&id, strategy, None, true);
        } else {
            self.open.insert(key, id.clone());
        }
        self.conflicts.get(&id).cloned()
    }

    /// Settle a conflict
    ///
    /// An automatic resolution, or one made with another strategy, is
    /// replaced. Repeating the strategy already applied returns it unchanged.
    ///
    /// # Returns
    /// The resolution, or `None` for an unknown id or a manual resolution
    /// without data.
    pub fn resolve_conflict(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_data: Option<Value>,
    ) -> Option<Resolution> {
        self.apply_resolution(id, strategy, resolved_data, false)
    }

    fn apply_resolution(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_data: Option<Value>,
        automatic: bool,
    ) -> Option<Resolution> {
        let conflict = self.conflicts.get_mut(id)?;
        if let Some(existing) = conflict.resolution.as_ref().filter(|r| r.strategy == strategy || automatic) {
            return Some(existing.clone());
        }

        let data = match strategy {
            ResolutionStrategy::LocalWins | ResolutionStrategy::LastModified => conflict.local_data.clone(),
            ResolutionStrategy::RemoteWins => conflict.remote_data.clone(),
            ResolutionStrategy::Merge => merge_values(&conflict.local_data, &conflict.remote_data),
            ResolutionStrategy::Manual => resolved_data?,
        };

        let resolution = Resolution { strategy, resolved_data: data, resolved_at: Utc::now(), automatic };
        conflict.resolution = Some(resolution.clone());
        self.open.remove(&(conflict.session_id.clone(), conflict.operation_id.clone()));

        ::metrics::counter!(metrics::CONFLICTS_RESOLVED).increment(1);
        debug!(conflict_id = %id, strategy = %strategy, automatic, "Conflict resolved");
        Some(resolution)
    }

    pub fn get_conflict(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    /// Open conflict for an operation, if any
    pub fn open_conflict_for(&self, session_id: &str, operation_id: &str) -> Option<&Conflict> {
        self.open
            .get(&(session_id.to_string(), operation_id.to_string()))
            .and_then(|id| self.conflicts.get(id))
    }

    /// Unresolved conflicts, oldest first
    pub fn get_unresolved_conflicts(&self) -> Vec<Conflict> {
        let mut open: Vec<Conflict> = self.conflicts.values().filter(|c| !c.is_resolved()).cloned().collect();
        open.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then_with(|| a.id.cmp(&b.id)));
        open
    }

    pub fn get_statistics(&self) -> ConflictStatistics {
        let mut stats = ConflictStatistics { total: self.conflicts.len(), ..Default::default() };
        for conflict in self.conflicts.values() {
            *stats.by_type.entry(conflict.conflict_type).or_default() += 1;
            *stats.by_severity.entry(conflict.severity).or_default() += 1;
            match &conflict.resolution {
                Some(resolution) => {
                    stats.resolved += 1;
                    *stats.by_strategy.entry(resolution.strategy).or_default() += 1;
                }
                None => stats.unresolved += 1,
            }
        }
        stats
    }

    /// Forget resolved conflicts
    ///
    /// # Returns
    /// How many were removed.
    pub fn clear_resolved(&mut self) -> usize {
        let before = self.conflicts.len();
        self.conflicts.retain(|_, c| !c.is_resolved());
        before - self.conflicts.len()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(0.7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_queue::OperationPriority;
    use serde_json::json;

    fn op(id: &str, op_type: &str, session: &str, data: Value) -> Operation {
        Operation::new(op_type, session, data, OperationPriority::Normal, 3).with_id(id)
    }

    fn divergent() -> (Operation, Operation) {
        (
            op("doc-1", "update", "s1", json!({"title": "Quarterly plan", "tags": ["a"]})),
            op("doc-1", "update", "s1", json!({"summary": 12345, "owner": null})),
        )
    }

    #[test]
    fn test_no_conflict_across_sessions_or_double_delete() {
        let mut resolver = ConflictResolver::default();
        let a = op("x", "update", "s1", json!({"v": 1}));
        let b = op("x", "update", "s2", json!({"v": 2}));
        assert!(resolver.detect_conflict(&a, &b).is_none());

        let d1 = op("x", "delete", "s1", Value::Null);
        let d2 = op("x", "delete", "s1", json!({"reason": "cleanup"}));
        assert!(resolver.detect_conflict(&d1, &d2).is_none());
        assert_eq!(resolver.get_statistics().total, 0);
    }

    #[test]
    fn test_conflicting_title_edits_remote_wins() {
        let mut resolver = ConflictResolver::default();
        let local = op("doc-1", "update", "s1", json!({"field": "title", "value": "A"}));
        let remote = op("doc-1", "update", "s1", json!({"field": "title", "value": "B"}));

        let conflict = resolver.detect_conflict(&local, &remote).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::UpdateUpdate);
        assert_eq!(conflict.severity, ConflictSeverity::Low);
        let auto = conflict.resolution.unwrap();
        assert!(auto.automatic);
        assert_eq!(auto.strategy, ResolutionStrategy::Merge);
        assert_eq!(auto.resolved_data["value"], "A");

        let resolution = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::RemoteWins, None).unwrap();
        assert!(!resolution.automatic);
        assert_eq!(resolution.resolved_data["value"], "B");
        assert_eq!(
            resolver.get_conflict(&conflict.id).unwrap().resolution.as_ref().unwrap().resolved_data,
            json!({"field": "title", "value": "B"})
        );
    }

    #[test]
    fn test_delete_update_is_high_and_stays_open() {
        let mut resolver = ConflictResolver::default();
        let local = op("doc-1", "delete", "s1", Value::Null);
        let remote = op("doc-1", "update", "s1", json!({"title": "B"}));

        let conflict = resolver.detect_conflict(&local, &remote).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeleteUpdate);
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert!(!conflict.is_resolved());
        assert_eq!(resolver.get_unresolved_conflicts().len(), 1);
    }

    #[test]
    fn test_one_open_conflict_per_operation() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = divergent();
        let first = resolver.detect_conflict(&local, &remote).unwrap();
        assert!(!first.is_resolved());

        let again = op("doc-1", "update", "s1", json!({"completely": "different"}));
        let second = resolver.detect_conflict(&local, &again).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(resolver.get_statistics().total, 1);

        resolver.resolve_conflict(&first.id, ResolutionStrategy::RemoteWins, None).unwrap();
        let third = resolver.detect_conflict(&local, &again).unwrap();
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn test_strategies() {
        let (local, remote) = divergent();
        let cases = [
            (ResolutionStrategy::LocalWins, local.data.clone()),
            (ResolutionStrategy::RemoteWins, remote.data.clone()),
            (ResolutionStrategy::LastModified, local.data.clone()),
            (
                ResolutionStrategy::Merge,
                json!({"title": "Quarterly plan", "tags": ["a"], "summary": 12345, "owner": null}),
            ),
        ];
        for (strategy, expected) in cases {
            let mut resolver = ConflictResolver::default();
            let conflict = resolver.detect_conflict(&local, &remote).unwrap();
            let resolution = resolver.resolve_conflict(&conflict.id, strategy, None).unwrap();
            assert_eq!(resolution.resolved_data, expected, "{}", strategy);
            assert!(!resolution.automatic);
        }
    }

    #[test]
    fn test_last_modified_ignores_timestamps() {
        let mut resolver = ConflictResolver::default();
        let (local, mut remote) = divergent();
        remote.updated_at = local.updated_at + chrono::Duration::hours(1);
        let conflict = resolver.detect_conflict(&local, &remote).unwrap();
        let resolution = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::LastModified, None).unwrap();
        assert_eq!(resolution.resolved_data, local.data);
    }

    #[test]
    fn test_manual_requires_data() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = divergent();
        let conflict = resolver.detect_conflict(&local, &remote).unwrap();

        assert!(resolver.resolve_conflict(&conflict.id, ResolutionStrategy::Manual, None).is_none());
        assert!(!resolver.get_conflict(&conflict.id).unwrap().is_resolved());

        let chosen = json!({"title": "Agreed"});
        let resolution = resolver
            .resolve_conflict(&conflict.id, ResolutionStrategy::Manual, Some(chosen.clone()))
            .unwrap();
        assert_eq!(resolution.resolved_data, chosen);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = divergent();
        let conflict = resolver.detect_conflict(&local, &remote).unwrap();

        let first = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::RemoteWins, None).unwrap();
        let second = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::RemoteWins, None).unwrap();
        assert_eq!(first, second);
        assert!(resolver.resolve_conflict("missing", ResolutionStrategy::LocalWins, None).is_none());
    }

    #[test]
    fn test_different_strategy_replaces_resolution() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = divergent();
        let conflict = resolver.detect_conflict(&local, &remote).unwrap();

        let first = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::RemoteWins, None).unwrap();
        assert_eq!(first.resolved_data, remote.data);
        let second = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::LocalWins, None).unwrap();
        assert_eq!(second.strategy, ResolutionStrategy::LocalWins);
        assert_eq!(second.resolved_data, local.data);

        // Same strategy again is a no-op
        let again = resolver.resolve_conflict(&conflict.id, ResolutionStrategy::LocalWins, None).unwrap();
        assert_eq!(again, second);
        let stats = resolver.get_statistics();
        assert_eq!((stats.resolved, stats.by_strategy.get(&ResolutionStrategy::RemoteWins)), (1, None));
    }

    #[test]
    fn test_statistics_and_clear() {
        let mut resolver = ConflictResolver::default();
        let (local, remote) = divergent();
        let open = resolver.detect_conflict(&local, &remote).unwrap();
        resolver.detect_conflict(
            &op("doc-2", "update", "s1", json!({"title": "A"})),
            &op("doc-2", "update", "s1", json!({"title": "B"})),
        );

        let stats = resolver.get_statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.by_type[&ConflictType::UpdateUpdate], 2);
        assert_eq!(stats.by_strategy[&ResolutionStrategy::Merge], 1);

        assert_eq!(resolver.clear_resolved(), 1);
        assert!(resolver.get_conflict(&open.id).is_some());
    }
}
