//! Migration execution with rollback
//!
//! A migration transforms a JSON document from one schema version to the
//! next. `up` is required, `down` is optional; without `down` a migration
//! cannot be rolled back. Every attempt, successful or not, lands in the
//! engine's `MigrationTracker` with a before/after snapshot of the data.

use super::schema::SemVer;
use super::tracker::{DataSnapshot, MigrationDirection, MigrationRecord, MigrationStatus, MigrationTracker};
use crate::core_conflict::content_hash;
use crate::errors::{SyncError, SyncResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

/// Error a migration step may return
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// One direction of a migration
pub type MigrationStep = Box<dyn Fn(Value) -> Result<Value, StepError> + Send + Sync>;

pub struct Migration {
    pub id: String,
    pub from: SemVer,
    pub to: SemVer,
    pub description: String,
    up: MigrationStep,
    down: Option<MigrationStep>,
}

impl Migration {
    pub fn new<F>(id: impl Into<String>, from: SemVer, to: SemVer, up: F) -> Self
    where
        F: Fn(Value) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self { id: id.into(), from, to, description: String::new(), up: Box::new(up), down: None }
    }

    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(Value) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(down));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

/// Items in a document: array length, object field count, 0 for null, else 1
fn item_count(data: &Value) -> usize {
    match data {
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        Value::Null => 0,
        _ => 1,
    }
}

#[derive(Debug, Default)]
pub struct MigrationEngine {
    migrations: BTreeMap<String, Migration>,
    tracker: MigrationTracker,
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracker(tracker: MigrationTracker) -> Self {
        Self { migrations: BTreeMap::new(), tracker }
    }

    pub fn register(&mut self, migration: Migration) -> SyncResult<()> {
        if migration.from == migration.to {
            return Err(SyncError::InvalidState(format!("migration {} does not change the version", migration.id)));
        }
        if self.migrations.contains_key(&migration.id) {
            return Err(SyncError::InvalidState(format!("migration {} already registered", migration.id)));
        }
        self.migrations.insert(migration.id.clone(), migration);
        Ok(())
    }

    pub fn get_migration(&self, id: &str) -> Option<&Migration> {
        self.migrations.get(id)
    }

    pub fn tracker(&self) -> &MigrationTracker {
        &self.tracker
    }

    fn run(&mut self, id: &str, direction: MigrationDirection, data: Value) -> SyncResult<Value> {
        let migration = self.migrations.get(id).ok_or_else(|| SyncError::not_found("migration", id))?;
        let (step, version) = match direction {
            MigrationDirection::Up => (&migration.up, migration.to),
            MigrationDirection::Down => match &migration.down {
                Some(down) => (down, migration.from),
                None => {
                    return Err(SyncError::Migration {
                        migration_id: id.to_string(),
                        reason: "no down migration registered".into(),
                    })
                }
            },
        };

        let before_hash = content_hash(&data);
        let started = Instant::now();
        let outcome = step(data);
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(migrated) => {
                let status = match direction {
                    MigrationDirection::Up => MigrationStatus::Applied,
                    MigrationDirection::Down => MigrationStatus::RolledBack,
                };
                let mut record = MigrationRecord::new(id, version, direction, status);
                record.duration_ms = duration_ms;
                record.items_affected = item_count(&migrated);
                record.snapshot = Some(DataSnapshot {
                    before_hash,
                    after_hash: content_hash(&migrated),
                    item_count: record.items_affected,
                });
                info!(migration_id = %id, direction = ?direction, version = %version, duration_ms, "Migration applied");
                self.tracker.record(record);
                Ok(migrated)
            }
            Err(e) => {
                let reason = e.to_string();
                let mut record = MigrationRecord::new(id, version, direction, MigrationStatus::Failed);
                record.duration_ms = duration_ms;
                record.error = Some(reason.clone());
                warn!(migration_id = %id, direction = ?direction, error = %reason, "Migration failed");
                self.tracker.record(record);
                Err(SyncError::Migration { migration_id: id.to_string(), reason })
            }
        }
    }

    /// Run a migration's `up` step over `data`
    pub fn execute_migration(&mut self, id: &str, data: Value) -> SyncResult<Value> {
        self.run(id, MigrationDirection::Up, data)
    }

    /// Run a migration's `down` step over `data`
    pub fn rollback_migration(&mut self, id: &str, data: Value) -> SyncResult<Value> {
        self.run(id, MigrationDirection::Down, data)
    }

    /// Migrations that walk `from` to `to`, in execution order
    ///
    /// Upgrades pick the registered step that goes furthest without passing
    /// `to`; downgrades walk registered steps backwards the same way.
    pub fn plan(&self, from: SemVer, to: SemVer) -> SyncResult<Vec<String>> {
        let mut plan = Vec::new();
        let mut current = from;
        while current != to {
            let step = if to > current {
                self.migrations
                    .values()
                    .filter(|m| m.from == current && m.to > current && m.to <= to)
                    .max_by_key(|m| m.to)
                    .map(|m| (m.id.clone(), m.to))
            } else {
                self.migrations
                    .values()
                    .filter(|m| m.to == current && m.from < current && m.from >= to)
                    .min_by_key(|m| m.from)
                    .map(|m| (m.id.clone(), m.from))
            };
            let Some((id, next)) = step else {
                return Err(SyncError::NotFound(format!("no migration chain from {} to {}", from, to)));
            };
            plan.push(id);
            current = next;
        }
        Ok(plan)
    }

    /// Move `data` from schema `from` to schema `to`
    ///
    /// Downgrades are refused unless the tracker can vouch for every step
    /// being rolled back.
    pub fn execute_pending(&mut self, from: SemVer, to: SemVer, data: Value) -> SyncResult<Value> {
        let plan = self.plan(from, to)?;
        if to < from && !self.tracker.can_rollback(from, to) {
            return Err(SyncError::InvalidState(format!(
                "cannot roll back from {} to {}: missing snapshots",
                from, to
            )));
        }

        let mut data = data;
        for id in plan {
            data = if to > from { self.execute_migration(&id, data)? } else { self.rollback_migration(&id, data)? };
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(s: &str) -> SemVer {
        s.parse().unwrap()
    }

    fn rename_title() -> Migration {
        Migration::new("rename-title", v("1.0.0"), v("1.1.0"), |mut data| {
            let title = data.as_object_mut().and_then(|o| o.remove("title")).ok_or("document has no title")?;
            data["name"] = title;
            Ok(data)
        })
        .with_down(|mut data| {
            let name = data.as_object_mut().and_then(|o| o.remove("name")).ok_or("document has no name")?;
            data["title"] = name;
            Ok(data)
        })
    }

    fn add_tags() -> Migration {
        Migration::new("add-tags", v("1.1.0"), v("2.0.0"), |mut data| {
            data["tags"] = json!([]);
            Ok(data)
        })
    }

    #[test]
    fn test_execute_records_snapshot() {
        let mut engine = MigrationEngine::new();
        engine.register(rename_title()).unwrap();

        let out = engine.execute_migration("rename-title", json!({"title": "A", "body": "x"})).unwrap();
        assert_eq!(out, json!({"name": "A", "body": "x"}));

        let record = &engine.tracker().get_history()[0];
        assert_eq!(record.status, MigrationStatus::Applied);
        assert_eq!(record.version, v("1.1.0"));
        assert_eq!(record.items_affected, 2);
        let snapshot = record.snapshot.as_ref().unwrap();
        assert_ne!(snapshot.before_hash, snapshot.after_hash);
    }

    #[test]
    fn test_failure_is_recorded_and_wrapped() {
        let mut engine = MigrationEngine::new();
        engine.register(rename_title()).unwrap();

        let err = engine.execute_migration("rename-title", json!({"body": "x"})).unwrap_err();
        match err {
            SyncError::Migration { migration_id, reason } => {
                assert_eq!(migration_id, "rename-title");
                assert!(reason.contains("no title"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        let record = &engine.tracker().get_history()[0];
        assert_eq!(record.status, MigrationStatus::Failed);
        assert!(record.snapshot.is_none());

        assert!(matches!(engine.execute_migration("missing", json!({})), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_rollback_needs_down() {
        let mut engine = MigrationEngine::new();
        engine.register(rename_title()).unwrap();
        engine.register(add_tags()).unwrap();

        let back = engine.rollback_migration("rename-title", json!({"name": "A"})).unwrap();
        assert_eq!(back, json!({"title": "A"}));
        assert_eq!(engine.tracker().get_history()[0].status, MigrationStatus::RolledBack);
        assert!(matches!(engine.rollback_migration("add-tags", json!({})), Err(SyncError::Migration { .. })));
    }

    #[test]
    fn test_execute_pending_chain_and_guarded_downgrade() {
        let mut engine = MigrationEngine::new();
        engine.register(rename_title()).unwrap();
        engine.register(add_tags()).unwrap();
        assert!(engine.register(add_tags()).is_err());

        assert_eq!(engine.plan(v("1.0.0"), v("2.0.0")).unwrap(), vec!["rename-title", "add-tags"]);
        let upgraded = engine.execute_pending(v("1.0.0"), v("2.0.0"), json!({"title": "A"})).unwrap();
        assert_eq!(upgraded, json!({"name": "A", "tags": []}));

        // add-tags has no down step, so the chain back to 1.0.0 fails at it
        assert!(engine.execute_pending(v("2.0.0"), v("1.0.0"), upgraded.clone()).is_err());
        let back = engine.execute_pending(v("1.1.0"), v("1.0.0"), json!({"name": "A"})).unwrap();
        assert_eq!(back, json!({"title": "A"}));

        assert!(matches!(engine.plan(v("1.0.0"), v("3.0.0")), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_downgrade_refused_without_history() {
        let mut engine = MigrationEngine::new();
        engine.register(rename_title()).unwrap();
        let err = engine.execute_pending(v("1.1.0"), v("1.0.0"), json!({"name": "A"})).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }
}
