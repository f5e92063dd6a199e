/*
    tracker.rs - MigrationTracker

    Append-only audit trail of migration attempts. Records are never edited;
    a rollback is a new `down` record.

    Rollback from A down to B is allowed iff there is at least one applied
    `up` record with version in (B, A], and every such record carries a data
    snapshot.
*/

use super::schema::SemVer;
use crate::errors::SyncResult;
use crate::storage::{collections, RecordStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Applied,
    Failed,
    Pending,
    RolledBack,
}

/// Content digests around one migration run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSnapshot {
    pub before_hash: String,
    pub after_hash: String,
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    pub migration_id: String,
    /// Version the data is at after this record
    pub version: SemVer,
    pub direction: MigrationDirection,
    pub status: MigrationStatus,
    pub duration_ms: u64,
    pub items_affected: usize,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<DataSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationRecord {
    pub fn new(
        migration_id: impl Into<String>,
        version: SemVer,
        direction: MigrationDirection,
        status: MigrationStatus,
    ) -> Self {
        Self {
            id: format!("migration-record-{}", uuid::Uuid::new_v4()),
            migration_id: migration_id.into(),
            version,
            direction,
            status,
            duration_ms: 0,
            items_affected: 0,
            recorded_at: Utc::now(),
            snapshot: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatistics {
    pub total: usize,
    pub applied: usize,
    pub failed: usize,
    pub pending: usize,
    pub rolled_back: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub items_affected: usize,
}

#[derive(Debug, Default)]
pub struct MigrationTracker {
    records: Vec<MigrationRecord>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: MigrationRecord) {
        debug!(
            migration_id = %record.migration_id,
            version = %record.version,
            status = ?record.status,
            "Migration recorded"
        );
        self.records.push(record);
    }

    /// Every record, oldest first
    pub fn get_history(&self) -> &[MigrationRecord] {
        &self.records
    }

    pub fn get_history_for(&self, migration_id: &str) -> Vec<&MigrationRecord> {
        self.records.iter().filter(|r| r.migration_id == migration_id).collect()
    }

    pub fn get_statistics(&self) -> MigrationStatistics {
        let mut stats = MigrationStatistics { total: self.records.len(), ..Default::default() };
        for record in &self.records {
            match record.status {
                MigrationStatus::Applied => stats.applied += 1,
                MigrationStatus::Failed => stats.failed += 1,
                MigrationStatus::Pending => stats.pending += 1,
                MigrationStatus::RolledBack => stats.rolled_back += 1,
            }
            stats.total_duration_ms += record.duration_ms;
            stats.items_affected += record.items_affected;
        }
        if stats.total > 0 {
            stats.average_duration_ms = stats.total_duration_ms as f64 / stats.total as f64;
        }
        stats
    }

    /// Whether data at `from` may be rolled back to `to`
    pub fn can_rollback(&self, from: SemVer, to: SemVer) -> bool {
        if to >= from {
            return false;
        }
        let mut intermediate = self
            .records
            .iter()
            .filter(|r| r.direction == MigrationDirection::Up && r.status == MigrationStatus::Applied)
            .filter(|r| r.version > to && r.version <= from)
            .peekable();
        intermediate.peek().is_some() && intermediate.all(|r| r.snapshot.is_some())
    }

    pub fn export(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }

    /// Append exported records, skipping ids already present
    ///
    /// # Returns
    /// How many records were added.
    pub fn import(&mut self, json: &str) -> SyncResult<usize> {
        let incoming: Vec<MigrationRecord> = serde_json::from_str(json)?;
        let known: HashSet<String> = self.records.iter().map(|r| r.id.clone()).collect();
        let before = self.records.len();
        self.records.extend(incoming.into_iter().filter(|r| !known.contains(&r.id)));
        Ok(self.records.len() - before)
    }

    /// Write every record through to `store`
    pub async fn persist(&self, store: &dyn RecordStore) -> SyncResult<usize> {
        for record in &self.records {
            store.put(collections::MIGRATIONS, &record.id, &serde_json::to_value(record)?).await?;
        }
        Ok(self.records.len())
    }

    /// Load records previously written with `persist`, oldest first
    pub async fn load(store: &dyn RecordStore) -> SyncResult<Self> {
        let mut records: Vec<MigrationRecord> = store
            .list(collections::MIGRATIONS)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(Self { records })
    }
}
