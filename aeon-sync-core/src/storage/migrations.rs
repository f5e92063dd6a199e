//! Versioned schema for the SQL record store
//!
//! Each migration is applied in its own transaction and recorded in the
//! `schema_version` table.

use crate::errors::{SyncError, SyncResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

pub struct StoreMigration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: Option<&'static str>,
}

pub fn get_migrations() -> Vec<StoreMigration> {
    vec![
        StoreMigration {
            version: 1,
            description: "Record table keyed by collection and id",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS records (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (collection, id)
                );
            "#,
            down_sql: Some("DROP TABLE IF EXISTS records;"),
        },
        StoreMigration {
            version: 2,
            description: "Index records by collection and update time for compaction scans",
            up_sql: r#"
                CREATE INDEX IF NOT EXISTS idx_records_collection_updated
                    ON records(collection, updated_at);
            "#,
            down_sql: Some("DROP INDEX IF EXISTS idx_records_collection_updated;"),
        },
    ]
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Storage(format!("{}: {}", context, e))
}

/// Highest applied version, 0 for a fresh database
pub fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> SyncResult<i32> {
    let conn = pool.get().map_err(|e| storage_err("Failed to get connection", e))?;

    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)
        .map_err(|e| storage_err("Failed to inspect schema", e))?;
    if !table_exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get::<_, Option<i32>>(0))
        .map_err(|e| storage_err("Failed to read schema version", e))?;
    Ok(version.unwrap_or(0))
}

fn apply_migration(pool: &Pool<SqliteConnectionManager>, migration: &StoreMigration) -> SyncResult<()> {
    let mut conn = pool.get().map_err(|e| storage_err("Failed to get connection", e))?;
    let tx = conn.transaction().map_err(|e| storage_err("Failed to begin transaction", e))?;

    tx.execute_batch(migration.up_sql)
        .map_err(|e| storage_err(&format!("Migration {} failed", migration.version), e))?;
    tx.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![migration.version, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| storage_err("Failed to record migration", e))?;

    tx.commit().map_err(|e| storage_err("Failed to commit migration", e))
}

/// Apply every migration newer than the current version
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> SyncResult<()> {
    let current = get_current_version(pool)?;
    for migration in get_migrations().into_iter().filter(|m| m.version > current) {
        tracing::info!(version = migration.version, "Applying store migration: {}", migration.description);
        apply_migration(pool, &migration)?;
    }
    Ok(())
}

pub fn rollback_migration(pool: &Pool<SqliteConnectionManager>, version: i32) -> SyncResult<()> {
    let migration = get_migrations()
        .into_iter()
        .find(|m| m.version == version)
        .ok_or_else(|| SyncError::Storage(format!("Store migration {} not found", version)))?;
    let down_sql = migration
        .down_sql
        .ok_or_else(|| SyncError::Storage(format!("No rollback available for version {}", version)))?;

    let mut conn = pool.get().map_err(|e| storage_err("Failed to get connection", e))?;
    let tx = conn.transaction().map_err(|e| storage_err("Failed to begin transaction", e))?;
    tx.execute_batch(down_sql).map_err(|e| storage_err(&format!("Rollback {} failed", version), e))?;
    tx.execute("DELETE FROM schema_version WHERE version = ?", params![version])
        .map_err(|e| storage_err("Failed to remove migration record", e))?;
    tx.commit().map_err(|e| storage_err("Failed to commit rollback", e))
}
