//! SQLite-backed record store
//!
//! Connection-pooled; every call runs on the blocking thread pool so the
//! async engine never waits on disk I/O directly.

use super::migrations;
use super::RecordStore;
use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

type SqlPool = Pool<SqliteConnectionManager>;

pub struct SqlRecordStore {
    pool: Arc<SqlPool>,
}

impl SqlRecordStore {
    /// Open (or create) a database file and bring its schema up to date
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    pub fn new<P: AsRef<Path>>(db_path: P) -> SyncResult<Self> {
        Self::with_manager(SqliteConnectionManager::file(db_path), 8)
    }

    /// Private in-memory database, single connection
    pub fn in_memory() -> SyncResult<Self> {
        Self::with_manager(SqliteConnectionManager::memory(), 1)
    }

    fn with_manager(manager: SqliteConnectionManager, max_size: u32) -> SyncResult<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| SyncError::Storage(format!("Failed to create connection pool: {}", e)))?;
        migrations::migrate(&pool)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn schema_version(&self) -> SyncResult<i32> {
        migrations::get_current_version(&self.pool)
    }

    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqlPool) -> SyncResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || f(&pool))
            .await
            .map_err(|e| SyncError::Storage(format!("Task join error: {}", e)))?
    }
}

fn connection(pool: &SqlPool) -> SyncResult<r2d2::PooledConnection<SqliteConnectionManager>> {
    pool.get().map_err(|e| SyncError::Storage(format!("Failed to get connection: {}", e)))
}

fn sql_err(e: rusqlite::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    async fn put(&self, collection: &str, id: &str, value: &Value) -> SyncResult<()> {
        let collection = collection.to_string();
        let id = id.to_string();
        let body = serde_json::to_string(value)?;

        self.blocking(move |pool| {
            let now = chrono::Utc::now().timestamp_millis();
            connection(pool)?
                .execute(
                    r#"
                    INSERT INTO records (collection, id, value, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(collection, id) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![collection, id, body, now, now],
                )
                .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        let collection = collection.to_string();
        let id = id.to_string();

        self.blocking(move |pool| {
            let body: Option<String> = connection(pool)?
                .query_row(
                    "SELECT value FROM records WHERE collection = ? AND id = ?",
                    params![collection, id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            body.map(|b| serde_json::from_str(&b).map_err(SyncError::from)).transpose()
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let collection = collection.to_string();
        let id = id.to_string();

        self.blocking(move |pool| {
            let removed = connection(pool)?
                .execute("DELETE FROM records WHERE collection = ? AND id = ?", params![collection, id])
                .map_err(sql_err)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list(&self, collection: &str) -> SyncResult<Vec<Value>> {
        let collection = collection.to_string();

        self.blocking(move |pool| {
            let conn = connection(pool)?;
            let mut stmt = conn
                .prepare("SELECT value FROM records WHERE collection = ? ORDER BY id")
                .map_err(sql_err)?;
            let bodies = stmt
                .query_map(params![collection], |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            bodies.iter().map(|b| serde_json::from_str(b).map_err(SyncError::from)).collect()
        })
        .await
    }

    async fn clear(&self, collection: &str) -> SyncResult<usize> {
        let collection = collection.to_string();

        self.blocking(move |pool| {
            connection(pool)?
                .execute("DELETE FROM records WHERE collection = ?", params![collection])
                .map_err(sql_err)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sql_store_roundtrip() {
        let store = SqlRecordStore::in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), migrations::CURRENT_SCHEMA_VERSION);

        store.put("operations", "op-1", &json!({"id": "op-1", "status": "pending"})).await.unwrap();
        store.put("operations", "op-1", &json!({"id": "op-1", "status": "synced"})).await.unwrap();

        let loaded = store.get("operations", "op-1").await.unwrap().unwrap();
        assert_eq!(loaded["status"], "synced");
        assert_eq!(store.list("operations").await.unwrap().len(), 1);
        assert!(store.get("operations", "missing").await.unwrap().is_none());

        assert!(store.delete("operations", "op-1").await.unwrap());
        assert!(store.list("operations").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.db");

        {
            let store = SqlRecordStore::new(&path).unwrap();
            store.put("nodes", "n1", &json!({"id": "n1"})).await.unwrap();
            store.put("nodes", "n2", &json!({"id": "n2"})).await.unwrap();
        }

        let reopened = SqlRecordStore::new(&path).unwrap();
        let nodes = reopened.list("nodes").await.unwrap();
        assert_eq!(nodes, vec![json!({"id": "n1"}), json!({"id": "n2"})]);
        assert_eq!(reopened.clear("nodes").await.unwrap(), 2);
    }
}
