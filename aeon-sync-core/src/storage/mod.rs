//! Durable record storage
//!
//! Nodes, sessions, operations, conflicts and migration records are plain
//! JSON documents keyed by `(collection, id)`. In-memory maps in the engine
//! components act as a cache and write through to a `RecordStore`.

pub mod memory_store;
pub mod migrations;
pub mod sql_store;

pub use memory_store::MemoryRecordStore;
pub use sql_store::SqlRecordStore;

use crate::errors::SyncResult;
use async_trait::async_trait;
use serde_json::Value;

/// Collection names used by the engine
pub mod collections {
    pub const OPERATIONS: &str = "operations";
    pub const NODES: &str = "nodes";
    pub const SESSIONS: &str = "sessions";
    pub const CONFLICTS: &str = "conflicts";
    pub const MIGRATIONS: &str = "migrations";
}

/// Keyed JSON document store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, collection: &str, id: &str, value: &Value) -> SyncResult<()>;

    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Value>>;

    /// Returns whether a record was removed
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool>;

    /// All records of a collection, ordered by id
    async fn list(&self, collection: &str) -> SyncResult<Vec<Value>>;

    /// Remove every record of a collection, returning how many were removed
    async fn clear(&self, collection: &str) -> SyncResult<usize>;
}
