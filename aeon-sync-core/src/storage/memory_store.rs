//! In-memory record store, used in tests and for ephemeral engines

use super::RecordStore;
use crate::errors::SyncResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    collections: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections.read().await.get(collection).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, collection: &str, id: &str, value: &Value) -> SyncResult<()> {
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_default().insert(id.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|records| records.get(id)).cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let mut collections = self.collections.write().await;
        Ok(collections.get_mut(collection).and_then(|records| records.remove(id)).is_some())
    }

    async fn list(&self, collection: &str) -> SyncResult<Vec<Value>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|records| records.values().cloned().collect()).unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> SyncResult<usize> {
        let mut collections = self.collections.write().await;
        Ok(collections.remove(collection).map_or(0, |records| records.len()))
    }
}
