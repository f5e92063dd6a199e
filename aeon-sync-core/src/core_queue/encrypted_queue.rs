/*
    encrypted_queue.rs - Offline queue whose payloads are only held sealed

    Each operation's data is sealed with KeyMaterial before it enters the
    queue (and the record store); `bytes_size` is the sealed blob length.
    Reads decrypt on the way out.

    Compaction removes synced operations older than `compaction_max_age`,
    and runs when usage (the larger of the byte and count fractions of
    capacity) exceeds `compaction_threshold`.
*/

use super::offline_queue::{OfflineOperationQueue, QueueStats};
use super::operation::{Operation, OperationPriority, OperationStatus};
use crate::config::QueueConfig;
use crate::core_crypto::{CryptoError, KeyMaterial};
use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::storage::RecordStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub removed: usize,
    pub bytes_freed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedQueueStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    /// Fraction of capacity in use, 0.0..=1.0
    pub usage: f64,
    pub compactions: u64,
    pub last_compaction: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CompactionState {
    runs: u64,
    last_run: Option<DateTime<Utc>>,
}

pub struct EncryptedOfflineQueue {
    queue: OfflineOperationQueue,
    key: RwLock<Option<KeyMaterial>>,
    compaction: RwLock<CompactionState>,
}

impl EncryptedOfflineQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::wrap(OfflineOperationQueue::new(config))
    }

    pub fn with_store(config: QueueConfig, store: Arc<dyn RecordStore>) -> Self {
        Self::wrap(OfflineOperationQueue::with_store(config, store))
    }

    /// Rebuild from persisted (sealed) operations; a key is still required to read them
    pub async fn restore(config: QueueConfig, store: Arc<dyn RecordStore>) -> SyncResult<Self> {
        Ok(Self::wrap(OfflineOperationQueue::restore(config, store).await?))
    }

    fn wrap(queue: OfflineOperationQueue) -> Self {
        Self { queue, key: RwLock::new(None), compaction: RwLock::new(CompactionState::default()) }
    }

    pub async fn set_key_material(&self, key: KeyMaterial) {
        debug!(source = ?key.source(), "Queue key material installed");
        *self.key.write().await = Some(key);
    }

    pub async fn has_key_material(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Seal and queue a local write
    ///
    /// Fails with a crypto error when no key material is installed; nothing
    /// is ever queued in cleartext.
    pub async fn enqueue(
        &self,
        op_type: &str,
        data: Value,
        session_id: &str,
        priority: OperationPriority,
        max_retries: Option<u32>,
    ) -> SyncResult<String> {
        let max_retries = max_retries.unwrap_or(self.queue.config().default_max_retries);
        self.enqueue_operation(Operation::new(op_type, session_id, data, priority, max_retries)).await
    }

    /// Seal and queue a prepared operation, keeping its id
    pub async fn enqueue_operation(&self, mut op: Operation) -> SyncResult<String> {
        let blob = {
            let key = self.key.read().await;
            let key = key.as_ref().ok_or(CryptoError::NotInitialized)?;
            key.seal(&serde_json::to_vec(&op.data)?)?
        };

        let config = self.queue.config();
        let incoming = blob.len();
        if self.queue.total_bytes().await + incoming > config.max_bytes {
            self.compact().await?;
            let used = self.queue.total_bytes().await;
            if used + incoming > config.max_bytes {
                ::metrics::counter!(metrics::QUEUE_REJECTED).increment(1);
                return Err(SyncError::Capacity(format!(
                    "{} bytes queued, {} more exceeds limit of {}",
                    used, incoming, config.max_bytes
                )));
            }
        }

        op.data = Value::Null;
        op.bytes_size = incoming;
        op.encrypted_data = Some(STANDARD.encode(&blob));

        let id = self.queue.insert(op).await?;
        self.maybe_compact().await?;
        Ok(id)
    }

    /// Up to `n` pending operations in send order, decrypted
    pub async fn get_next_batch(&self, n: usize) -> SyncResult<Vec<Operation>> {
        let sealed = self.queue.get_next_batch(n).await;
        self.open_all(sealed).await
    }

    pub async fn get_pending_operations(&self) -> SyncResult<Vec<Operation>> {
        let sealed = self.queue.get_pending_operations().await;
        self.open_all(sealed).await
    }

    pub async fn get_operation(&self, id: &str) -> SyncResult<Option<Operation>> {
        match self.queue.get_operation(id).await {
            Some(op) => Ok(self.open_all(vec![op]).await?.pop()),
            None => Ok(None),
        }
    }

    pub async fn mark_syncing(&self, ids: &[String]) -> SyncResult<()> {
        self.queue.mark_syncing(ids).await
    }

    pub async fn mark_synced(&self, id: &str) -> SyncResult<()> {
        self.queue.mark_synced(id).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<OperationStatus> {
        self.queue.mark_failed(id, error).await
    }

    pub async fn retry_failed(&self) -> SyncResult<usize> {
        self.queue.retry_failed().await
    }

    pub async fn clear_failed(&self) -> SyncResult<usize> {
        self.queue.clear_failed().await
    }

    /// Larger of the byte and count fractions of capacity
    pub async fn usage(&self) -> f64 {
        let config = self.queue.config();
        let bytes = self.queue.total_bytes().await as f64 / config.max_bytes.max(1) as f64;
        let count = self.queue.len().await as f64 / config.max_operations.max(1) as f64;
        bytes.max(count)
    }

    pub async fn get_stats(&self) -> EncryptedQueueStats {
        let compaction = self.compaction.read().await;
        EncryptedQueueStats {
            queue: self.queue.get_stats().await,
            usage: self.usage().await,
            compactions: compaction.runs,
            last_compaction: compaction.last_run,
        }
    }

    /// Remove synced operations older than the configured age
    pub async fn compact(&self) -> SyncResult<CompactionReport> {
        let removed = self.queue.drain_synced_older_than(self.queue.config().compaction_max_age).await?;
        let report = CompactionReport {
            removed: removed.len(),
            bytes_freed: removed.iter().map(|op| op.bytes_size).sum(),
        };

        let mut compaction = self.compaction.write().await;
        compaction.runs += 1;
        compaction.last_run = Some(Utc::now());

        ::metrics::counter!(metrics::QUEUE_COMPACTED).increment(report.removed as u64);
        if report.removed > 0 {
            info!(removed = report.removed, bytes_freed = report.bytes_freed, "Compacted offline queue");
        }
        Ok(report)
    }

    /// Compact only when usage exceeds the threshold
    pub async fn maybe_compact(&self) -> SyncResult<Option<CompactionReport>> {
        let usage = self.usage().await;
        if usage > self.queue.config().compaction_threshold {
            debug!(usage, "Queue usage above compaction threshold");
            return self.compact().await.map(Some);
        }
        Ok(None)
    }

    /// Periodic compaction until shutdown is signalled
    pub fn start_compaction(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> JoinHandle<()> {
        let period = self.queue.config().compaction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.maybe_compact().await {
                            warn!(error = %e, "Queue compaction failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Compaction task stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn open_all(&self, sealed: Vec<Operation>) -> SyncResult<Vec<Operation>> {
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(CryptoError::NotInitialized)?;

        sealed
            .into_iter()
            .map(|mut op| {
                let encoded = op.encrypted_data.as_deref().ok_or_else(|| {
                    SyncError::InvalidState(format!("operation {} has no sealed payload", op.id))
                })?;
                let blob = STANDARD
                    .decode(encoded)
                    .map_err(|e| CryptoError::Decryption(format!("{}: {}", op.id, e)))?;
                op.data = serde_json::from_slice(&key.open(&blob)?)?;
                Ok(op)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{collections, MemoryRecordStore};
    use serde_json::json;
    use std::time::Duration;

    async fn keyed(config: QueueConfig) -> EncryptedOfflineQueue {
        let queue = EncryptedOfflineQueue::new(config);
        queue.set_key_material(KeyMaterial::from_session_id("session-1").unwrap()).await;
        queue
    }

    #[tokio::test]
    async fn test_requires_key_material() {
        let queue = EncryptedOfflineQueue::new(QueueConfig::default());
        let result = queue.enqueue("update", json!({}), "s", OperationPriority::Normal, None).await;
        assert!(matches!(result, Err(SyncError::Crypto(CryptoError::NotInitialized))));
        assert_eq!(queue.get_stats().await.queue.total, 0);
    }

    #[tokio::test]
    async fn test_payloads_only_stored_sealed() {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = EncryptedOfflineQueue::with_store(QueueConfig::default(), store.clone());
        queue.set_key_material(KeyMaterial::from_session_id("s").unwrap()).await;

        let id = queue
            .enqueue("update", json!({"title": "secret"}), "s", OperationPriority::High, None)
            .await
            .unwrap();

        let persisted = store.get(collections::OPERATIONS, &id).await.unwrap().unwrap();
        assert_eq!(persisted["data"], Value::Null);
        assert!(!persisted.to_string().contains("secret"));

        let batch = queue.get_next_batch(10).await.unwrap();
        assert_eq!(batch[0].data, json!({"title": "secret"}));
        // version byte + nonce + plaintext + tag
        assert_eq!(batch[0].bytes_size, 1 + 12 + r#"{"title":"secret"}"#.len() + 16);
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_read() {
        let queue = keyed(QueueConfig::default()).await;
        queue.enqueue("update", json!({"a": 1}), "s", OperationPriority::Normal, None).await.unwrap();

        queue.set_key_material(KeyMaterial::from_session_id("other").unwrap()).await;
        assert!(matches!(queue.get_next_batch(1).await, Err(SyncError::Crypto(_))));
    }

    #[tokio::test]
    async fn test_byte_capacity() {
        let queue = keyed(QueueConfig { max_bytes: 64, ..QueueConfig::default() }).await;
        queue.enqueue("update", json!({"a": 1}), "s", OperationPriority::Normal, None).await.unwrap();

        let big = json!({"body": "x".repeat(100)});
        let result = queue.enqueue("update", big, "s", OperationPriority::High, None).await;
        assert!(matches!(result, Err(SyncError::Capacity(_))));
    }

    #[tokio::test]
    async fn test_compaction_above_threshold() {
        let queue = keyed(QueueConfig {
            max_operations: 4,
            compaction_threshold: 0.5,
            compaction_max_age: Duration::ZERO,
            synced_retention: Duration::from_secs(3600),
            ..QueueConfig::default()
        })
        .await;

        let a = queue.enqueue("update", json!({"a": 1}), "s", OperationPriority::Normal, None).await.unwrap();
        queue.mark_synced(&a).await.unwrap();
        assert!(queue.get_operation(&a).await.unwrap().is_some());

        // 2 of 4 is not above 0.5
        queue.enqueue("update", json!({"b": 1}), "s", OperationPriority::Normal, None).await.unwrap();
        assert!(queue.get_operation(&a).await.unwrap().is_some());

        // 3 of 4 is, and the synced operation goes
        queue.enqueue("update", json!({"c": 1}), "s", OperationPriority::Normal, None).await.unwrap();
        assert!(queue.get_operation(&a).await.unwrap().is_none());

        let stats = queue.get_stats().await;
        assert_eq!(stats.queue.total, 2);
        assert!(stats.compactions >= 1);
        assert!(stats.last_compaction.is_some());
    }

    #[tokio::test]
    async fn test_compaction_task_stops_on_shutdown() {
        let queue = Arc::new(keyed(QueueConfig {
            compaction_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        })
        .await);
        let (tx, rx) = broadcast::channel(1);
        let handle = queue.clone().start_compaction(rx);

        tx.send(ShutdownSignal::Graceful).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
