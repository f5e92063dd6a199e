/*
    offline_queue.rs - Priority-ordered queue of local writes awaiting sync

    Ordering: high before normal before low, FIFO within a class.
    Capacity: a full queue evicts its oldest low-priority pending operation,
    or rejects the new one when there is none.
    Retries: mark_failed returns an operation to pending until retry_count
    reaches max_retries, then it stays failed until retried or cleared.
    Synced and failed are terminal: neither is moved by mark_syncing or
    mark_failed, and a failed operation cannot be marked synced.

    With a RecordStore attached every mutation is written through, and
    `restore` rebuilds the queue after a restart.
*/

use super::operation::{Operation, OperationPriority, OperationStatus};
use crate::config::QueueConfig;
use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use crate::storage::{collections, RecordStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub total_bytes: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    operations: HashMap<String, Operation>,
    next_sequence: u64,
}

impl QueueState {
    fn pending_sorted(&self) -> Vec<&Operation> {
        let mut pending: Vec<&Operation> =
            self.operations.values().filter(|op| op.status == OperationStatus::Pending).collect();
        pending.sort_by_key(|op| op.order_key());
        pending
    }

    fn pending_count(&self) -> usize {
        self.operations.values().filter(|op| op.status == OperationStatus::Pending).count()
    }

    fn total_bytes(&self) -> usize {
        self.operations.values().map(|op| op.bytes_size).sum()
    }

    /// Remove synced operations whose `synced_at` is older than `age`
    fn drain_synced_older_than(&mut self, age: Duration, now: DateTime<Utc>) -> Vec<Operation> {
        let cutoff = now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let expired: Vec<String> = self
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Synced)
            .filter(|op| op.synced_at.is_some_and(|t| t <= cutoff))
            .map(|op| op.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.operations.remove(id)).collect()
    }
}

/// Local queue of writes made while offline
pub struct OfflineOperationQueue {
    state: RwLock<QueueState>,
    config: QueueConfig,
    store: Option<Arc<dyn RecordStore>>,
}

impl OfflineOperationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self { state: RwLock::new(QueueState::default()), config, store: None }
    }

    /// Queue that writes every mutation through to `store`
    pub fn with_store(config: QueueConfig, store: Arc<dyn RecordStore>) -> Self {
        Self { state: RwLock::new(QueueState::default()), config, store: Some(store) }
    }

    /// Rebuild a queue from persisted operations
    ///
    /// Operations caught mid-flight (`syncing`) go back to `pending`.
    pub async fn restore(config: QueueConfig, store: Arc<dyn RecordStore>) -> SyncResult<Self> {
        let mut state = QueueState::default();
        let mut interrupted = Vec::new();

        for record in store.list(collections::OPERATIONS).await? {
            let mut op: Operation = serde_json::from_value(record)?;
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
                interrupted.push(op.clone());
            }
            state.next_sequence = state.next_sequence.max(op.sequence + 1);
            state.operations.insert(op.id.clone(), op);
        }

        info!(
            restored = state.operations.len(),
            interrupted = interrupted.len(),
            "Restored offline queue"
        );

        let queue = Self { state: RwLock::new(state), config, store: Some(store) };
        queue.persist(&interrupted).await?;
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a local write
    ///
    /// # Arguments
    /// * `max_retries` - overrides the configured default when set
    ///
    /// # Returns
    /// The new operation id, or `SyncError::Capacity` when the queue is full
    /// and holds no pending low-priority operation to evict.
    pub async fn enqueue(
        &self,
        op_type: &str,
        data: Value,
        session_id: &str,
        priority: OperationPriority,
        max_retries: Option<u32>,
    ) -> SyncResult<String> {
        let max_retries = max_retries.unwrap_or(self.config.default_max_retries);
        self.insert(Operation::new(op_type, session_id, data, priority, max_retries)).await
    }

    /// Queue a prepared operation, keeping its id
    ///
    /// Fails with `SyncError::InvalidState` if the id is already queued.
    pub async fn enqueue_operation(&self, op: Operation) -> SyncResult<String> {
        self.insert(op).await
    }

    /// Insert a prepared operation under the capacity policy
    pub(crate) async fn insert(&self, mut op: Operation) -> SyncResult<String> {
        let (admitted, evicted, expired) = {
            let mut state = self.state.write().await;
            if state.operations.contains_key(&op.id) {
                return Err(SyncError::InvalidState(format!("operation {} is already queued", op.id)));
            }
            let expired = state.drain_synced_older_than(self.config.synced_retention, Utc::now());

            let mut evicted = None;
            let mut admitted = true;
            if state.operations.len() >= self.config.max_operations {
                let victim = state
                    .operations
                    .values()
                    .filter(|o| o.status == OperationStatus::Pending && o.priority == OperationPriority::Low)
                    .min_by_key(|o| o.order_key())
                    .map(|o| o.id.clone());

                match victim {
                    Some(id) => evicted = state.operations.remove(&id),
                    None => admitted = false,
                }
            }

            if admitted {
                op.sequence = state.next_sequence;
                state.next_sequence += 1;
                state.operations.insert(op.id.clone(), op.clone());
                ::metrics::gauge!(metrics::QUEUE_PENDING).set(state.pending_count() as f64);
            }
            (admitted, evicted, expired)
        };

        for op in &expired {
            self.forget(&op.id).await?;
        }

        if !admitted {
            ::metrics::counter!(metrics::QUEUE_REJECTED).increment(1);
            warn!(
                capacity = self.config.max_operations,
                priority = %op.priority,
                "Offline queue full, rejecting operation"
            );
            return Err(SyncError::Capacity(format!(
                "queue holds {} operations and none is evictable",
                self.config.max_operations
            )));
        }

        if let Some(victim) = &evicted {
            ::metrics::counter!(metrics::QUEUE_EVICTED).increment(1);
            warn!(evicted = %victim.id, "Evicted low-priority operation to make room");
            self.forget(&victim.id).await?;
        }

        ::metrics::counter!(metrics::QUEUE_ENQUEUED).increment(1);
        debug!(id = %op.id, priority = %op.priority, session = %op.session_id, "Enqueued operation");
        self.persist(std::slice::from_ref(&op)).await?;
        Ok(op.id)
    }

    /// Up to `n` pending operations in send order
    pub async fn get_next_batch(&self, n: usize) -> Vec<Operation> {
        let state = self.state.read().await;
        state.pending_sorted().into_iter().take(n).cloned().collect()
    }

    /// Move pending operations to `syncing`
    ///
    /// Operations that are no longer pending are left untouched.
    pub async fn mark_syncing(&self, ids: &[String]) -> SyncResult<()> {
        let changed = {
            let mut state = self.state.write().await;
            if let Some(missing) = ids.iter().find(|id| !state.operations.contains_key(*id)) {
                return Err(SyncError::not_found("operation", missing));
            }

            let now = Utc::now();
            let mut changed = Vec::new();
            for id in ids {
                if let Some(op) = state.operations.get_mut(id) {
                    if op.status == OperationStatus::Pending {
                        op.status = OperationStatus::Syncing;
                        op.updated_at = now;
                        changed.push(op.clone());
                    } else {
                        debug!(id = %id, status = ?op.status, "Skipping non-pending operation");
                    }
                }
            }
            ::metrics::gauge!(metrics::QUEUE_PENDING).set(state.pending_count() as f64);
            changed
        };
        self.persist(&changed).await
    }

    /// Record a successful sync
    ///
    /// Marking a synced operation again is a no-op. A terminally failed
    /// operation is refused with `InvalidState` until `retry_failed`.
    pub async fn mark_synced(&self, id: &str) -> SyncResult<()> {
        let op = {
            let mut state = self.state.write().await;
            let op = state.operations.get_mut(id).ok_or_else(|| SyncError::not_found("operation", id))?;
            match op.status {
                OperationStatus::Synced => return Ok(()),
                OperationStatus::Failed => {
                    return Err(SyncError::InvalidState(format!("operation '{}' has failed permanently", id)));
                }
                OperationStatus::Pending | OperationStatus::Syncing => {}
            }
            let now = Utc::now();
            op.status = OperationStatus::Synced;
            op.synced_at = Some(now);
            op.updated_at = now;
            op.last_error = None;
            op.clone()
        };

        ::metrics::counter!(metrics::QUEUE_SYNCED).increment(1);
        self.persist(std::slice::from_ref(&op)).await
    }

    /// Record a failed attempt
    ///
    /// # Returns
    /// The resulting status: `Pending` while retries remain, `Failed` once
    /// `retry_count` reaches `max_retries`.
    pub async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<OperationStatus> {
        let op = {
            let mut state = self.state.write().await;
            let op = state.operations.get_mut(id).ok_or_else(|| SyncError::not_found("operation", id))?;
            if matches!(op.status, OperationStatus::Failed | OperationStatus::Synced) {
                debug!(id = %id, status = ?op.status, "Ignoring failure on terminal operation");
                return Ok(op.status);
            }

            op.retry_count += 1;
            op.last_error = Some(error.to_string());
            op.updated_at = Utc::now();
            op.status = if op.retry_count >= op.max_retries {
                OperationStatus::Failed
            } else {
                OperationStatus::Pending
            };
            let op = op.clone();
            ::metrics::gauge!(metrics::QUEUE_PENDING).set(state.pending_count() as f64);
            op
        };

        if op.status == OperationStatus::Failed {
            ::metrics::counter!(metrics::QUEUE_FAILED).increment(1);
            warn!(id = %op.id, retries = op.retry_count, error = %error, "Operation failed permanently");
        } else {
            debug!(id = %op.id, retry = op.retry_count, max = op.max_retries, "Operation will be retried");
        }

        self.persist(std::slice::from_ref(&op)).await?;
        Ok(op.status)
    }

    pub async fn get_stats(&self) -> QueueStats {
        let state = self.state.read().await;
        let mut stats = QueueStats { total: state.operations.len(), ..Default::default() };

        for op in state.operations.values() {
            stats.total_bytes += op.bytes_size;
            match op.status {
                OperationStatus::Pending => {
                    stats.pending += 1;
                    match op.priority {
                        OperationPriority::High => stats.pending_high += 1,
                        OperationPriority::Normal => stats.pending_normal += 1,
                        OperationPriority::Low => stats.pending_low += 1,
                    }
                    if stats.oldest_pending.map_or(true, |t| op.created_at < t) {
                        stats.oldest_pending = Some(op.created_at);
                    }
                }
                OperationStatus::Syncing => stats.syncing += 1,
                OperationStatus::Synced => stats.synced += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// All pending operations in send order
    pub async fn get_pending_operations(&self) -> Vec<Operation> {
        let state = self.state.read().await;
        state.pending_sorted().into_iter().cloned().collect()
    }

    pub async fn get_operation(&self, id: &str) -> Option<Operation> {
        self.state.read().await.operations.get(id).cloned()
    }

    pub async fn get_failed_operations(&self) -> Vec<Operation> {
        let state = self.state.read().await;
        let mut failed: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|op| op.order_key());
        failed
    }

    /// Return every terminally failed operation to `pending` with a fresh retry budget
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let changed = {
            let mut state = self.state.write().await;
            let now = Utc::now();
            let mut changed = Vec::new();
            for op in state.operations.values_mut().filter(|op| op.status == OperationStatus::Failed) {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.updated_at = now;
                changed.push(op.clone());
            }
            ::metrics::gauge!(metrics::QUEUE_PENDING).set(state.pending_count() as f64);
            changed
        };

        if !changed.is_empty() {
            info!(count = changed.len(), "Retrying failed operations");
        }
        self.persist(&changed).await?;
        Ok(changed.len())
    }

    /// Drop terminally failed operations
    pub async fn clear_failed(&self) -> SyncResult<usize> {
        let removed: Vec<String> = {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state
                .operations
                .values()
                .filter(|op| op.status == OperationStatus::Failed)
                .map(|op| op.id.clone())
                .collect();
            for id in &ids {
                state.operations.remove(id);
            }
            ids
        };

        for id in &removed {
            self.forget(id).await?;
        }
        Ok(removed.len())
    }

    /// Remove synced operations acknowledged more than `age` ago
    pub async fn remove_synced_older_than(&self, age: Duration) -> SyncResult<usize> {
        Ok(self.drain_synced_older_than(age).await?.len())
    }

    pub(crate) async fn drain_synced_older_than(&self, age: Duration) -> SyncResult<Vec<Operation>> {
        let removed = self.state.write().await.drain_synced_older_than(age, Utc::now());
        for op in &removed {
            self.forget(&op.id).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.operations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.operations.is_empty()
    }

    pub async fn total_bytes(&self) -> usize {
        self.state.read().await.total_bytes()
    }

    /// Remove every operation, persisted copies included
    pub async fn clear(&self) -> SyncResult<()> {
        self.state.write().await.operations.clear();
        if let Some(store) = &self.store {
            store.clear(collections::OPERATIONS).await?;
        }
        ::metrics::gauge!(metrics::QUEUE_PENDING).set(0.0);
        Ok(())
    }

    async fn persist(&self, ops: &[Operation]) -> SyncResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        for op in ops {
            store.put(collections::OPERATIONS, &op.id, &serde_json::to_value(op)?).await?;
        }
        Ok(())
    }

    async fn forget(&self, id: &str) -> SyncResult<()> {
        if let Some(store) = &self.store {
            store.delete(collections::OPERATIONS, id).await?;
        }
        Ok(())
    }
}
