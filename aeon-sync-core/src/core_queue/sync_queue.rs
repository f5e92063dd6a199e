//! The queue surface the sync engine drives
//!
//! Both queue flavours implement it; the encrypted one hands out decrypted
//! operations.

use super::encrypted_queue::EncryptedOfflineQueue;
use super::offline_queue::OfflineOperationQueue;
use super::operation::{Operation, OperationStatus};
use crate::errors::SyncResult;
use async_trait::async_trait;

#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Queue a prepared operation, keeping its id
    async fn submit(&self, op: Operation) -> SyncResult<String>;

    /// Up to `n` pending operations in send order
    async fn next_batch(&self, n: usize) -> SyncResult<Vec<Operation>>;

    async fn operation(&self, id: &str) -> SyncResult<Option<Operation>>;

    async fn mark_syncing(&self, ids: &[String]) -> SyncResult<()>;

    async fn mark_synced(&self, id: &str) -> SyncResult<()>;

    async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<OperationStatus>;
}

#[async_trait]
impl SyncQueue for OfflineOperationQueue {
    async fn submit(&self, op: Operation) -> SyncResult<String> {
        self.enqueue_operation(op).await
    }

    async fn next_batch(&self, n: usize) -> SyncResult<Vec<Operation>> {
        Ok(self.get_next_batch(n).await)
    }

    async fn operation(&self, id: &str) -> SyncResult<Option<Operation>> {
        Ok(self.get_operation(id).await)
    }

    async fn mark_syncing(&self, ids: &[String]) -> SyncResult<()> {
        OfflineOperationQueue::mark_syncing(self, ids).await
    }

    async fn mark_synced(&self, id: &str) -> SyncResult<()> {
        OfflineOperationQueue::mark_synced(self, id).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<OperationStatus> {
        OfflineOperationQueue::mark_failed(self, id, error).await
    }
}

#[async_trait]
impl SyncQueue for EncryptedOfflineQueue {
    async fn submit(&self, op: Operation) -> SyncResult<String> {
        self.enqueue_operation(op).await
    }

    async fn next_batch(&self, n: usize) -> SyncResult<Vec<Operation>> {
        self.get_next_batch(n).await
    }

    async fn operation(&self, id: &str) -> SyncResult<Option<Operation>> {
        self.get_operation(id).await
    }

    async fn mark_syncing(&self, ids: &[String]) -> SyncResult<()> {
        EncryptedOfflineQueue::mark_syncing(self, ids).await
    }

    async fn mark_synced(&self, id: &str) -> SyncResult<()> {
        EncryptedOfflineQueue::mark_synced(self, id).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> SyncResult<OperationStatus> {
        EncryptedOfflineQueue::mark_failed(self, id, error).await
    }
}
