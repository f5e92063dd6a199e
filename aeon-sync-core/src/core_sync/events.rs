/*
    events.rs - coordinator events

    Every coordinator mutation appends one record to an append-only log and
    publishes it on a broadcast channel. Subscribers that fall behind miss
    broadcasts but can always read the log.
*/

use super::coordinator::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    NodeRegistered { node_id: String },
    #[serde(rename_all = "camelCase")]
    NodeDeregistered { node_id: String },
    #[serde(rename_all = "camelCase")]
    HeartbeatReceived { node_id: String },
    #[serde(rename_all = "camelCase")]
    NodeOnline { node_id: String },
    #[serde(rename_all = "camelCase")]
    NodeOffline { node_id: String },
    #[serde(rename_all = "camelCase")]
    SessionCreated { session_id: String, initiator_id: String },
    #[serde(rename_all = "camelCase")]
    SessionUpdated { session_id: String, status: SessionStatus },
    #[serde(rename_all = "camelCase")]
    SyncCompleted { session_id: String, status: SessionStatus, items_synced: u64, items_failed: u64 },
    #[serde(rename_all = "camelCase")]
    ConflictRecorded { session_id: String, node_id: String, data: Value },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEventRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SyncEvent,
}

pub(crate) struct EventLog {
    records: RwLock<Vec<SyncEventRecord>>,
    tx: broadcast::Sender<SyncEventRecord>,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { records: RwLock::new(Vec::new()), tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SyncEventRecord> {
        self.tx.subscribe()
    }

    pub(crate) async fn append(&self, event: SyncEvent) -> SyncEventRecord {
        let record = {
            let mut records = self.records.write().await;
            let record = SyncEventRecord { sequence: records.len() as u64, timestamp: Utc::now(), event };
            records.push(record.clone());
            record
        };
        // No subscribers is fine
        let _ = self.tx.send(record.clone());
        record
    }

    /// The last `limit` records, oldest first
    pub(crate) async fn tail(&self, limit: Option<usize>) -> Vec<SyncEventRecord> {
        let records = self.records.read().await;
        let skip = limit.map_or(0, |n| records.len().saturating_sub(n));
        records[skip..].to_vec()
    }

    pub(crate) async fn clear(&self) {
        self.records.write().await.clear();
    }
}
