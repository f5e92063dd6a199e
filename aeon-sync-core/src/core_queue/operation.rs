//! Queued local writes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Delivery priority. Orders `High < Normal < Low`, so sorting ascending
/// yields the send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationPriority {
    High,
    Normal,
    Low,
}

impl fmt::Display for OperationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationPriority::High => "high",
            OperationPriority::Normal => "normal",
            OperationPriority::Low => "low",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    /// Acknowledged by a peer; removed after the retention delay
    Synced,
    /// Retries exhausted; kept until cleared or retried manually
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub session_id: String,
    /// Cleartext payload; `Null` while only `encrypted_data` is held
    pub data: Value,
    pub priority: OperationPriority,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub bytes_size: usize,
    /// base64 of a sealed `KeyMaterial` blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_data: Option<String>,
    /// Insertion order, breaks `created_at` ties
    #[serde(default)]
    pub sequence: u64,
}

impl Operation {
    pub fn new(
        op_type: impl Into<String>,
        session_id: impl Into<String>,
        data: Value,
        priority: OperationPriority,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let bytes_size = serde_json::to_vec(&data).map(|b| b.len()).unwrap_or(0);
        Self {
            id: format!("op-{}", uuid::Uuid::new_v4()),
            op_type: op_type.into(),
            session_id: session_id.into(),
            data,
            priority,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            synced_at: None,
            last_error: None,
            bytes_size,
            encrypted_data: None,
            sequence: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether the operation deletes the addressed record
    pub fn is_delete(&self) -> bool {
        self.op_type == "delete"
    }

    /// Send-order key: priority, then creation time, then insertion order
    pub(crate) fn order_key(&self) -> (OperationPriority, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.sequence)
    }
}
