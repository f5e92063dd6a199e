//! Conflict records and their classification

use crate::core_queue::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    UpdateUpdate,
    /// Local delete against a remote update
    DeleteUpdate,
    /// Local update against a remote delete
    UpdateDelete,
    Concurrent,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::UpdateUpdate => "update_update",
            ConflictType::DeleteUpdate => "delete_update",
            ConflictType::UpdateDelete => "update_delete",
            ConflictType::Concurrent => "concurrent",
        }
    }

    /// `None` when the pair cannot conflict (both deletes)
    pub fn classify(local: &Operation, remote: &Operation) -> Option<Self> {
        match (local.is_delete(), remote.is_delete()) {
            (true, true) => None,
            (true, false) => Some(ConflictType::DeleteUpdate),
            (false, true) => Some(ConflictType::UpdateDelete),
            (false, false) if local.op_type == "update" && remote.op_type == "update" => {
                Some(ConflictType::UpdateUpdate)
            }
            (false, false) => Some(ConflictType::Concurrent),
        }
    }

    pub fn involves_delete(&self) -> bool {
        matches!(self, ConflictType::DeleteUpdate | ConflictType::UpdateDelete)
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
        }
    }

    pub fn from_similarity(similarity: f64) -> Self {
        if similarity < 0.3 {
            ConflictSeverity::High
        } else if similarity < 0.6 {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    /// Keeps the local data; timestamps are not compared
    LastModified,
    Merge,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "local-wins",
            ResolutionStrategy::RemoteWins => "remote-wins",
            ResolutionStrategy::LastModified => "last-modified",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resolved_data: Value,
    pub resolved_at: DateTime<Utc>,
    /// Resolved at detection time without a caller decision
    pub automatic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub operation_id: String,
    pub session_id: String,
    pub local_data: Value,
    pub remote_data: Value,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub similarity: f64,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Shared-character similarity of two JSON values, 0.0..=1.0
///
/// Counts characters of the shorter serialization that can be matched
/// (with multiplicity) in the longer one, over the longer length.
pub fn similarity(a: &Value, b: &Value) -> f64 {
    if a == b {
        return 1.0;
    }
    let a = a.to_string();
    let b = b.to_string();
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let long_len = long.chars().count();
    if long_len == 0 {
        return 1.0;
    }

    let mut available: HashMap<char, usize> = HashMap::new();
    for c in long.chars() {
        *available.entry(c).or_default() += 1;
    }
    let shared = short
        .chars()
        .filter(|c| match available.get_mut(c) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        })
        .count();
    shared as f64 / long_len as f64
}

/// Recursive merge of two objects, `preferred` winning on key collisions
///
/// Non-object values are not merged; `preferred` is returned as-is.
pub fn merge_values(preferred: &Value, other: &Value) -> Value {
    match (preferred, other) {
        (Value::Object(pref), Value::Object(base)) => {
            let mut merged = base.clone();
            for (key, value) in pref {
                let next = match base.get(key) {
                    Some(existing) => merge_values(value, existing),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => preferred.clone(),
    }
}
