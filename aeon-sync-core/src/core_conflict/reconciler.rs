//! Multi-version state reconciliation
//!
//! Picks (or merges) one state out of the versions reported by several
//! nodes. Versions whose content hash does not match their data, or whose
//! signature fails when signatures are required, are excluded first and
//! reported in the result.
//!
//! `VectorClock` is not a real vector clock: versions are clustered by
//! timestamp proximity and the latest cluster is merged.

use super::conflict::merge_values;
use crate::core_crypto::{CryptoProvider, Did};
use crate::errors::{SyncError, SyncResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconciliationStrategy {
    LastWriteWins,
    VectorClock,
    MajorityVote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVersion {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    /// BLAKE3 of the JSON encoding of `data`, hex
    pub hash: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_did: Option<Did>,
    /// base64 signature over `signing_input()`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StateVersion {
    pub fn new(version: u64, node_id: impl Into<String>, data: Value, timestamp: DateTime<Utc>) -> Self {
        let hash = content_hash(&data);
        Self { version, timestamp, node_id: node_id.into(), hash, data, signer_did: None, signature: None }
    }

    pub fn hash_matches(&self) -> bool {
        content_hash(&self.data) == self.hash
    }

    fn signing_input(&self) -> String {
        format!("{}\n{}\n{}\n{}", self.version, self.node_id, self.timestamp.to_rfc3339(), self.hash)
    }
}

pub fn content_hash(data: &Value) -> String {
    blake3::hash(data.to_string().as_bytes()).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedVersion {
    pub node_id: String,
    pub version: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub strategy: ReconciliationStrategy,
    /// `None` when no version survived exclusion
    pub winner: Option<StateVersion>,
    /// Versions that took part after exclusion
    pub candidates: usize,
    pub excluded: Vec<ExcludedVersion>,
}

pub struct StateReconciler {
    crypto: Arc<dyn CryptoProvider>,
    require_signatures: bool,
    /// Versions closer than this in time land in the same cluster
    cluster_window: chrono::Duration,
}

impl StateReconciler {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto, require_signatures: false, cluster_window: chrono::Duration::seconds(1) }
    }

    pub fn with_required_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    pub fn with_cluster_window(mut self, window: chrono::Duration) -> Self {
        self.cluster_window = window;
        self
    }

    /// Sign a version with the local identity
    pub async fn sign_version(&self, mut version: StateVersion) -> SyncResult<StateVersion> {
        let did = self
            .crypto
            .get_local_did()
            .await
            .ok_or_else(|| SyncError::InvalidState("no local identity to sign with".into()))?;
        let signature = self.crypto.sign(version.signing_input().as_bytes()).await?;
        version.signer_did = Some(did);
        version.signature = Some(STANDARD.encode(signature));
        Ok(version)
    }

    async fn check(&self, version: &StateVersion) -> Result<(), String> {
        if !version.hash_matches() {
            return Err("content hash mismatch".into());
        }
        if !self.require_signatures {
            return Ok(());
        }
        let (Some(did), Some(signature)) = (&version.signer_did, &version.signature) else {
            return Err("unsigned version".into());
        };
        let signature = STANDARD.decode(signature).map_err(|e| format!("signature encoding: {}", e))?;
        match self.crypto.verify(did, version.signing_input().as_bytes(), &signature).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("invalid signature".into()),
            Err(e) => Err(e.to_string()),
        }
    }

    pub async fn reconcile(&self, versions: Vec<StateVersion>, strategy: ReconciliationStrategy) -> ReconciliationResult {
        let mut accepted = Vec::with_capacity(versions.len());
        let mut excluded = Vec::new();
        for version in versions {
            match self.check(&version).await {
                Ok(()) => accepted.push(version),
                Err(reason) => {
                    warn!(node = %version.node_id, version = version.version, %reason, "Excluding state version");
                    excluded.push(ExcludedVersion { node_id: version.node_id, version: version.version, reason });
                }
            }
        }

        let candidates = accepted.len();
        let winner = match strategy {
            ReconciliationStrategy::LastWriteWins => last_write_wins(accepted),
            ReconciliationStrategy::VectorClock => self.latest_cluster(accepted),
            ReconciliationStrategy::MajorityVote => majority_vote(accepted),
        };
        ReconciliationResult { strategy, winner, candidates, excluded }
    }

    fn latest_cluster(&self, mut versions: Vec<StateVersion>) -> Option<StateVersion> {
        versions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.node_id.cmp(&b.node_id)));
        let last = versions.last()?.timestamp;

        // Walk back while consecutive versions stay within the window
        let mut start = versions.len() - 1;
        while start > 0 && versions[start].timestamp - versions[start - 1].timestamp <= self.cluster_window {
            start -= 1;
        }
        let cluster = &versions[start..];
        if cluster.len() == 1 {
            return cluster.first().cloned();
        }

        let data = cluster.iter().fold(Value::Null, |acc, v| merge_values(&v.data, &acc));
        let version = cluster.iter().map(|v| v.version).max().unwrap_or_default() + 1;
        let node_id = cluster.iter().map(|v| v.node_id.as_str()).collect::<Vec<_>>().join("+");
        Some(StateVersion::new(version, node_id, data, last))
    }
}

fn last_write_wins(versions: Vec<StateVersion>) -> Option<StateVersion> {
    versions
        .into_iter()
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.node_id.cmp(&b.node_id)))
}

fn majority_vote(versions: Vec<StateVersion>) -> Option<StateVersion> {
    let mut groups: HashMap<String, Vec<StateVersion>> = HashMap::new();
    for version in versions {
        groups.entry(version.hash.clone()).or_default().push(version);
    }
    groups
        .into_values()
        .filter_map(|group| {
            let size = group.len();
            last_write_wins(group).map(|latest| (size, latest))
        })
        .max_by(|(a_size, a), (b_size, b)| {
            a_size
                .cmp(b_size)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
        .map(|(_, latest)| latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::{LocalCryptoProvider, NullCryptoProvider};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reconciler() -> StateReconciler {
        StateReconciler::new(Arc::new(NullCryptoProvider))
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let result = reconciler()
            .reconcile(
                vec![
                    StateVersion::new(1, "a", json!({"v": 1}), at(0)),
                    StateVersion::new(2, "b", json!({"v": 2}), at(10)),
                    StateVersion::new(3, "c", json!({"v": 3}), at(5)),
                ],
                ReconciliationStrategy::LastWriteWins,
            )
            .await;
        assert_eq!(result.winner.unwrap().node_id, "b");
        assert_eq!(result.candidates, 3);
    }

    #[tokio::test]
    async fn test_majority_vote() {
        let result = reconciler()
            .reconcile(
                vec![
                    StateVersion::new(1, "a", json!({"v": 1}), at(0)),
                    StateVersion::new(1, "b", json!({"v": 1}), at(1)),
                    StateVersion::new(2, "c", json!({"v": 2}), at(50)),
                ],
                ReconciliationStrategy::MajorityVote,
            )
            .await;
        let winner = result.winner.unwrap();
        assert_eq!(winner.data, json!({"v": 1}));
        assert_eq!(winner.node_id, "b");
    }

    #[tokio::test]
    async fn test_vector_clock_merges_latest_cluster() {
        let result = reconciler()
            .reconcile(
                vec![
                    StateVersion::new(1, "a", json!({"stale": true}), at(0)),
                    StateVersion::new(4, "b", json!({"title": "B", "x": 1}), at(100)),
                    StateVersion::new(5, "c", json!({"title": "C"}), at(100) + chrono::Duration::milliseconds(500)),
                ],
                ReconciliationStrategy::VectorClock,
            )
            .await;
        let winner = result.winner.unwrap();
        assert_eq!(winner.data, json!({"title": "C", "x": 1}));
        assert_eq!(winner.version, 6);
        assert!(winner.hash_matches());
    }

    #[tokio::test]
    async fn test_tampered_hash_is_excluded() {
        let mut forged = StateVersion::new(2, "b", json!({"v": 2}), at(10));
        forged.data = json!({"v": 666});
        let result = reconciler()
            .reconcile(
                vec![StateVersion::new(1, "a", json!({"v": 1}), at(0)), forged],
                ReconciliationStrategy::LastWriteWins,
            )
            .await;
        assert_eq!(result.winner.unwrap().node_id, "a");
        assert_eq!(result.excluded.len(), 1);
        assert_eq!(result.excluded[0].reason, "content hash mismatch");
    }

    #[tokio::test]
    async fn test_required_signatures() {
        let signer = StateReconciler::new(Arc::new(LocalCryptoProvider::with_seed([4; 32])));
        let verifier =
            StateReconciler::new(Arc::new(LocalCryptoProvider::with_seed([5; 32]))).with_required_signatures(true);

        let good = signer.sign_version(StateVersion::new(1, "a", json!({"v": 1}), at(0))).await.unwrap();
        let mut bad = signer.sign_version(StateVersion::new(2, "b", json!({"v": 2}), at(10))).await.unwrap();
        bad.version = 3;
        let unsigned = StateVersion::new(4, "c", json!({"v": 4}), at(20));

        let result = verifier.reconcile(vec![good, bad, unsigned], ReconciliationStrategy::LastWriteWins).await;
        assert_eq!(result.winner.unwrap().node_id, "a");
        let reasons: Vec<_> = result.excluded.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, vec!["invalid signature", "unsigned version"]);
    }

    #[tokio::test]
    async fn test_everything_excluded() {
        let strict = reconciler().with_required_signatures(true);
        let result = strict
            .reconcile(vec![StateVersion::new(1, "a", json!(1), at(0))], ReconciliationStrategy::MajorityVote)
            .await;
        assert!(result.winner.is_none());
        assert_eq!(result.candidates, 0);
    }
}
