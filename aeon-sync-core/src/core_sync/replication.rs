/*
    replication.rs - ReplicationManager

    Tracks replicas and the policies they are held to.

    Health of a policy:
        healthy iff count(primary | secondary) >= replication_factor
                and max(lag_millis) <= max_replication_lag

    A policy counts the replicas bound to it plus every unbound replica;
    replicas bound to another policy are ignored.

    Consistency:
        eventual          always satisfiable
        read-after-write  >= max(1, required_acks) healthy replicas
        strong            >= max(replication_factor, required_acks) healthy replicas

    Policies are immutable once created. In end-to-end mode payloads are
    sealed per replica DID before they reach the protocol layer.
*/

use super::coordinator::EncryptionMode;
use crate::core_crypto::{Capability, CryptoProvider, Did, SealedPayload};
use crate::errors::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Primary,
    Secondary,
    Syncing,
    Failed,
}

impl ReplicaStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ReplicaStatus::Primary | ReplicaStatus::Secondary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyLevel {
    Eventual,
    ReadAfterWrite,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    pub status: ReplicaStatus,
    pub lag_bytes: u64,
    pub lag_millis: u64,
    pub encrypted: bool,
    /// Policy this replica serves; `None` counts toward every policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Replica {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, status: ReplicaStatus) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            did: None,
            status,
            lag_bytes: 0,
            lag_millis: 0,
            encrypted: false,
            policy_id: None,
            last_updated: Utc::now(),
        }
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    fn serves(&self, policy_id: &str) -> bool {
        self.policy_id.as_deref().map_or(true, |id| id == policy_id)
    }

    pub fn with_did(mut self, did: Did) -> Self {
        self.did = Some(did);
        self.encrypted = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationPolicy {
    pub id: String,
    pub replication_factor: u32,
    pub consistency_level: ConsistencyLevel,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_replication_lag: Duration,
    pub encryption_mode: EncryptionMode,
    pub required_capabilities: Vec<Capability>,
}

/// Arguments of `create_policy`
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOptions {
    pub replication_factor: u32,
    pub consistency_level: ConsistencyLevel,
    pub sync_interval: Duration,
    pub max_replication_lag: Duration,
    pub encryption_mode: EncryptionMode,
    pub required_capabilities: Vec<Capability>,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            consistency_level: ConsistencyLevel::Eventual,
            sync_interval: Duration::from_secs(5),
            max_replication_lag: Duration::from_secs(10),
            encryption_mode: EncryptionMode::None,
            required_capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationHealth {
    pub healthy: bool,
    pub healthy_replicas: usize,
    /// Largest replica lag, milliseconds
    pub replication_lag: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatusReport {
    pub total_replicas: usize,
    pub healthy_replicas: usize,
    pub by_status: BTreeMap<ReplicaStatus, usize>,
    pub max_lag_millis: u64,
    pub max_lag_bytes: u64,
    pub policies: usize,
}

pub struct ReplicationManager {
    crypto: Arc<dyn CryptoProvider>,
    replicas: RwLock<HashMap<String, Replica>>,
    policies: RwLock<HashMap<String, ReplicationPolicy>>,
}

impl ReplicationManager {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto, replicas: RwLock::new(HashMap::new()), policies: RwLock::new(HashMap::new()) }
    }

    pub async fn register_replica(&self, replica: Replica) -> SyncResult<()> {
        if replica.node_id.is_empty() {
            return Err(SyncError::InvalidState(format!("replica {} has no node", replica.id)));
        }
        info!(replica_id = %replica.id, node_id = %replica.node_id, status = ?replica.status, "Replica registered");
        self.replicas.write().await.insert(replica.id.clone(), replica);
        Ok(())
    }

    pub async fn remove_replica(&self, id: &str) -> SyncResult<Replica> {
        self.replicas.write().await.remove(id).ok_or_else(|| SyncError::not_found("replica", id))
    }

    pub async fn update_replica_status(
        &self,
        id: &str,
        status: ReplicaStatus,
        lag_bytes: u64,
        lag_millis: u64,
    ) -> SyncResult<()> {
        let mut replicas = self.replicas.write().await;
        let replica = replicas.get_mut(id).ok_or_else(|| SyncError::not_found("replica", id))?;
        if replica.status != status {
            debug!(replica_id = %id, from = ?replica.status, to = ?status, "Replica status changed");
        }
        if status == ReplicaStatus::Failed && replica.status != ReplicaStatus::Failed {
            warn!(replica_id = %id, "Replica failed");
        }
        replica.status = status;
        replica.lag_bytes = lag_bytes;
        replica.lag_millis = lag_millis;
        replica.last_updated = Utc::now();
        Ok(())
    }

    pub async fn get_replicas(&self, node_id: &str) -> Vec<Replica> {
        let mut replicas: Vec<Replica> =
            self.replicas.read().await.values().filter(|r| r.node_id == node_id).cloned().collect();
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        replicas
    }

    pub async fn create_policy(&self, options: PolicyOptions) -> SyncResult<ReplicationPolicy> {
        if options.replication_factor == 0 {
            return Err(SyncError::InvalidState("replication factor must be at least 1".into()));
        }
        let policy = ReplicationPolicy {
            id: format!("policy-{}", uuid::Uuid::new_v4()),
            replication_factor: options.replication_factor,
            consistency_level: options.consistency_level,
            sync_interval: options.sync_interval,
            max_replication_lag: options.max_replication_lag,
            encryption_mode: options.encryption_mode,
            required_capabilities: options.required_capabilities,
        };
        self.policies.write().await.insert(policy.id.clone(), policy.clone());
        info!(policy_id = %policy.id, factor = policy.replication_factor, consistency = ?policy.consistency_level, "Replication policy created");
        Ok(policy)
    }

    pub async fn get_policy(&self, id: &str) -> Option<ReplicationPolicy> {
        self.policies.read().await.get(id).cloned()
    }

    async fn policy(&self, id: &str) -> SyncResult<ReplicationPolicy> {
        self.get_policy(id).await.ok_or_else(|| SyncError::not_found("policy", id))
    }

    async fn healthy_count(&self, policy_id: &str) -> usize {
        self.replicas.read().await.values().filter(|r| r.serves(policy_id) && r.status.is_healthy()).count()
    }

    /// Health over the replicas serving `policy_id`
    pub async fn check_replication_health(&self, policy_id: &str) -> SyncResult<ReplicationHealth> {
        let policy = self.policy(policy_id).await?;
        let replicas = self.replicas.read().await;
        let serving: Vec<&Replica> = replicas.values().filter(|r| r.serves(policy_id)).collect();

        let healthy_replicas = serving.iter().filter(|r| r.status.is_healthy()).count();
        let replication_lag = serving.iter().map(|r| r.lag_millis).max().unwrap_or(0);
        let max_lag = u64::try_from(policy.max_replication_lag.as_millis()).unwrap_or(u64::MAX);

        Ok(ReplicationHealth {
            healthy: healthy_replicas >= policy.replication_factor as usize && replication_lag <= max_lag,
            healthy_replicas,
            replication_lag,
        })
    }

    pub async fn can_satisfy_consistency(&self, policy_id: &str, required_acks: u32) -> SyncResult<bool> {
        let policy = self.policy(policy_id).await?;
        let healthy = self.healthy_count(policy_id).await;
        let needed = match policy.consistency_level {
            ConsistencyLevel::Eventual => return Ok(true),
            ConsistencyLevel::ReadAfterWrite => required_acks.max(1),
            ConsistencyLevel::Strong => required_acks.max(policy.replication_factor),
        };
        Ok(healthy >= needed as usize)
    }

    pub async fn get_replication_status(&self) -> ReplicationStatusReport {
        let replicas = self.replicas.read().await;
        let mut report = ReplicationStatusReport {
            total_replicas: replicas.len(),
            policies: self.policies.read().await.len(),
            ..Default::default()
        };
        for replica in replicas.values() {
            *report.by_status.entry(replica.status).or_default() += 1;
            if replica.status.is_healthy() {
                report.healthy_replicas += 1;
            }
            report.max_lag_millis = report.max_lag_millis.max(replica.lag_millis);
            report.max_lag_bytes = report.max_lag_bytes.max(replica.lag_bytes);
        }
        report
    }

    /// Seal a payload for one replica's DID
    pub async fn encrypt_for_replica(&self, replica_id: &str, payload: &[u8]) -> SyncResult<SealedPayload> {
        let did = {
            let replicas = self.replicas.read().await;
            let replica = replicas.get(replica_id).ok_or_else(|| SyncError::not_found("replica", replica_id))?;
            replica
                .did
                .clone()
                .ok_or_else(|| SyncError::InvalidState(format!("replica {} has no DID", replica_id)))?
        };
        Ok(self.crypto.encrypt(payload, &did).await?)
    }

    /// Open a payload sealed by a registered replica
    pub async fn decrypt_from_replica(&self, sealed: &SealedPayload) -> SyncResult<Vec<u8>> {
        let known = self.replicas.read().await.values().any(|r| r.did.as_ref() == Some(&sealed.sender_did));
        if !known {
            return Err(SyncError::not_found("replica with DID", sealed.sender_did.as_str()));
        }
        Ok(self.crypto.decrypt(sealed).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::{LocalCryptoProvider, NullCryptoProvider};

    fn manager() -> ReplicationManager {
        ReplicationManager::new(Arc::new(NullCryptoProvider))
    }

    async fn with_replicas(statuses: &[ReplicaStatus]) -> ReplicationManager {
        let manager = manager();
        for (i, status) in statuses.iter().enumerate() {
            manager.register_replica(Replica::new(format!("r{}", i), "node-a", *status)).await.unwrap();
        }
        manager
    }

    fn strong(factor: u32) -> PolicyOptions {
        PolicyOptions { replication_factor: factor, consistency_level: ConsistencyLevel::Strong, ..Default::default() }
    }

    #[tokio::test]
    async fn test_strong_policy_short_of_replicas_is_unhealthy() {
        let manager =
            with_replicas(&[ReplicaStatus::Primary, ReplicaStatus::Secondary, ReplicaStatus::Failed]).await;
        let policy = manager.create_policy(strong(3)).await.unwrap();

        let health = manager.check_replication_health(&policy.id).await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.healthy_replicas, 2);
        assert!(!manager.can_satisfy_consistency(&policy.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_replicas_bound_to_other_policy_are_not_counted() {
        let manager = manager();
        let small = manager.create_policy(strong(1)).await.unwrap();
        let large = manager.create_policy(strong(2)).await.unwrap();

        manager
            .register_replica(Replica::new("r1", "a", ReplicaStatus::Primary).with_policy(&small.id))
            .await
            .unwrap();
        manager
            .register_replica(Replica::new("r2", "b", ReplicaStatus::Secondary).with_policy(&small.id))
            .await
            .unwrap();
        manager.update_replica_status("r2", ReplicaStatus::Secondary, 0, 5_000).await.unwrap();

        let health = manager.check_replication_health(&large.id).await.unwrap();
        assert_eq!((health.healthy, health.healthy_replicas, health.replication_lag), (false, 0, 0));
        assert!(!manager.can_satisfy_consistency(&large.id, 0).await.unwrap());
        assert_eq!(manager.check_replication_health(&small.id).await.unwrap().healthy_replicas, 2);

        // Unbound replicas serve every policy
        manager.register_replica(Replica::new("r3", "c", ReplicaStatus::Primary)).await.unwrap();
        manager.register_replica(Replica::new("r4", "d", ReplicaStatus::Primary)).await.unwrap();
        let health = manager.check_replication_health(&large.id).await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.healthy_replicas, 2);
        assert!(manager.can_satisfy_consistency(&large.id, 0).await.unwrap());
        assert_eq!(manager.check_replication_health(&small.id).await.unwrap().healthy_replicas, 4);
    }

    #[tokio::test]
    async fn test_lag_breaks_health() {
        let manager = with_replicas(&[ReplicaStatus::Primary, ReplicaStatus::Secondary]).await;
        let policy = manager
            .create_policy(PolicyOptions {
                replication_factor: 2,
                max_replication_lag: Duration::from_millis(500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(manager.check_replication_health(&policy.id).await.unwrap().healthy);

        manager.update_replica_status("r1", ReplicaStatus::Secondary, 4096, 900).await.unwrap();
        let health = manager.check_replication_health(&policy.id).await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.replication_lag, 900);
    }

    #[tokio::test]
    async fn test_consistency_levels() {
        let manager = with_replicas(&[ReplicaStatus::Secondary, ReplicaStatus::Syncing]).await;
        let eventual = manager.create_policy(PolicyOptions::default()).await.unwrap();
        let raw = manager
            .create_policy(PolicyOptions { consistency_level: ConsistencyLevel::ReadAfterWrite, ..Default::default() })
            .await
            .unwrap();

        assert!(manager.can_satisfy_consistency(&eventual.id, 5).await.unwrap());
        assert!(manager.can_satisfy_consistency(&raw.id, 1).await.unwrap());
        assert!(!manager.can_satisfy_consistency(&raw.id, 2).await.unwrap());

        manager.update_replica_status("r0", ReplicaStatus::Failed, 0, 0).await.unwrap();
        assert!(!manager.can_satisfy_consistency(&raw.id, 0).await.unwrap());
        assert!(manager.can_satisfy_consistency(&eventual.id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_validation_and_lookups() {
        let manager = manager();
        assert!(manager.create_policy(strong(0)).await.is_err());
        assert!(matches!(manager.check_replication_health("nope").await, Err(SyncError::NotFound(_))));
        assert!(matches!(
            manager.update_replica_status("nope", ReplicaStatus::Primary, 0, 0).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(manager.register_replica(Replica::new("r", "", ReplicaStatus::Primary)).await.is_err());

        manager.register_replica(Replica::new("r1", "a", ReplicaStatus::Primary)).await.unwrap();
        manager.register_replica(Replica::new("r2", "b", ReplicaStatus::Failed)).await.unwrap();
        assert_eq!(manager.get_replicas("a").await.len(), 1);

        let report = manager.get_replication_status().await;
        assert_eq!(report.total_replicas, 2);
        assert_eq!(report.healthy_replicas, 1);
        assert_eq!(report.by_status[&ReplicaStatus::Failed], 1);

        manager.remove_replica("r2").await.unwrap();
        assert!(manager.remove_replica("r2").await.is_err());
    }

    #[tokio::test]
    async fn test_sealed_payload_between_replicas() {
        let primary_crypto = Arc::new(LocalCryptoProvider::with_seed([1; 32]));
        let replica_crypto = Arc::new(LocalCryptoProvider::with_seed([2; 32]));
        let primary_did = primary_crypto.get_local_did().await.unwrap();
        let replica_did = replica_crypto.get_local_did().await.unwrap();

        let primary = ReplicationManager::new(primary_crypto);
        primary
            .register_replica(Replica::new("r1", "node-b", ReplicaStatus::Secondary).with_did(replica_did))
            .await
            .unwrap();
        let sealed = primary.encrypt_for_replica("r1", b"state snapshot").await.unwrap();

        let replica = ReplicationManager::new(replica_crypto);
        assert!(replica.decrypt_from_replica(&sealed).await.is_err());
        replica
            .register_replica(Replica::new("r0", "node-a", ReplicaStatus::Primary).with_did(primary_did))
            .await
            .unwrap();
        assert_eq!(replica.decrypt_from_replica(&sealed).await.unwrap(), b"state snapshot");
    }
}
