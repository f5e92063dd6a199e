/*
    coordinator.rs - SyncCoordinator

    Registry of nodes and sync sessions.

    Liveness:
      a node is healthy iff now - last_heartbeat < heartbeat_timeout (30s by
      default). The heartbeat monitor sweeps the registry on an interval and
      flips stale nodes offline; the flip is published as an event.

    Sessions:
      pending -> active -> completed | failed   (pending -> failed allowed)
      Nothing moves backwards. Reaching a terminal status stamps end_time and
      publishes `sync-completed`.

    Every mutation appends to the event log. Nodes and sessions are written
    through to the record store when one is attached.
*/

use super::events::{EventLog, SyncEvent, SyncEventRecord};
use crate::config::CoordinatorConfig;
use crate::core_crypto::{Capability, CryptoError, CryptoProvider, Did, PublicIdentity};
use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::storage::{collections, RecordStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SESSION_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    #[default]
    None,
    /// Messages are sealed per recipient DID
    EndToEnd,
}

/// Registration request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    pub address: String,
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_identity: Option<PublicIdentity>,
    /// Capability token granting `aeon:node:register`, checked when
    /// capabilities are required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    pub address: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_identity: Option<PublicIdentity>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        *self == next
            || matches!((*self, next), (Pending, Active) | (Pending, Failed) | (Active, Completed) | (Active, Failed))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub initiator_id: String,
    pub participant_ids: Vec<String>,
    pub status: SessionStatus,
    pub items_synced: u64,
    pub items_failed: u64,
    pub conflicts_detected: u64,
    pub encryption_mode: EncryptionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Partial update for `update_sync_session`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub items_synced: Option<u64>,
    pub items_failed: Option<u64>,
    pub conflicts_detected: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub node_id: String,
    pub healthy: bool,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub since_heartbeat_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatistics {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub completed_sessions: usize,
    pub failed_sessions: usize,
    pub total_items_synced: u64,
    pub total_items_failed: u64,
    pub total_conflicts: u64,
}

pub struct SyncCoordinator {
    config: CoordinatorConfig,
    crypto: Arc<dyn CryptoProvider>,
    nodes: RwLock<HashMap<String, Node>>,
    sessions: RwLock<HashMap<String, SyncSession>>,
    events: EventLog,
    store: Option<Arc<dyn RecordStore>>,
}

impl SyncCoordinator {
    pub fn new(config: CoordinatorConfig, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            config,
            crypto,
            nodes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            events: EventLog::new(EVENT_CHANNEL_CAPACITY),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload nodes and sessions written through to the store
    ///
    /// # Returns
    /// The number of nodes and sessions loaded.
    pub async fn load_from_store(&self) -> SyncResult<(usize, usize)> {
        let Some(store) = &self.store else {
            return Ok((0, 0));
        };
        let nodes: Vec<Node> = store
            .list(collections::NODES)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        let sessions: Vec<SyncSession> = store
            .list(collections::SESSIONS)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;

        let counts = (nodes.len(), sessions.len());
        self.nodes.write().await.extend(nodes.into_iter().map(|n| (n.id.clone(), n)));
        self.sessions.write().await.extend(sessions.into_iter().map(|s| (s.id.clone(), s)));
        info!(nodes = counts.0, sessions = counts.1, "Loaded coordinator state");
        Ok(counts)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEventRecord> {
        self.events.subscribe()
    }

    pub async fn get_sync_events(&self, limit: Option<usize>) -> Vec<SyncEventRecord> {
        self.events.tail(limit).await
    }

    async fn persist_node(&self, node: &Node) -> SyncResult<()> {
        if let Some(store) = &self.store {
            store.put(collections::NODES, &node.id, &serde_json::to_value(node)?).await?;
        }
        Ok(())
    }

    async fn persist_session(&self, session: &SyncSession) -> SyncResult<()> {
        if let Some(store) = &self.store {
            store.put(collections::SESSIONS, &session.id, &serde_json::to_value(session)?).await?;
        }
        Ok(())
    }

    async fn publish_online_gauge(&self) {
        let online = self.nodes.read().await.values().filter(|n| n.status == NodeStatus::Online).count();
        ::metrics::gauge!(metrics::NODES_ONLINE).set(online as f64);
    }

    async fn check_registration_token(&self, info: &NodeInfo) -> SyncResult<()> {
        if !self.config.require_capabilities {
            return Ok(());
        }
        let token = info
            .token
            .as_deref()
            .ok_or_else(|| CryptoError::MissingCapability(Capability::NodeRegister.to_string()))?;
        let claims = self.crypto.verify_ucan(token, &[Capability::NodeRegister]).await?;
        match &info.did {
            Some(did) if &claims.aud == did => Ok(()),
            Some(did) => Err(CryptoError::InvalidToken(format!("token audience {} is not {}", claims.aud, did)).into()),
            None => Err(SyncError::InvalidState(format!("node {} has no DID to check the token against", info.id))),
        }
    }

    /// Register (or re-register) a node; it starts online
    pub async fn register_node(&self, info: NodeInfo) -> SyncResult<Node> {
        if info.id.is_empty() {
            return Err(SyncError::InvalidState("node id is empty".into()));
        }
        self.check_registration_token(&info).await?;

        let now = Utc::now();
        let node = Node {
            id: info.id,
            did: info.did,
            address: info.address,
            version: info.version,
            capabilities: info.capabilities,
            status: NodeStatus::Online,
            public_identity: info.public_identity,
            registered_at: now,
            last_heartbeat: now,
        };

        let replaced = self.nodes.write().await.insert(node.id.clone(), node.clone()).is_some();
        self.persist_node(&node).await?;
        self.events.append(SyncEvent::NodeRegistered { node_id: node.id.clone() }).await;
        self.publish_online_gauge().await;
        info!(node_id = %node.id, did = ?node.did, replaced, "Node registered");
        Ok(node)
    }

    pub async fn deregister_node(&self, id: &str) -> SyncResult<()> {
        self.nodes.write().await.remove(id).ok_or_else(|| SyncError::not_found("node", id))?;
        if let Some(store) = &self.store {
            store.delete(collections::NODES, id).await?;
        }
        self.events.append(SyncEvent::NodeDeregistered { node_id: id.to_string() }).await;
        self.publish_online_gauge().await;
        info!(node_id = %id, "Node deregistered");
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn get_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn get_online_nodes(&self) -> Vec<Node> {
        let mut nodes = self.get_nodes().await;
        nodes.retain(|n| n.status == NodeStatus::Online);
        nodes
    }

    pub async fn find_node_by_did(&self, did: &Did) -> Option<Node> {
        self.nodes.read().await.values().find(|n| n.did.as_ref() == Some(did)).cloned()
    }

    pub async fn record_heartbeat(&self, id: &str) -> SyncResult<()> {
        self.record_heartbeat_at(id, Utc::now()).await
    }

    /// Heartbeat observed at `at`; brings an offline node back online
    pub async fn record_heartbeat_at(&self, id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        let (node, revived) = {
            let mut nodes = self.nodes.write().await;
            let node = nodes.get_mut(id).ok_or_else(|| SyncError::not_found("node", id))?;
            node.last_heartbeat = at;
            let revived = node.status == NodeStatus::Offline;
            node.status = NodeStatus::Online;
            (node.clone(), revived)
        };

        self.persist_node(&node).await?;
        self.events.append(SyncEvent::HeartbeatReceived { node_id: id.to_string() }).await;
        if revived {
            self.events.append(SyncEvent::NodeOnline { node_id: id.to_string() }).await;
            self.publish_online_gauge().await;
            info!(node_id = %id, "Node back online");
        }
        Ok(())
    }

    fn is_healthy(&self, node: &Node, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        now - node.last_heartbeat < timeout
    }

    pub async fn get_node_health(&self) -> Vec<NodeHealth> {
        self.get_node_health_at(Utc::now()).await
    }

    pub async fn get_node_health_at(&self, now: DateTime<Utc>) -> Vec<NodeHealth> {
        let nodes = self.nodes.read().await;
        let mut health: Vec<NodeHealth> = nodes
            .values()
            .map(|node| NodeHealth {
                node_id: node.id.clone(),
                healthy: self.is_healthy(node, now),
                status: node.status,
                last_heartbeat: node.last_heartbeat,
                since_heartbeat_ms: (now - node.last_heartbeat).num_milliseconds(),
            })
            .collect();
        health.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        health
    }

    /// Flip online nodes whose heartbeat is stale to offline
    ///
    /// # Returns
    /// Ids of the nodes that went offline.
    pub async fn check_heartbeats_at(&self, now: DateTime<Utc>) -> SyncResult<Vec<String>> {
        let stale: Vec<Node> = {
            let mut nodes = self.nodes.write().await;
            nodes
                .values_mut()
                .filter(|n| n.status == NodeStatus::Online && !self.is_healthy(n, now))
                .map(|n| {
                    n.status = NodeStatus::Offline;
                    n.clone()
                })
                .collect()
        };

        for node in &stale {
            warn!(node_id = %node.id, last_heartbeat = %node.last_heartbeat, "Node missed heartbeat deadline");
            self.persist_node(node).await?;
            self.events.append(SyncEvent::NodeOffline { node_id: node.id.clone() }).await;
        }
        if !stale.is_empty() {
            self.publish_online_gauge().await;
        }
        Ok(stale.into_iter().map(|n| n.id).collect())
    }

    /// Sweep heartbeats every `heartbeat_interval` until shutdown
    pub fn start_heartbeat_monitoring(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> JoinHandle<()> {
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_heartbeats_at(Utc::now()).await {
                            warn!(error = %e, "Heartbeat sweep failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Heartbeat monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Open a pending session
    ///
    /// Fails with `NotFound` when the initiator is not registered.
    pub async fn create_sync_session(&self, initiator_id: &str, participant_ids: Vec<String>) -> SyncResult<SyncSession> {
        if !self.nodes.read().await.contains_key(initiator_id) {
            return Err(SyncError::not_found("node", initiator_id));
        }
        self.open_session(initiator_id.to_string(), participant_ids, EncryptionMode::None, None).await
    }

    /// Open a session between nodes named by DID
    ///
    /// When a local identity is loaded, a token scoped to sync read/write is
    /// minted for the initiator and stored on the session.
    pub async fn create_authenticated_session(
        &self,
        initiator_did: &Did,
        participant_dids: &[Did],
        encryption_mode: EncryptionMode,
    ) -> SyncResult<SyncSession> {
        let initiator = self
            .find_node_by_did(initiator_did)
            .await
            .ok_or_else(|| SyncError::not_found("node with DID", initiator_did.as_str()))?;

        let mut participants = Vec::with_capacity(participant_dids.len());
        for did in participant_dids {
            let node = self
                .find_node_by_did(did)
                .await
                .ok_or_else(|| SyncError::not_found("node with DID", did.as_str()))?;
            participants.push(node.id);
        }

        let token = if self.crypto.is_initialized().await {
            Some(
                self.crypto
                    .create_ucan(initiator_did, &Capability::session_scope(), SESSION_TOKEN_TTL)
                    .await?,
            )
        } else {
            None
        };

        self.open_session(initiator.id, participants, encryption_mode, token).await
    }

    async fn open_session(
        &self,
        initiator_id: String,
        participant_ids: Vec<String>,
        encryption_mode: EncryptionMode,
        session_token: Option<String>,
    ) -> SyncResult<SyncSession> {
        let session = SyncSession {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            initiator_id,
            participant_ids,
            status: SessionStatus::Pending,
            items_synced: 0,
            items_failed: 0,
            conflicts_detected: 0,
            encryption_mode,
            session_token,
            start_time: Utc::now(),
            end_time: None,
        };

        self.sessions.write().await.insert(session.id.clone(), session.clone());
        self.persist_session(&session).await?;
        self.events
            .append(SyncEvent::SessionCreated {
                session_id: session.id.clone(),
                initiator_id: session.initiator_id.clone(),
            })
            .await;
        debug!(session_id = %session.id, participants = session.participant_ids.len(), "Sync session created");
        Ok(session)
    }

    /// Apply a partial update
    ///
    /// Fails with `InvalidState` on a backwards transition or any change to a
    /// finished session.
    pub async fn update_sync_session(&self, id: &str, update: SessionUpdate) -> SyncResult<SyncSession> {
        let (session, finished) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id).ok_or_else(|| SyncError::not_found("session", id))?;
            if session.status.is_terminal() {
                return Err(SyncError::InvalidState(format!("session {} is already {:?}", id, session.status)));
            }

            let next = update.status.unwrap_or(session.status);
            if !session.status.can_transition_to(next) {
                return Err(SyncError::InvalidState(format!(
                    "session {} cannot move from {:?} to {:?}",
                    id, session.status, next
                )));
            }

            if let Some(n) = update.items_synced {
                session.items_synced = n;
            }
            if let Some(n) = update.items_failed {
                session.items_failed = n;
            }
            if let Some(n) = update.conflicts_detected {
                session.conflicts_detected = n;
            }
            session.status = next;
            if next.is_terminal() {
                session.end_time = Some(Utc::now());
            }
            (session.clone(), next.is_terminal())
        };

        self.persist_session(&session).await?;
        self.events
            .append(SyncEvent::SessionUpdated { session_id: session.id.clone(), status: session.status })
            .await;
        if finished {
            self.events
                .append(SyncEvent::SyncCompleted {
                    session_id: session.id.clone(),
                    status: session.status,
                    items_synced: session.items_synced,
                    items_failed: session.items_failed,
                })
                .await;
            info!(
                session_id = %session.id,
                status = ?session.status,
                synced = session.items_synced,
                failed = session.items_failed,
                "Sync session finished"
            );
        }
        Ok(session)
    }

    pub async fn record_conflict(&self, session_id: &str, node_id: &str, data: Value) -> SyncResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| SyncError::not_found("session", session_id))?;
            session.conflicts_detected += 1;
            session.clone()
        };
        self.persist_session(&session).await?;
        self.events
            .append(SyncEvent::ConflictRecorded {
                session_id: session_id.to_string(),
                node_id: node_id.to_string(),
                data,
            })
            .await;
        Ok(())
    }

    pub async fn get_sync_session(&self, id: &str) -> Option<SyncSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_statistics(&self) -> CoordinatorStatistics {
        let nodes = self.nodes.read().await;
        let sessions = self.sessions.read().await;

        let online_nodes = nodes.values().filter(|n| n.status == NodeStatus::Online).count();
        let count = |status| sessions.values().filter(|s| s.status == status).count();
        CoordinatorStatistics {
            total_nodes: nodes.len(),
            online_nodes,
            offline_nodes: nodes.len() - online_nodes,
            total_sessions: sessions.len(),
            active_sessions: count(SessionStatus::Active),
            completed_sessions: count(SessionStatus::Completed),
            failed_sessions: count(SessionStatus::Failed),
            total_items_synced: sessions.values().map(|s| s.items_synced).sum(),
            total_items_failed: sessions.values().map(|s| s.items_failed).sum(),
            total_conflicts: sessions.values().map(|s| s.conflicts_detected).sum(),
        }
    }

    /// Drop every node, session and event. Test harnesses only.
    pub async fn reset(&self) -> SyncResult<()> {
        self.nodes.write().await.clear();
        self.sessions.write().await.clear();
        self.events.clear().await;
        if let Some(store) = &self.store {
            store.clear(collections::NODES).await?;
            store.clear(collections::SESSIONS).await?;
        }
        self.events.append(SyncEvent::Reset).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::{LocalCryptoProvider, NullCryptoProvider};
    use crate::storage::MemoryRecordStore;
    use serde_json::json;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new(CoordinatorConfig::default(), Arc::new(NullCryptoProvider))
    }

    fn info(id: &str) -> NodeInfo {
        NodeInfo { id: id.into(), address: format!("mem://{}", id), version: "1.0.0".into(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let coordinator = coordinator();
        let node = coordinator.register_node(info("a")).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(coordinator.get_online_nodes().await.len(), 1);

        coordinator.deregister_node("a").await.unwrap();
        assert!(coordinator.get_node("a").await.is_none());
        assert!(matches!(coordinator.deregister_node("a").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_reports_unhealthy() {
        let coordinator = coordinator();
        coordinator.register_node(info("a")).await.unwrap();
        coordinator.register_node(info("b")).await.unwrap();

        let now = Utc::now();
        coordinator.record_heartbeat_at("a", now - chrono::Duration::seconds(31)).await.unwrap();
        coordinator.record_heartbeat_at("b", now - chrono::Duration::seconds(5)).await.unwrap();

        let health = coordinator.get_node_health_at(now).await;
        assert!(!health[0].healthy);
        assert!(health[0].since_heartbeat_ms >= 31_000);
        assert!(health[1].healthy);
    }

    #[tokio::test]
    async fn test_sweep_flips_offline_and_heartbeat_revives() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();
        coordinator.register_node(info("a")).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(coordinator.check_heartbeats_at(later).await.unwrap(), vec!["a".to_string()]);
        assert_eq!(coordinator.get_node("a").await.unwrap().status, NodeStatus::Offline);
        assert!(coordinator.check_heartbeats_at(later).await.unwrap().is_empty());

        coordinator.record_heartbeat_at("a", later).await.unwrap();
        assert_eq!(coordinator.get_node("a").await.unwrap().status, NodeStatus::Online);

        let mut seen = Vec::new();
        while let Ok(record) = events.try_recv() {
            seen.push(record.event);
        }
        assert!(seen.contains(&SyncEvent::NodeOffline { node_id: "a".into() }));
        assert!(seen.contains(&SyncEvent::NodeOnline { node_id: "a".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_shutdown() {
        let coordinator = Arc::new(SyncCoordinator::new(
            CoordinatorConfig { heartbeat_interval: Duration::from_millis(10), ..Default::default() },
            Arc::new(NullCryptoProvider),
        ));
        let (tx, rx) = broadcast::channel(1);
        let handle = coordinator.clone().start_heartbeat_monitoring(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_requires_registered_initiator() {
        let coordinator = coordinator();
        let result = coordinator.create_sync_session("ghost", vec![]).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let coordinator = coordinator();
        coordinator.register_node(info("a")).await.unwrap();
        let session = coordinator.create_sync_session("a", vec!["b".into()]).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        let active = SessionUpdate { status: Some(SessionStatus::Active), ..Default::default() };
        coordinator.update_sync_session(&session.id, active).await.unwrap();

        let backwards = SessionUpdate { status: Some(SessionStatus::Pending), ..Default::default() };
        assert!(matches!(
            coordinator.update_sync_session(&session.id, backwards).await,
            Err(SyncError::InvalidState(_))
        ));

        coordinator.record_conflict(&session.id, "b", json!({"op": "doc-1"})).await.unwrap();
        let done = SessionUpdate {
            status: Some(SessionStatus::Completed),
            items_synced: Some(7),
            items_failed: Some(1),
            ..Default::default()
        };
        let finished = coordinator.update_sync_session(&session.id, done).await.unwrap();
        assert!(finished.end_time.is_some());
        assert_eq!(finished.conflicts_detected, 1);

        assert!(coordinator.update_sync_session(&session.id, SessionUpdate::default()).await.is_err());

        let events = coordinator.get_sync_events(Some(1)).await;
        assert!(matches!(events[0].event, SyncEvent::SyncCompleted { items_synced: 7, .. }));

        let stats = coordinator.get_statistics().await;
        assert_eq!(stats.completed_sessions, 1);
        assert_eq!(stats.total_items_synced, 7);
        assert_eq!(stats.total_conflicts, 1);
    }

    #[tokio::test]
    async fn test_authenticated_session_mints_token() {
        let crypto = Arc::new(LocalCryptoProvider::with_seed([7; 32]));
        let coordinator = SyncCoordinator::new(CoordinatorConfig::default(), crypto.clone());

        let alice = Did::new("did:key:zAlice");
        let bob = Did::new("did:key:zBob");
        coordinator.register_node(NodeInfo { did: Some(alice.clone()), ..info("a") }).await.unwrap();
        coordinator.register_node(NodeInfo { did: Some(bob.clone()), ..info("b") }).await.unwrap();

        let session = coordinator
            .create_authenticated_session(&alice, &[bob], EncryptionMode::EndToEnd)
            .await
            .unwrap();
        assert_eq!(session.participant_ids, vec!["b".to_string()]);
        assert_eq!(session.encryption_mode, EncryptionMode::EndToEnd);

        let token = session.session_token.unwrap();
        let claims = crypto.verify_ucan(&token, &[Capability::SyncWrite]).await.unwrap();
        assert_eq!(claims.aud, alice);

        let stranger = Did::new("did:key:zNobody");
        assert!(coordinator.create_authenticated_session(&stranger, &[], EncryptionMode::None).await.is_err());
    }

    #[tokio::test]
    async fn test_registration_token_required() {
        let authority = Arc::new(LocalCryptoProvider::with_seed([8; 32]));
        let coordinator = SyncCoordinator::new(
            CoordinatorConfig { require_capabilities: true, ..Default::default() },
            authority.clone(),
        );
        let did = Did::new("did:key:zNode");

        assert!(coordinator.register_node(NodeInfo { did: Some(did.clone()), ..info("a") }).await.is_err());

        let token = authority
            .create_ucan(&did, &[Capability::NodeRegister], Duration::from_secs(60))
            .await
            .unwrap();
        let node = NodeInfo { did: Some(did), token: Some(token), ..info("a") };
        assert!(coordinator.register_node(node).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_through_and_reset() {
        let store = Arc::new(MemoryRecordStore::new());
        let coordinator = coordinator().with_store(store.clone());
        coordinator.register_node(info("a")).await.unwrap();
        coordinator.create_sync_session("a", vec![]).await.unwrap();

        let reloaded = SyncCoordinator::new(CoordinatorConfig::default(), Arc::new(NullCryptoProvider))
            .with_store(store.clone());
        assert_eq!(reloaded.load_from_store().await.unwrap(), (1, 1));

        coordinator.reset().await.unwrap();
        assert_eq!(store.count(collections::NODES).await, 0);
        assert_eq!(coordinator.get_statistics().await.total_nodes, 0);
        assert_eq!(coordinator.get_sync_events(None).await.len(), 1);
    }
}
