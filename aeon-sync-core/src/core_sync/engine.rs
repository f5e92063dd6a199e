/*
    engine.rs - SyncEngine

    Drives one node's side of the sync control flow:

        submit ──► queue ──► flush:  next_batch ─► mark_syncing
                                       │
                                       ▼
                        delta reduce ─► compress ─► sign / seal ─► send
                                       │
                         await ack | sync-response | error  (request_timeout)
                                       │
                        mark_synced / mark_failed (retryable) ─► session update

        transport ──► handle_incoming: verify ─► decompress ─► rebuild deltas
                        ─► duplicate? ack : conflict check ─► apply ─► reply

    The engine never holds its state lock across a transport await. Applied
    document state is keyed by operation id; a retransmitted operation whose
    content hash matches the applied state is acknowledged without being
    applied again.
*/

use super::backoff::Backoff;
use super::coordinator::{SessionStatus, SessionUpdate, SyncCoordinator};
use super::replication::ReplicationManager;
use crate::config::{BandwidthConfig, Config, FeatureFlags, SyncConfig};
use crate::core_bandwidth::{
    AdaptiveCompressionOptimizer, BatchRequest, BatchTimingOptimizer, CompressionEngine, DeltaOperation,
    DeltaSyncOptimizer, DeviceProfile, NetworkSample, SchedulingDecision, TransferSample,
};
use crate::core_conflict::{content_hash, Conflict, ConflictResolver, ConflictStatistics, Resolution, ResolutionStrategy};
use crate::core_crypto::{Capability, CryptoProvider, Did};
use crate::core_protocol::{
    ConflictNotice, HandshakePayload, MessageType, OperationHeader, Payload, SyncMessage, SyncProtocol,
    SyncRequestPayload, SyncResponsePayload, SyncTransport,
};
use crate::core_queue::{Operation, OperationPriority, OperationStatus, SyncQueue};
use crate::errors::{SyncError, SyncResult};
use crate::metrics::{self, Timer};
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ERR_VERIFICATION: &str = "verification-failed";
const ERR_UNAUTHORIZED: &str = "unauthorized";
const ERR_BAD_BATCH: &str = "bad-batch";
const ERR_HANDSHAKE: &str = "handshake-rejected";

/// Longest a low-priority batch may be held back by the timing optimizer
const MAX_BATCH_WAIT: Duration = Duration::from_secs(30);

/// Last applied state of one operation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub session_id: String,
    pub data: Value,
    pub hash: String,
    /// Node that produced this state
    pub origin: String,
    pub updated_at: DateTime<Utc>,
}

impl DocumentState {
    fn new(id: &str, op_type: &str, session_id: &str, data: Value, origin: &str) -> Self {
        Self {
            id: id.to_string(),
            op_type: op_type.to_string(),
            session_id: session_id.to_string(),
            hash: content_hash(&data),
            data,
            origin: origin.to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Outcome of one `flush` round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub synced: Vec<String>,
    /// Returned to pending for another attempt
    pub failed: Vec<String>,
    /// Retry budget exhausted
    pub exhausted: Vec<String>,
    pub conflicts: Vec<ConflictNotice>,
    pub bytes_original: usize,
    pub bytes_sent: usize,
    pub duration_ms: f64,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.message_id.is_none()
    }
}

struct EngineState {
    delta_out: DeltaSyncOptimizer,
    delta_in: DeltaSyncOptimizer,
    compression: CompressionEngine,
    resolver: ConflictResolver,
    adaptive: AdaptiveCompressionOptimizer,
    timing: BatchTimingOptimizer,
    documents: HashMap<String, DocumentState>,
}

impl EngineState {
    fn new(bandwidth: &BandwidthConfig, features: &FeatureFlags) -> Self {
        let compression = if features.compression {
            CompressionEngine::new(bandwidth.default_compression_level, bandwidth.min_compression_size)
        } else {
            CompressionEngine::disabled()
        };
        Self {
            delta_out: DeltaSyncOptimizer::new(bandwidth.full_operation_threshold),
            delta_in: DeltaSyncOptimizer::new(bandwidth.full_operation_threshold),
            compression,
            resolver: ConflictResolver::new(bandwidth.merge_similarity_threshold),
            adaptive: AdaptiveCompressionOptimizer::new(bandwidth.default_compression_level, DeviceProfile::detect()),
            timing: BatchTimingOptimizer::new(MAX_BATCH_WAIT),
            documents: HashMap::new(),
        }
    }
}

pub struct SyncEngine {
    node_id: String,
    config: SyncConfig,
    features: FeatureFlags,
    queue: Arc<dyn SyncQueue>,
    protocol: Arc<SyncProtocol>,
    coordinator: Option<Arc<SyncCoordinator>>,
    replication: Option<(Arc<ReplicationManager>, String)>,
    /// Capability token this node presents in its handshakes
    capability_token: Option<String>,
    peers: RwLock<HashMap<String, HandshakePayload>>,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    pub fn new(
        node_id: impl Into<String>,
        config: &Config,
        queue: Arc<dyn SyncQueue>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        let node_id = node_id.into();
        let features = config.features.clone();

        let mut offered = Vec::new();
        if features.compression {
            offered.push("compression".to_string());
        }
        if features.delta_sync {
            offered.push("delta-sync".to_string());
        }
        if features.encryption {
            offered.push("encryption".to_string());
        }
        let protocol = SyncProtocol::new(node_id.clone(), crypto)
            .with_features(offered)
            .with_required_signatures(features.capability_verification);

        Self {
            state: Mutex::new(EngineState::new(&config.bandwidth, &features)),
            node_id,
            config: config.sync.clone(),
            features,
            queue,
            protocol: Arc::new(protocol),
            coordinator: None,
            replication: None,
            capability_token: None,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Open a coordinator session for every flush
    pub fn with_coordinator(mut self, coordinator: Arc<SyncCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Refuse to flush while `policy_id` cannot be satisfied
    pub fn with_replication(mut self, manager: Arc<ReplicationManager>, policy_id: impl Into<String>) -> Self {
        self.replication = Some((manager, policy_id.into()));
        self
    }

    pub fn with_capability_token(mut self, token: impl Into<String>) -> Self {
        self.capability_token = Some(token.into());
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn protocol(&self) -> &Arc<SyncProtocol> {
        &self.protocol
    }

    pub fn queue(&self) -> &Arc<dyn SyncQueue> {
        &self.queue
    }

    fn required_capabilities(&self) -> Vec<Capability> {
        if self.features.capability_verification {
            vec![Capability::SyncWrite]
        } else {
            Vec::new()
        }
    }

    /// Queue a local write and record it as the current local state
    pub async fn submit(&self, op: Operation) -> SyncResult<String> {
        let document = DocumentState::new(&op.id, &op.op_type, &op.session_id, op.data.clone(), &self.node_id);
        let id = self.queue.submit(op).await?;
        self.state.lock().await.documents.insert(id.clone(), document);
        Ok(id)
    }

    pub async fn get_state(&self, operation_id: &str) -> Option<DocumentState> {
        self.state.lock().await.documents.get(operation_id).cloned()
    }

    pub async fn known_peer(&self, node_id: &str) -> Option<HandshakePayload> {
        self.peers.read().await.get(node_id).cloned()
    }

    pub async fn compression_level(&self) -> u8 {
        self.state.lock().await.compression.level()
    }

    /// Whether a batch should go out now or wait for better conditions
    pub async fn schedule(&self, request: &BatchRequest) -> SchedulingDecision {
        self.state.lock().await.timing.decide(request)
    }

    pub async fn get_unresolved_conflicts(&self) -> Vec<Conflict> {
        self.state.lock().await.resolver.get_unresolved_conflicts()
    }

    pub async fn get_conflict_statistics(&self) -> ConflictStatistics {
        self.state.lock().await.resolver.get_statistics()
    }

    /// Settle a conflict and adopt the resolved data as the document state
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolved_data: Option<Value>,
    ) -> Option<Resolution> {
        let mut state = self.state.lock().await;
        let resolution = state.resolver.resolve_conflict(conflict_id, strategy, resolved_data)?;
        let conflict = state.resolver.get_conflict(conflict_id)?.clone();

        let op_type = state
            .documents
            .get(&conflict.operation_id)
            .map(|doc| doc.op_type.clone())
            .unwrap_or_else(|| "update".to_string());
        let document = DocumentState::new(
            &conflict.operation_id,
            &op_type,
            &conflict.session_id,
            resolution.resolved_data.clone(),
            &self.node_id,
        );
        state.documents.insert(conflict.operation_id.clone(), document);
        Some(resolution)
    }

    /// Exchange handshakes with `peer` and remember its identity
    pub async fn handshake(&self, transport: &dyn SyncTransport, peer: &str) -> SyncResult<HandshakePayload> {
        let payload = self.protocol.create_handshake_payload(self.capability_token.clone()).await;
        let message = self.protocol.create_handshake_message(peer, payload);
        let message = self.protocol.sign_message(message, None).await?;
        self.send(transport, &message).await?;

        let reply = self.await_reply(transport, peer, &message.message_id, MessageType::Handshake).await?;
        let handshake = self.protocol.verify_handshake(&reply, &self.required_capabilities()).await?;
        if handshake.node_id != peer {
            return Err(SyncError::Protocol(format!("expected handshake from {}, got {}", peer, handshake.node_id)));
        }
        info!(peer = %peer, did = ?handshake.did, "Peer handshake complete");
        self.peers.write().await.insert(handshake.node_id.clone(), handshake.clone());
        Ok(handshake)
    }

    async fn recipient_for(&self, peer: &str) -> SyncResult<Option<Did>> {
        if !self.features.encryption || !self.protocol.crypto().is_initialized().await {
            return Ok(None);
        }
        self.peers
            .read()
            .await
            .get(peer)
            .and_then(|h| h.did.clone())
            .map(Some)
            .ok_or_else(|| SyncError::InvalidState(format!("no verified handshake with {} to encrypt for", peer)))
    }

    async fn check_consistency(&self) -> SyncResult<()> {
        let Some((manager, policy_id)) = &self.replication else {
            return Ok(());
        };
        if manager.can_satisfy_consistency(policy_id, 1).await? {
            Ok(())
        } else {
            Err(SyncError::RetryableSync(format!("replication policy {} cannot be satisfied", policy_id)))
        }
    }

    async fn open_session(&self, peer: &str) -> SyncResult<Option<String>> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(None);
        };
        let session = coordinator.create_sync_session(&self.node_id, vec![peer.to_string()]).await?;
        let update = SessionUpdate { status: Some(SessionStatus::Active), ..Default::default() };
        coordinator.update_sync_session(&session.id, update).await?;
        Ok(Some(session.id))
    }

    async fn close_session(&self, session_id: Option<&str>, peer: &str, report: &FlushReport, ok: bool) {
        let (Some(coordinator), Some(session_id)) = (&self.coordinator, session_id) else {
            return;
        };
        for notice in &report.conflicts {
            let data = json!({
                "operationId": notice.operation_id,
                "conflictId": notice.conflict_id,
                "autoResolved": notice.auto_resolved,
            });
            if let Err(e) = coordinator.record_conflict(session_id, peer, data).await {
                warn!(session_id = %session_id, error = %e, "Could not record conflict");
            }
        }
        let update = SessionUpdate {
            status: Some(if ok { SessionStatus::Completed } else { SessionStatus::Failed }),
            items_synced: Some(report.synced.len() as u64),
            items_failed: Some((report.failed.len() + report.exhausted.len()) as u64),
            conflicts_detected: Some(report.conflicts.len() as u64),
        };
        if let Err(e) = coordinator.update_sync_session(session_id, update).await {
            warn!(session_id = %session_id, error = %e, "Could not close sync session");
        }
    }

    /// Send one batch of pending operations to `peer` and settle it
    ///
    /// On timeout or transport failure every operation in the batch goes
    /// back through `mark_failed` and the retryable error is returned.
    pub async fn flush(&self, transport: &dyn SyncTransport, peer: &str) -> SyncResult<FlushReport> {
        self.check_consistency().await?;
        let recipient = self.recipient_for(peer).await?;

        let batch = self.queue.next_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let timer = Timer::new(metrics::FLUSH_DURATION);
        let started = Instant::now();

        let session_id = self.open_session(peer).await?;
        let ids: Vec<String> = batch.iter().map(|op| op.id.clone()).collect();
        self.queue.mark_syncing(&ids).await?;

        let mut report = FlushReport { session_id: session_id.clone(), ..Default::default() };
        let sent = self.send_batch(transport, peer, &batch, session_id.as_deref(), recipient.as_ref(), &mut report).await;

        let outcome = match sent {
            Ok(message_id) => {
                report.message_id = Some(message_id.clone());
                self.await_reply(transport, peer, &message_id, MessageType::Ack).await
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(reply) => self.settle(&ids, reply, &mut report).await,
            Err(e) => {
                self.fail_all(&ids, &e.to_string(), &mut report).await;
                Err(e)
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        report.duration_ms = elapsed_ms;
        self.record_transfer(elapsed_ms, report.bytes_sent, result.is_ok()).await;
        self.close_session(session_id.as_deref(), peer, &report, result.is_ok()).await;
        timer.stop();

        info!(
            peer = %peer,
            synced = report.synced.len(),
            failed = report.failed.len(),
            exhausted = report.exhausted.len(),
            conflicts = report.conflicts.len(),
            duration_ms = elapsed_ms,
            "Flush finished"
        );
        result.map(|_| report)
    }

    async fn send_batch(
        &self,
        transport: &dyn SyncTransport,
        peer: &str,
        batch: &[Operation],
        session_id: Option<&str>,
        recipient: Option<&Did>,
        report: &mut FlushReport,
    ) -> SyncResult<String> {
        let payload = {
            let mut state = self.state.lock().await;
            let deltas: Vec<DeltaOperation> = if self.features.delta_sync {
                state.delta_out.compute_batch(batch)
            } else {
                batch.iter().map(DeltaOperation::full).collect()
            };
            let encoded = serde_json::to_vec(&deltas)?;
            let compressed = state.compression.compress(&encoded);
            report.bytes_original = encoded.len();
            report.bytes_sent = compressed.compressed_size;

            SyncRequestPayload {
                session_id: session_id.map_or_else(|| format!("flush-{}", uuid::Uuid::new_v4()), str::to_string),
                operations: deltas
                    .iter()
                    .map(|d| OperationHeader { id: d.id.clone(), delta_type: d.delta_type })
                    .collect(),
                batch: compressed,
            }
        };

        let message = self.protocol.create_sync_request_message(peer, payload);
        let message = self.protocol.sign_message(message, recipient).await?;
        self.send(transport, &message).await?;
        debug!(peer = %peer, message_id = %message.message_id, operations = batch.len(), "Sync request sent");
        Ok(message.message_id)
    }

    async fn settle(&self, ids: &[String], reply: SyncMessage, report: &mut FlushReport) -> SyncResult<()> {
        let (accepted, notices): (HashSet<String>, Vec<ConflictNotice>) = match reply.payload {
            Payload::Ack(ack) => (ack.operation_ids.into_iter().collect(), Vec::new()),
            Payload::SyncResponse(response) => {
                let mut accepted: HashSet<String> = response.applied.into_iter().collect();
                accepted.extend(response.conflicts.iter().filter(|c| c.auto_resolved).map(|c| c.operation_id.clone()));
                (accepted, response.conflicts)
            }
            other => {
                return Err(SyncError::Protocol(format!("unexpected {:?} reply to a sync request", other.message_type())))
            }
        };

        for id in ids {
            if accepted.contains(id) {
                self.queue.mark_synced(id).await?;
                report.synced.push(id.clone());
            } else {
                let reason = match notices.iter().find(|n| &n.operation_id == id) {
                    Some(notice) => format!("unresolved conflict {}", notice.conflict_id),
                    None => "not acknowledged by peer".to_string(),
                };
                self.fail_one(id, &reason, report).await;
            }
        }
        report.conflicts = notices;
        Ok(())
    }

    async fn fail_all(&self, ids: &[String], reason: &str, report: &mut FlushReport) {
        for id in ids {
            self.fail_one(id, reason, report).await;
        }
    }

    async fn fail_one(&self, id: &str, reason: &str, report: &mut FlushReport) {
        // The peer may not hold the snapshot a later delta would build on
        self.state.lock().await.delta_out.forget(id);
        match self.queue.mark_failed(id, reason).await {
            Ok(OperationStatus::Failed) => {
                warn!(operation_id = %id, reason = %reason, "Operation exhausted its retries");
                report.exhausted.push(id.to_string());
            }
            Ok(_) => report.failed.push(id.to_string()),
            Err(e) => warn!(operation_id = %id, error = %e, "Could not mark operation failed"),
        }
    }

    async fn record_transfer(&self, duration_ms: f64, bytes: usize, success: bool) {
        let mut state = self.state.lock().await;
        state.timing.record_transfer(TransferSample { duration_ms, bytes, success });
        if !success {
            return;
        }

        // bits per millisecond == kilobits per second
        let bandwidth_kbps = (bytes as f64 * 8.0) / duration_ms.max(1.0);
        state.timing.update_network(duration_ms, bandwidth_kbps);
        state.adaptive.record_network_sample(NetworkSample { bandwidth_kbps, latency_ms: duration_ms });

        if self.features.compression {
            let recommendation = state.adaptive.recommend();
            if state.adaptive.apply(&recommendation) {
                state.compression.set_level(recommendation.level);
            }
        }
    }

    async fn send(&self, transport: &dyn SyncTransport, message: &SyncMessage) -> SyncResult<()> {
        let frame = self.protocol.serialize_message(message).await?;
        transport.send(frame).await
    }

    /// Wait for the answer to `request_id`, serving unrelated traffic meanwhile
    async fn await_reply(
        &self,
        transport: &dyn SyncTransport,
        peer: &str,
        request_id: &str,
        expected: MessageType,
    ) -> SyncResult<SyncMessage> {
        let deadline = Instant::now() + self.config.request_timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, transport.recv()).await {
                Err(_) => {
                    return Err(SyncError::RetryableSync(format!(
                        "no reply from {} within {:?}",
                        peer, self.config.request_timeout
                    )))
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => return Err(SyncError::RetryableSync(format!("{} hung up", peer))),
                Ok(Ok(Some(frame))) => frame,
            };
            let message = match self.protocol.deserialize_message(&frame).await {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "Dropping frame while awaiting reply");
                    continue;
                }
            };

            if message.message_type == MessageType::Handshake {
                if expected == MessageType::Handshake && message.sender == peer {
                    return Ok(message);
                }
                if let Some(reply) = self.handle_incoming(&message).await? {
                    self.send(transport, &reply).await?;
                }
                continue;
            }

            let verified = self.protocol.verify_message(&message).await;
            let Some(payload) = verified.payload.filter(|_| verified.valid) else {
                debug!(message_id = %message.message_id, "Dropping unverifiable message while awaiting reply");
                continue;
            };

            let answers = match &payload {
                Payload::Ack(ack) => ack.acked_message_id == request_id,
                Payload::SyncResponse(response) => response.request_id == request_id,
                Payload::Error(error) => error.related_message_id.as_deref() == Some(request_id),
                _ => false,
            };
            if !answers || message.sender != peer {
                if let Some(reply) = self.dispatch(&message, payload).await? {
                    self.send(transport, &reply).await?;
                }
                continue;
            }

            if let Payload::Error(error) = &payload {
                let reason = format!("{} rejected {}: {} ({})", peer, request_id, error.message, error.code);
                return Err(if error.retryable { SyncError::RetryableSync(reason) } else { SyncError::Protocol(reason) });
            }
            return Ok(SyncMessage { payload, auth: None, ..message });
        }
    }

    async fn sign_reply(&self, reply: SyncMessage, seal_for: Option<&Did>) -> SyncResult<SyncMessage> {
        self.protocol.sign_message(reply, seal_for).await
    }

    async fn error_reply(&self, to: &SyncMessage, code: &str, reason: &str, retryable: bool) -> SyncResult<SyncMessage> {
        let reply = self.protocol.create_error_message(&to.sender, code, reason, retryable, Some(&to.message_id));
        self.sign_reply(reply, None).await
    }

    /// Verify and act on one incoming message
    ///
    /// # Returns
    /// The reply to send back, if any. Verification failures become `error`
    /// replies rather than `Err`.
    pub async fn handle_incoming(&self, message: &SyncMessage) -> SyncResult<Option<SyncMessage>> {
        if message.message_type == MessageType::Handshake {
            return match self.protocol.verify_handshake(message, &self.required_capabilities()).await {
                Ok(handshake) => {
                    info!(peer = %handshake.node_id, "Accepted handshake");
                    self.peers.write().await.insert(handshake.node_id.clone(), handshake);
                    let payload = self.protocol.create_handshake_payload(self.capability_token.clone()).await;
                    let reply = self.protocol.create_handshake_message(&message.sender, payload);
                    Ok(Some(self.sign_reply(reply, None).await?))
                }
                Err(e) => {
                    warn!(peer = %message.sender, error = %e, "Rejected handshake");
                    Ok(Some(self.error_reply(message, ERR_HANDSHAKE, &e.to_string(), false).await?))
                }
            };
        }

        let verified = self.protocol.verify_message(message).await;
        match verified.payload.filter(|_| verified.valid) {
            Some(payload) => self.dispatch(message, payload).await,
            None => {
                let reason = verified.error.unwrap_or_default();
                Ok(Some(self.error_reply(message, ERR_VERIFICATION, &reason, true).await?))
            }
        }
    }

    async fn dispatch(&self, message: &SyncMessage, payload: Payload) -> SyncResult<Option<SyncMessage>> {
        match payload {
            Payload::SyncRequest(request) => self.apply_request(message, request).await,
            Payload::Ack(_) | Payload::SyncResponse(_) => {
                debug!(message_id = %message.message_id, "Ignoring reply to no pending request");
                Ok(None)
            }
            Payload::Error(error) => {
                warn!(peer = %message.sender, code = %error.code, reason = %error.message, "Peer reported an error");
                Ok(None)
            }
            Payload::Handshake(_) | Payload::Sealed(_) => Ok(None),
        }
    }

    async fn apply_request(&self, message: &SyncMessage, request: SyncRequestPayload) -> SyncResult<Option<SyncMessage>> {
        if self.features.capability_verification && !self.peers.read().await.contains_key(&message.sender) {
            return Ok(Some(self.error_reply(message, ERR_UNAUTHORIZED, "no verified handshake", false).await?));
        }
        // Replies to sealed requests are sealed for the verified signer
        let seal_for = message.auth.as_ref().filter(|auth| auth.encrypted).map(|auth| auth.signer_did.clone());

        let mut applied = Vec::new();
        let mut conflicts = Vec::new();
        {
            let mut state = self.state.lock().await;
            let decoded = state
                .compression
                .decompress(&request.batch)
                .and_then(|bytes| Ok(serde_json::from_slice::<Vec<DeltaOperation>>(&bytes)?));
            let deltas = match decoded {
                Ok(deltas) => deltas,
                Err(e) => {
                    drop(state);
                    return Ok(Some(self.error_reply(message, ERR_BAD_BATCH, &e.to_string(), false).await?));
                }
            };

            for delta in deltas {
                let rebuilt = state.delta_in.decompress_delta(&delta);
                let remote = Operation::new(
                    delta.op_type.clone(),
                    delta.session_id.clone(),
                    rebuilt.data,
                    OperationPriority::Normal,
                    0,
                )
                .with_id(delta.id.clone());
                let hash = content_hash(&remote.data);

                let duplicate = state
                    .documents
                    .get(&remote.id)
                    .is_some_and(|doc| doc.hash == hash && doc.op_type == remote.op_type);
                if duplicate {
                    debug!(operation_id = %remote.id, "Operation already applied");
                    applied.push(remote.id);
                    continue;
                }

                let local = self
                    .queue
                    .operation(&remote.id)
                    .await?
                    .filter(|op| matches!(op.status, OperationStatus::Pending | OperationStatus::Syncing));

                let data = match local.and_then(|local| state.resolver.detect_conflict(&local, &remote)) {
                    None => Some(remote.data.clone()),
                    Some(conflict) => {
                        let resolved = conflict.resolution.as_ref().map(|r| r.resolved_data.clone());
                        conflicts.push(ConflictNotice {
                            operation_id: remote.id.clone(),
                            conflict_id: conflict.id.clone(),
                            auto_resolved: resolved.is_some(),
                        });
                        resolved
                    }
                };

                if let Some(data) = data {
                    let document =
                        DocumentState::new(&remote.id, &remote.op_type, &remote.session_id, data, &message.sender);
                    state.documents.insert(remote.id.clone(), document);
                    applied.push(remote.id);
                }
            }
        }

        debug!(
            peer = %message.sender,
            applied = applied.len(),
            conflicts = conflicts.len(),
            "Applied sync request"
        );
        let reply = if conflicts.is_empty() {
            self.protocol.create_ack_message(&message.sender, &message.message_id, applied)
        } else {
            self.protocol.create_sync_response_message(
                &message.sender,
                SyncResponsePayload {
                    session_id: request.session_id,
                    request_id: message.message_id.clone(),
                    applied,
                    conflicts,
                    state: None,
                },
            )
        };
        Ok(Some(self.sign_reply(reply, seal_for.as_ref()).await?))
    }

    /// Receive and answer one frame
    ///
    /// # Returns
    /// `false` once the peer has hung up.
    pub async fn process_next(&self, transport: &dyn SyncTransport) -> SyncResult<bool> {
        let Some(frame) = transport.recv().await? else {
            return Ok(false);
        };
        let message = match self.protocol.deserialize_message(&frame).await {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Dropping incoming frame");
                return Ok(true);
            }
        };
        match self.handle_incoming(&message).await {
            Ok(Some(reply)) => self.send(transport, &reply).await?,
            Ok(None) => {}
            Err(e) => warn!(message_id = %message.message_id, error = %e, "Failed to handle message"),
        }
        Ok(true)
    }

    /// Answer incoming traffic until the peer hangs up or shutdown is signalled
    pub async fn serve(
        &self,
        transport: &dyn SyncTransport,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> SyncResult<()> {
        loop {
            tokio::select! {
                more = self.process_next(transport) => {
                    if !more? {
                        debug!(node_id = %self.node_id, "Peer hung up");
                        return Ok(());
                    }
                }
                _ = shutdown.recv() => {
                    debug!(node_id = %self.node_id, "Sync engine stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Run `connect` until it succeeds, backing off between retryable failures
    ///
    /// Non-retryable errors are returned at once. After
    /// `max_reconnect_attempts` retryable failures the result is `TerminalSync`.
    pub async fn reconnect<F, Fut, T>(&self, mut connect: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let attempts = self.config.max_reconnect_attempts.max(1);
        let mut backoff = Backoff::from_config(&self.config);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match connect(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt, "Reconnected");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        let delay = backoff.next_delay();
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Sync attempt failed, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::TerminalSync { retries: attempts, reason: last_error })
    }
}
