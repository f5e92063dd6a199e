//! Sync protocol: message builders, validation, signing and verification
//!
//! Signatures cover the envelope fields and the plaintext payload, so a
//! sealed message is verified after it is opened. Without a local identity
//! messages go out unsigned and unsigned messages are trusted as-is, unless
//! signatures are required.

use super::message::{
    AckPayload, ErrorPayload, HandshakePayload, MessageAuth, MessageType, Payload, SyncMessage,
    SyncRequestPayload, SyncResponsePayload, VerificationResult, PROTOCOL_VERSION,
};
use crate::core_crypto::{Capability, CryptoError, CryptoProvider, Did};
use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hashlink::LruCache;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const SEEN_CAPACITY: usize = 4096;
const DEFAULT_LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub direction: Direction,
    pub message: SyncMessage,
    pub logged_at: DateTime<Utc>,
}

pub struct SyncProtocol {
    node_id: String,
    crypto: Arc<dyn CryptoProvider>,
    features: Vec<String>,
    require_signatures: bool,
    /// `sender/messageId` pairs already accepted
    seen: Mutex<LruCache<String, ()>>,
    log: RwLock<VecDeque<LoggedMessage>>,
    log_capacity: usize,
}

impl SyncProtocol {
    pub fn new(node_id: impl Into<String>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            node_id: node_id.into(),
            crypto,
            features: vec!["compression".to_string(), "delta-sync".to_string()],
            require_signatures: false,
            seen: Mutex::new(LruCache::new(SEEN_CAPACITY)),
            log: RwLock::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Reject unsigned incoming messages
    pub fn with_required_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    fn envelope(&self, message_type: MessageType, receiver: &str, payload: Payload) -> SyncMessage {
        SyncMessage {
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            sender: self.node_id.clone(),
            receiver: receiver.to_string(),
            message_id: format!("msg-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now().to_rfc3339(),
            payload,
            auth: None,
        }
    }

    /// Handshake payload for this node, with identity fields when one is loaded
    ///
    /// # Arguments
    /// * `ucan` - capability token held by this node, presented to the peer
    pub async fn create_handshake_payload(&self, ucan: Option<String>) -> HandshakePayload {
        let identity = self.crypto.get_public_identity().await;
        HandshakePayload {
            protocol_version: PROTOCOL_VERSION.to_string(),
            node_id: self.node_id.clone(),
            capabilities: self.features.clone(),
            did: identity.as_ref().map(|id| id.did.clone()),
            public_identity: identity,
            ucan,
        }
    }

    pub fn create_handshake_message(&self, receiver: &str, payload: HandshakePayload) -> SyncMessage {
        self.envelope(MessageType::Handshake, receiver, Payload::Handshake(payload))
    }

    pub fn create_sync_request_message(&self, receiver: &str, payload: SyncRequestPayload) -> SyncMessage {
        self.envelope(MessageType::SyncRequest, receiver, Payload::SyncRequest(payload))
    }

    pub fn create_sync_response_message(&self, receiver: &str, payload: SyncResponsePayload) -> SyncMessage {
        self.envelope(MessageType::SyncResponse, receiver, Payload::SyncResponse(payload))
    }

    pub fn create_ack_message(&self, receiver: &str, acked_message_id: &str, operation_ids: Vec<String>) -> SyncMessage {
        let payload = AckPayload { acked_message_id: acked_message_id.to_string(), operation_ids };
        self.envelope(MessageType::Ack, receiver, Payload::Ack(payload))
    }

    pub fn create_error_message(
        &self,
        receiver: &str,
        code: &str,
        message: &str,
        retryable: bool,
        related_message_id: Option<&str>,
    ) -> SyncMessage {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
            retryable,
            related_message_id: related_message_id.map(str::to_string),
        };
        self.envelope(MessageType::Error, receiver, Payload::Error(payload))
    }

    /// Check the required envelope fields of raw JSON
    pub fn validate_message(value: &Value) -> SyncResult<()> {
        let field = |name: &str| value.get(name).and_then(Value::as_str).filter(|s| !s.is_empty());

        let message_type = field("type").ok_or_else(|| SyncError::Protocol("missing message type".into()))?;
        serde_json::from_value::<MessageType>(Value::String(message_type.to_string()))
            .map_err(|_| SyncError::Protocol(format!("unknown message type '{}'", message_type)))?;
        field("sender").ok_or_else(|| SyncError::Protocol("missing sender".into()))?;
        field("messageId").ok_or_else(|| SyncError::Protocol("missing messageId".into()))?;
        let timestamp = field("timestamp").ok_or_else(|| SyncError::Protocol("missing timestamp".into()))?;
        DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| SyncError::Protocol(format!("unparseable timestamp '{}': {}", timestamp, e)))?;
        Ok(())
    }

    /// Typed validation of a parsed message
    pub fn validate(message: &SyncMessage) -> SyncResult<()> {
        if message.sender.is_empty() {
            return Err(SyncError::Protocol("missing sender".into()));
        }
        if message.message_id.is_empty() {
            return Err(SyncError::Protocol("missing messageId".into()));
        }
        DateTime::parse_from_rfc3339(&message.timestamp)
            .map_err(|e| SyncError::Protocol(format!("unparseable timestamp '{}': {}", message.timestamp, e)))?;

        match message.payload.message_type() {
            Some(kind) if kind != message.message_type => Err(SyncError::Protocol(format!(
                "{} message carries a {} payload",
                message.message_type, kind
            ))),
            _ => Ok(()),
        }
    }

    /// Validate and encode an outgoing message
    pub async fn serialize_message(&self, message: &SyncMessage) -> SyncResult<String> {
        Self::validate(message)?;
        let encoded = serde_json::to_string(message)?;
        ::metrics::counter!(metrics::PROTOCOL_SENT).increment(1);
        self.record(Direction::Outbound, message).await;
        Ok(encoded)
    }

    /// Parse, validate and de-duplicate an incoming message
    ///
    /// A message id already accepted from the same sender is a protocol error.
    pub async fn deserialize_message(&self, raw: &str) -> SyncResult<SyncMessage> {
        let parsed = Self::parse(raw);
        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                ::metrics::counter!(metrics::PROTOCOL_INVALID).increment(1);
                debug!(error = %e, "Dropping malformed message");
                return Err(e);
            }
        };

        let key = format!("{}/{}", message.sender, message.message_id);
        {
            let mut seen = self.seen.lock().await;
            if seen.get(&key).is_some() {
                ::metrics::counter!(metrics::PROTOCOL_INVALID).increment(1);
                return Err(SyncError::Protocol(format!("duplicate message {}", key)));
            }
            seen.insert(key, ());
        }

        self.record(Direction::Inbound, &message).await;
        Ok(message)
    }

    fn parse(raw: &str) -> SyncResult<SyncMessage> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| SyncError::Protocol(format!("invalid JSON: {}", e)))?;
        Self::validate_message(&value)?;
        let message: SyncMessage =
            serde_json::from_value(value).map_err(|e| SyncError::Protocol(format!("invalid message: {}", e)))?;
        Self::validate(&message)?;
        Ok(message)
    }

    fn signing_input(message: &SyncMessage, payload: &Payload) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(&(
            message.message_type,
            &message.version,
            &message.sender,
            &message.receiver,
            &message.message_id,
            &message.timestamp,
            payload,
        ))?)
    }

    /// Sign a message, sealing its payload for `encrypt_for` when given
    ///
    /// Without a local identity the message is returned unsigned.
    pub async fn sign_message(&self, mut message: SyncMessage, encrypt_for: Option<&Did>) -> SyncResult<SyncMessage> {
        let Some(signer_did) = self.crypto.get_local_did().await else {
            return Ok(message);
        };
        if message.payload.is_sealed() {
            return Err(SyncError::InvalidState("payload is already sealed".into()));
        }

        let input = Self::signing_input(&message, &message.payload)?;
        let signature = self.crypto.sign(&input).await?;

        let encrypted = match encrypt_for {
            Some(recipient) => {
                let plaintext = serde_json::to_vec(&message.payload)?;
                message.payload = Payload::Sealed(self.crypto.encrypt(&plaintext, recipient).await?);
                true
            }
            None => false,
        };

        message.auth = Some(MessageAuth { signer_did, signature: STANDARD.encode(signature), encrypted });
        Ok(message)
    }

    /// Open (if sealed) and verify a message
    ///
    /// Every failure is reported in the result rather than returned as an error.
    pub async fn verify_message(&self, message: &SyncMessage) -> VerificationResult {
        let result = self.verify_inner(message).await;
        if !result.valid {
            ::metrics::counter!(metrics::PROTOCOL_VERIFY_FAILED).increment(1);
            warn!(
                message_id = %message.message_id,
                sender = %message.sender,
                error = result.error.as_deref().unwrap_or_default(),
                "Message failed verification"
            );
        }
        result
    }

    async fn verify_inner(&self, message: &SyncMessage) -> VerificationResult {
        let Some(auth) = &message.auth else {
            if message.payload.is_sealed() {
                return VerificationResult::invalid("sealed payload without auth");
            }
            if self.require_signatures {
                return VerificationResult::invalid("unsigned message");
            }
            return VerificationResult::valid(message.payload.clone());
        };

        let payload = match (&message.payload, auth.encrypted) {
            (Payload::Sealed(sealed), true) => {
                if sealed.sender_did != auth.signer_did {
                    return VerificationResult::invalid("sealed sender does not match signer");
                }
                let plaintext = match self.crypto.decrypt(sealed).await {
                    Ok(plaintext) => plaintext,
                    Err(e) => return VerificationResult::invalid(e.to_string()),
                };
                match serde_json::from_slice::<Payload>(&plaintext) {
                    Ok(payload) if !payload.is_sealed() => payload,
                    Ok(_) => return VerificationResult::invalid("nested sealed payload"),
                    Err(e) => return VerificationResult::invalid(format!("sealed payload: {}", e)),
                }
            }
            (Payload::Sealed(_), false) => return VerificationResult::invalid("sealed payload not marked encrypted"),
            (_, true) => return VerificationResult::invalid("marked encrypted but payload is not sealed"),
            (payload, false) => payload.clone(),
        };

        if payload.message_type() != Some(message.message_type) {
            return VerificationResult::invalid(format!("{} message carries a mismatched payload", message.message_type));
        }

        let signature = match STANDARD.decode(&auth.signature) {
            Ok(signature) => signature,
            Err(e) => return VerificationResult::invalid(format!("signature encoding: {}", e)),
        };
        let input = match Self::signing_input(message, &payload) {
            Ok(input) => input,
            Err(e) => return VerificationResult::invalid(e.to_string()),
        };

        match self.crypto.verify(&auth.signer_did, &input, &signature).await {
            Ok(true) => VerificationResult::valid(payload),
            Ok(false) => VerificationResult::invalid("signature mismatch"),
            Err(e) => VerificationResult::invalid(e.to_string()),
        }
    }

    /// Verify a handshake and check the presented capability token
    ///
    /// # Arguments
    /// * `required` - capabilities the peer must hold; empty skips the token check
    ///
    /// # Returns
    /// The handshake payload, or a protocol/crypto error when the peer is
    /// incompatible or not authorized.
    pub async fn verify_handshake(&self, message: &SyncMessage, required: &[Capability]) -> SyncResult<HandshakePayload> {
        let result = self.verify_message(message).await;
        if !result.valid {
            let reason = result.error.unwrap_or_default();
            return Err(CryptoError::InvalidSignature(reason).into());
        }
        let Some(Payload::Handshake(handshake)) = result.payload else {
            return Err(SyncError::Protocol("expected a handshake payload".into()));
        };

        let major = |v: &str| v.split('.').next().map(str::to_string);
        if major(&handshake.protocol_version) != major(PROTOCOL_VERSION) {
            return Err(SyncError::Protocol(format!(
                "incompatible protocol version {} (local {})",
                handshake.protocol_version, PROTOCOL_VERSION
            )));
        }

        if !required.is_empty() {
            let token = handshake
                .ucan
                .as_deref()
                .ok_or_else(|| CryptoError::MissingCapability("no capability token presented".into()))?;
            let claims = self.crypto.verify_ucan(token, required).await?;
            if let Some(did) = &handshake.did {
                if &claims.aud != did {
                    return Err(CryptoError::InvalidToken(format!("token audience {} is not {}", claims.aud, did)).into());
                }
            }
        }

        debug!(peer = %handshake.node_id, did = ?handshake.did, "Handshake verified");
        Ok(handshake)
    }

    async fn record(&self, direction: Direction, message: &SyncMessage) {
        let mut log = self.log.write().await;
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(LoggedMessage { direction, message: message.clone(), logged_at: Utc::now() });
    }

    /// Most recent `limit` logged messages, oldest first
    pub async fn get_message_log(&self, limit: Option<usize>) -> Vec<LoggedMessage> {
        let log = self.log.read().await;
        let skip = limit.map_or(0, |n| log.len().saturating_sub(n));
        log.iter().skip(skip).cloned().collect()
    }

    pub async fn clear_message_log(&self) {
        self.log.write().await.clear();
    }
}
