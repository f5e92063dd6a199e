/*
    message.rs - SyncMessage envelope and typed payloads

    Wire form is JSON:
        { "type": "sync-request", "version": "1.0.0", "sender": ..., "receiver": ...,
          "messageId": ..., "timestamp": RFC 3339, "payload": { "kind": ..., ... },
          "auth": { "signerDid": ..., "signature": base64, "encrypted": bool } }

    `payload.kind` must agree with `type`, except that any message may carry
    a sealed payload, which is opened before its kind can be checked.
*/

use crate::core_bandwidth::{CompressedBatch, DeltaType};
use crate::core_crypto::{Did, PublicIdentity, SealedPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Handshake,
    SyncRequest,
    SyncResponse,
    Ack,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::SyncRequest => "sync-request",
            MessageType::SyncResponse => "sync-response",
            MessageType::Ack => "ack",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub protocol_version: String,
    pub node_id: String,
    /// Protocol features offered, e.g. "compression", "delta-sync"
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<Did>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_identity: Option<PublicIdentity>,
    /// Capability token issued to the receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucan: Option<String>,
}

/// Wire header of one operation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationHeader {
    pub id: String,
    pub delta_type: DeltaType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub session_id: String,
    pub operations: Vec<OperationHeader>,
    /// Compressed JSON array of `DeltaOperation`
    pub batch: CompressedBatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponsePayload {
    pub session_id: String,
    /// Message being answered
    pub request_id: String,
    pub applied: Vec<String>,
    /// Operation ids that raised conflicts, with the conflict ids
    pub conflicts: Vec<ConflictNotice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotice {
    pub operation_id: String,
    pub conflict_id: String,
    pub auto_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub acked_message_id: String,
    pub operation_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Payload {
    Handshake(HandshakePayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(SyncResponsePayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Sealed(SealedPayload),
}

impl Payload {
    /// Message type this payload belongs to; `None` while sealed
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Payload::Handshake(_) => Some(MessageType::Handshake),
            Payload::SyncRequest(_) => Some(MessageType::SyncRequest),
            Payload::SyncResponse(_) => Some(MessageType::SyncResponse),
            Payload::Ack(_) => Some(MessageType::Ack),
            Payload::Error(_) => Some(MessageType::Error),
            Payload::Sealed(_) => None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Payload::Sealed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAuth {
    pub signer_did: Did,
    /// base64 signature over the plaintext signing input
    pub signature: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub version: String,
    pub sender: String,
    pub receiver: String,
    pub message_id: String,
    pub timestamp: String,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<MessageAuth>,
}

impl SyncMessage {
    pub fn is_signed(&self) -> bool {
        self.auth.is_some()
    }
}

/// Outcome of `SyncProtocol::verify_message`; never an error
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub valid: bool,
    pub error: Option<String>,
    /// Plaintext payload, opened if it arrived sealed
    pub payload: Option<Payload>,
}

impl VerificationResult {
    pub fn valid(payload: Payload) -> Self {
        Self { valid: true, error: None, payload: Some(payload) }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self { valid: false, error: Some(error.into()), payload: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let message = SyncMessage {
            message_type: MessageType::Ack,
            version: PROTOCOL_VERSION.into(),
            sender: "node-a".into(),
            receiver: "node-b".into(),
            message_id: "m1".into(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            payload: Payload::Ack(AckPayload { acked_message_id: "m0".into(), operation_ids: vec!["op-1".into()] }),
            auth: None,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["messageId"], "m1");
        assert_eq!(value["payload"], json!({"kind": "ack", "ackedMessageId": "m0", "operationIds": ["op-1"]}));
        assert!(value.get("auth").is_none());

        let back: SyncMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_payload_kinds() {
        let sealed = Payload::Sealed(SealedPayload {
            version: 1,
            sender_did: Did::new("did:key:zA"),
            recipient_did: Did::new("did:key:zB"),
            nonce: String::new(),
            ciphertext: String::new(),
        });
        assert!(sealed.is_sealed());
        assert_eq!(sealed.message_type(), None);

        let error = Payload::Error(ErrorPayload {
            code: "bad".into(),
            message: "m".into(),
            retryable: false,
            related_message_id: None,
        });
        assert_eq!(error.message_type(), Some(MessageType::Error));
        assert_eq!(serde_json::to_value(&error).unwrap()["kind"], "error");
    }
}
