//! Crypto Provider Trait
//!
//! Signing, sealing, capability tokens and key derivation for the sync
//! engine. The provider owns all private key material and is the only
//! component that mutates its key cache.

use super::capability::{Capability, UcanClaims};
use super::did::Did;
use super::errors::CryptoResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public half of a local identity, safe to put on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub did: Did,
    /// Ed25519 verifying key, hex
    pub signing_key: String,
    /// X25519 agreement key, hex
    pub encryption_key: String,
}

/// Ciphertext addressed to one recipient DID
///
/// The sender DID travels with the ciphertext so the recipient can derive
/// the shared key without a prior session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedPayload {
    pub version: u8,
    pub sender_did: Did,
    pub recipient_did: Did,
    /// base64 nonce, empty for passthrough
    pub nonce: String,
    /// base64 ciphertext (or plaintext for passthrough)
    pub ciphertext: String,
}

/// Cryptographic operations used by the protocol, queue and replication layers
///
/// Implementations:
/// - `LocalCryptoProvider`: Ed25519 identities, X25519 + AES-GCM sealing
/// - `NullCryptoProvider`: passthrough for unauthenticated operation
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Whether a local identity is loaded
    async fn is_initialized(&self) -> bool;

    /// Create a fresh identity and make it the local one
    async fn generate_identity(&self) -> CryptoResult<PublicIdentity>;

    /// DID of the local identity, if any
    async fn get_local_did(&self) -> Option<Did>;

    /// Public keys of the local identity, if any
    async fn get_public_identity(&self) -> Option<PublicIdentity>;

    /// Sign bytes with the local identity key
    async fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Verify a signature against the key named by `signer`
    ///
    /// # Returns
    /// `Ok(false)` for a well-formed but wrong signature, `Err` if the DID
    /// cannot be resolved to a key.
    async fn verify(&self, signer: &Did, data: &[u8], signature: &[u8]) -> CryptoResult<bool>;

    /// Seal bytes for `recipient`
    async fn encrypt(&self, plaintext: &[u8], recipient: &Did) -> CryptoResult<SealedPayload>;

    /// Open a payload addressed to the local identity, using its embedded sender DID
    async fn decrypt(&self, sealed: &SealedPayload) -> CryptoResult<Vec<u8>>;

    /// Issue a capability token from the local identity to `audience`
    async fn create_ucan(
        &self,
        audience: &Did,
        capabilities: &[Capability],
        ttl: Duration,
    ) -> CryptoResult<String>;

    /// Check a token's signature, validity window, and that it covers `required`
    async fn verify_ucan(&self, token: &str, required: &[Capability]) -> CryptoResult<UcanClaims>;

    /// 32 bytes derived from the local identity key for `context`
    async fn derive_secret(&self, context: &[u8]) -> CryptoResult<[u8; 32]>;

    /// Drop a cached resolved key; later verifications re-resolve it
    async fn remove_key_from_cache(&self, did: &Did);

    async fn clear_key_cache(&self);

    /// Content digest, lowercase hex
    fn hash(&self, data: &[u8]) -> String {
        blake3::hash(data).to_hex().to_string()
    }

    /// Cryptographically secure random bytes
    fn random_bytes(&self, n: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut bytes = vec![0u8; n];
        rand::rng().fill_bytes(&mut bytes);
        bytes
    }
}
