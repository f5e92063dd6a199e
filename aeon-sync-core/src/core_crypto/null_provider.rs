//! Passthrough provider for unauthenticated operation
//!
//! Never initialized. Signatures are empty and always verify, "sealed"
//! payloads carry base64 plaintext, and tokens are unsigned.

use super::capability::{
    assemble_token, covers, encode_signing_input, parse_token, Capability, UcanClaims, UcanHeader,
    UCAN_VERSION,
};
use super::did::Did;
use super::errors::{CryptoError, CryptoResult};
use super::provider::{CryptoProvider, PublicIdentity, SealedPayload};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;

/// Envelope version used for passthrough payloads
pub const PASSTHROUGH_VERSION: u8 = 0;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullCryptoProvider;

impl NullCryptoProvider {
    pub fn new() -> Self {
        Self
    }

    fn anonymous() -> Did {
        Did::new("did:aeon:anonymous")
    }
}

#[async_trait]
impl CryptoProvider for NullCryptoProvider {
    async fn is_initialized(&self) -> bool {
        false
    }

    async fn generate_identity(&self) -> CryptoResult<PublicIdentity> {
        Err(CryptoError::NotInitialized)
    }

    async fn get_local_did(&self) -> Option<Did> {
        None
    }

    async fn get_public_identity(&self) -> Option<PublicIdentity> {
        None
    }

    async fn sign(&self, _data: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn verify(&self, _signer: &Did, _data: &[u8], _signature: &[u8]) -> CryptoResult<bool> {
        Ok(true)
    }

    async fn encrypt(&self, plaintext: &[u8], recipient: &Did) -> CryptoResult<SealedPayload> {
        Ok(SealedPayload {
            version: PASSTHROUGH_VERSION,
            sender_did: Self::anonymous(),
            recipient_did: recipient.clone(),
            nonce: String::new(),
            ciphertext: STANDARD.encode(plaintext),
        })
    }

    async fn decrypt(&self, sealed: &SealedPayload) -> CryptoResult<Vec<u8>> {
        if sealed.version != PASSTHROUGH_VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed.version));
        }
        STANDARD.decode(&sealed.ciphertext).map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    async fn create_ucan(
        &self,
        audience: &Did,
        capabilities: &[Capability],
        ttl: Duration,
    ) -> CryptoResult<String> {
        let now = chrono::Utc::now().timestamp();
        let header = UcanHeader { alg: "none".into(), typ: "JWT".into(), ucv: UCAN_VERSION.into() };
        let claims = UcanClaims {
            iss: Self::anonymous(),
            aud: audience.clone(),
            att: capabilities.to_vec(),
            exp: now + ttl.as_secs() as i64,
            nbf: now,
            nnc: uuid::Uuid::new_v4().to_string(),
        };
        Ok(assemble_token(&encode_signing_input(&header, &claims)?, &[]))
    }

    /// Trusts the claims as-is, but still requires the capabilities to be listed
    async fn verify_ucan(&self, token: &str, required: &[Capability]) -> CryptoResult<UcanClaims> {
        let parsed = parse_token(token)?;
        covers(&parsed.claims.att, required)
            .map_err(|missing| CryptoError::MissingCapability(missing.to_string()))?;
        Ok(parsed.claims)
    }

    async fn derive_secret(&self, _context: &[u8]) -> CryptoResult<[u8; 32]> {
        Err(CryptoError::NotInitialized)
    }

    async fn remove_key_from_cache(&self, _did: &Did) {}

    async fn clear_key_cache(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_provider_is_passthrough() {
        let provider = NullCryptoProvider::new();
        assert!(!provider.is_initialized().await);
        assert!(provider.get_local_did().await.is_none());

        let signature = provider.sign(b"data").await.unwrap();
        assert!(signature.is_empty());
        assert!(provider.verify(&Did::new("did:key:zAny"), b"data", b"junk").await.unwrap());

        let sealed = provider.encrypt(b"hello", &Did::new("did:key:zPeer")).await.unwrap();
        assert_eq!(sealed.version, PASSTHROUGH_VERSION);
        assert_eq!(provider.decrypt(&sealed).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_null_provider_tokens_unsigned_but_scoped() {
        let provider = NullCryptoProvider::new();
        let token = provider
            .create_ucan(&Did::new("did:key:zPeer"), &[Capability::SyncRead], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(token.ends_with('.'));

        assert!(provider.verify_ucan(&token, &[Capability::SyncRead]).await.is_ok());
        assert!(matches!(
            provider.verify_ucan(&token, &[Capability::SyncWrite]).await,
            Err(CryptoError::MissingCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_null_provider_cannot_derive_keys() {
        let provider = NullCryptoProvider::new();
        assert!(matches!(provider.derive_secret(b"ctx").await, Err(CryptoError::NotInitialized)));
        assert_eq!(provider.hash(b"abc").len(), 64);
        assert_eq!(provider.random_bytes(16).len(), 16);
    }
}
