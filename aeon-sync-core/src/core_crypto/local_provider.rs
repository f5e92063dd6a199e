//! Local Crypto Provider
//!
//! Holds one Ed25519 identity in process memory. Its X25519 agreement key is
//! derived from the Ed25519 seed, so a peer's `did:key` alone is enough to
//! both verify its signatures and seal payloads to it.
//!
//! Sealed box: X25519(ECDH) -> HKDF-SHA256 -> AES-256-GCM, with the sender and
//! recipient DIDs bound in as associated data.

use super::capability::{
    assemble_token, covers, encode_signing_input, parse_token, Capability, UcanClaims, UcanHeader,
    UCAN_VERSION,
};
use super::did::Did;
use super::errors::{CryptoError, CryptoResult};
use super::provider::{CryptoProvider, PublicIdentity, SealedPayload};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Envelope version for X25519/AES-GCM sealed payloads
pub const SEALED_VERSION: u8 = 1;

const SEALED_INFO: &[u8] = b"aeon-sync/sealed/v1";
const DERIVE_SALT: &[u8] = b"aeon-sync/derive/v1";

struct LocalIdentity {
    signing: SigningKey,
    agreement: StaticSecret,
    did: Did,
}

impl LocalIdentity {
    fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let did = Did::from_verifying_key(&signing.verifying_key());
        Self { agreement: agreement_secret(seed), signing, did }
    }

    fn public(&self) -> PublicIdentity {
        PublicIdentity {
            did: self.did.clone(),
            signing_key: hex::encode(self.signing.verifying_key().as_bytes()),
            encryption_key: hex::encode(X25519PublicKey::from(&self.agreement).as_bytes()),
        }
    }
}

/// X25519 scalar from an Ed25519 seed: first half of SHA-512, clamped
fn agreement_secret(seed: &[u8; 32]) -> StaticSecret {
    let hash = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

/// X25519 public key matching a peer's Ed25519 key
fn agreement_public(key: &VerifyingKey) -> X25519PublicKey {
    X25519PublicKey::from(key.to_montgomery().to_bytes())
}

fn associated_data(sender: &Did, recipient: &Did) -> Vec<u8> {
    let mut aad = Vec::with_capacity(sender.as_str().len() + recipient.as_str().len() + 1);
    aad.extend_from_slice(sender.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(recipient.as_str().as_bytes());
    aad
}

fn sealing_cipher(shared: &[u8; 32], aad: &[u8]) -> CryptoResult<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut info = SEALED_INFO.to_vec();
    info.extend_from_slice(aad);
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// In-process Ed25519 identity with a DID-resolved key cache
pub struct LocalCryptoProvider {
    identity: RwLock<Option<LocalIdentity>>,
    key_cache: RwLock<HashMap<Did, VerifyingKey>>,
}

impl LocalCryptoProvider {
    /// Provider with no identity yet; call `generate_identity`
    pub fn new() -> Self {
        Self { identity: RwLock::new(None), key_cache: RwLock::new(HashMap::new()) }
    }

    /// Provider with a deterministic identity
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            identity: RwLock::new(Some(LocalIdentity::from_seed(&seed))),
            key_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of resolved peer keys currently cached
    pub async fn cached_keys(&self) -> usize {
        self.key_cache.read().await.len()
    }

    async fn resolve_key(&self, did: &Did) -> CryptoResult<VerifyingKey> {
        if let Some(key) = self.key_cache.read().await.get(did) {
            return Ok(*key);
        }
        let key = did.to_verifying_key()?;
        self.key_cache.write().await.insert(did.clone(), key);
        Ok(key)
    }
}

impl Default for LocalCryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CryptoProvider for LocalCryptoProvider {
    async fn is_initialized(&self) -> bool {
        self.identity.read().await.is_some()
    }

    async fn generate_identity(&self) -> CryptoResult<PublicIdentity> {
        let seed: [u8; 32] = rand::random();
        let identity = LocalIdentity::from_seed(&seed);
        let public = identity.public();
        *self.identity.write().await = Some(identity);
        tracing::info!(did = %public.did, "Generated local identity");
        Ok(public)
    }

    async fn get_local_did(&self) -> Option<Did> {
        self.identity.read().await.as_ref().map(|id| id.did.clone())
    }

    async fn get_public_identity(&self) -> Option<PublicIdentity> {
        self.identity.read().await.as_ref().map(LocalIdentity::public)
    }

    async fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok(identity.signing.sign(data).to_bytes().to_vec())
    }

    async fn verify(&self, signer: &Did, data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        let key = self.resolve_key(signer).await?;
        let Ok(signature) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(key.verify(data, &signature).is_ok())
    }

    async fn encrypt(&self, plaintext: &[u8], recipient: &Did) -> CryptoResult<SealedPayload> {
        let recipient_key = self.resolve_key(recipient).await?;
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::NotInitialized)?;

        let shared = identity.agreement.diffie_hellman(&agreement_public(&recipient_key));
        let aad = associated_data(&identity.did, recipient);
        let cipher = sealing_cipher(shared.as_bytes(), &aad)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        Ok(SealedPayload {
            version: SEALED_VERSION,
            sender_did: identity.did.clone(),
            recipient_did: recipient.clone(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    async fn decrypt(&self, sealed: &SealedPayload) -> CryptoResult<Vec<u8>> {
        if sealed.version != SEALED_VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed.version));
        }
        let sender_key = self.resolve_key(&sealed.sender_did).await?;
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::NotInitialized)?;
        if sealed.recipient_did != identity.did {
            return Err(CryptoError::Decryption(format!(
                "payload addressed to {}",
                sealed.recipient_did
            )));
        }

        let nonce = STANDARD.decode(&sealed.nonce).map_err(|e| CryptoError::Decryption(e.to_string()))?;
        if nonce.len() != 12 {
            return Err(CryptoError::Decryption(format!("nonce length {}", nonce.len())));
        }
        let ciphertext =
            STANDARD.decode(&sealed.ciphertext).map_err(|e| CryptoError::Decryption(e.to_string()))?;

        let shared = identity.agreement.diffie_hellman(&agreement_public(&sender_key));
        let aad = associated_data(&sealed.sender_did, &sealed.recipient_did);
        let cipher = sealing_cipher(shared.as_bytes(), &aad)?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: &aad })
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    async fn create_ucan(
        &self,
        audience: &Did,
        capabilities: &[Capability],
        ttl: Duration,
    ) -> CryptoResult<String> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::NotInitialized)?;

        let now = chrono::Utc::now().timestamp();
        let header = UcanHeader { alg: "EdDSA".into(), typ: "JWT".into(), ucv: UCAN_VERSION.into() };
        let claims = UcanClaims {
            iss: identity.did.clone(),
            aud: audience.clone(),
            att: capabilities.to_vec(),
            exp: now + ttl.as_secs() as i64,
            nbf: now,
            nnc: uuid::Uuid::new_v4().to_string(),
        };
        let input = encode_signing_input(&header, &claims)?;
        let signature = identity.signing.sign(input.as_bytes());
        Ok(assemble_token(&input, &signature.to_bytes()))
    }

    async fn verify_ucan(&self, token: &str, required: &[Capability]) -> CryptoResult<UcanClaims> {
        let parsed = parse_token(token)?;
        if parsed.header.alg != "EdDSA" {
            return Err(CryptoError::InvalidToken(format!("unsupported alg '{}'", parsed.header.alg)));
        }

        let issuer_key = self.resolve_key(&parsed.claims.iss).await?;
        let signature = Signature::from_slice(&parsed.signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        issuer_key
            .verify(parsed.signing_input.as_bytes(), &signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        if parsed.claims.is_expired_at(now) {
            return Err(CryptoError::TokenExpired(parsed.claims.exp));
        }
        if !parsed.claims.is_active_at(now) {
            return Err(CryptoError::InvalidToken(format!("not valid before {}", parsed.claims.nbf)));
        }
        covers(&parsed.claims.att, required)
            .map_err(|missing| CryptoError::MissingCapability(missing.to_string()))?;

        Ok(parsed.claims)
    }

    async fn derive_secret(&self, context: &[u8]) -> CryptoResult<[u8; 32]> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::NotInitialized)?;
        let hk = Hkdf::<Sha256>::new(Some(DERIVE_SALT), identity.signing.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(context, &mut okm).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(okm)
    }

    async fn remove_key_from_cache(&self, did: &Did) {
        self.key_cache.write().await.remove(did);
    }

    async fn clear_key_cache(&self) {
        self.key_cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LocalCryptoProvider, LocalCryptoProvider) {
        (LocalCryptoProvider::with_seed([1u8; 32]), LocalCryptoProvider::with_seed([2u8; 32]))
    }

    #[tokio::test]
    async fn test_generate_identity() {
        let provider = LocalCryptoProvider::new();
        assert!(!provider.is_initialized().await);
        assert!(matches!(provider.sign(b"x").await, Err(CryptoError::NotInitialized)));

        let public = provider.generate_identity().await.unwrap();
        assert!(provider.is_initialized().await);
        assert_eq!(provider.get_local_did().await, Some(public.did.clone()));
        assert_eq!(public.signing_key.len(), 64);
    }

    #[tokio::test]
    async fn test_sign_and_verify_by_did() {
        let (alice, bob) = pair();
        let alice_did = alice.get_local_did().await.unwrap();

        let signature = alice.sign(b"payload").await.unwrap();
        assert!(bob.verify(&alice_did, b"payload", &signature).await.unwrap());
        assert!(!bob.verify(&alice_did, b"tampered", &signature).await.unwrap());
        assert!(!bob.verify(&alice_did, b"payload", b"short").await.unwrap());
        assert!(bob.verify(&Did::new("did:web:x"), b"payload", &signature).await.is_err());
    }

    #[tokio::test]
    async fn test_agreement_key_matches_did() {
        let (alice, _) = pair();
        let public = alice.get_public_identity().await.unwrap();
        let from_did = agreement_public(&public.did.to_verifying_key().unwrap());
        assert_eq!(hex::encode(from_did.as_bytes()), public.encryption_key);
    }

    #[tokio::test]
    async fn test_seal_open_between_peers() {
        let (alice, bob) = pair();
        let bob_did = bob.get_local_did().await.unwrap();

        let sealed = alice.encrypt(b"secret edit", &bob_did).await.unwrap();
        assert_eq!(sealed.version, SEALED_VERSION);
        assert_eq!(sealed.sender_did, alice.get_local_did().await.unwrap());
        assert_eq!(bob.decrypt(&sealed).await.unwrap(), b"secret edit");

        // not addressed to alice
        assert!(alice.decrypt(&sealed).await.is_err());

        let mut forged = sealed.clone();
        forged.sender_did = LocalCryptoProvider::with_seed([3u8; 32]).get_local_did().await.unwrap();
        assert!(bob.decrypt(&forged).await.is_err());

        let mut future = sealed;
        future.version = 9;
        assert!(matches!(bob.decrypt(&future).await, Err(CryptoError::UnsupportedVersion(9))));
    }

    #[tokio::test]
    async fn test_ucan_issue_and_verify() {
        let (alice, bob) = pair();
        let bob_did = bob.get_local_did().await.unwrap();

        let token = alice
            .create_ucan(&bob_did, &[Capability::SyncAdmin], Duration::from_secs(300))
            .await
            .unwrap();

        let claims = bob.verify_ucan(&token, &[Capability::SyncWrite]).await.unwrap();
        assert_eq!(claims.aud, bob_did);
        assert!(matches!(
            bob.verify_ucan(&token, &[Capability::StateWrite]).await,
            Err(CryptoError::MissingCapability(_))
        ));

        let expired = alice.create_ucan(&bob_did, &[Capability::SyncRead], Duration::ZERO).await.unwrap();
        assert!(matches!(bob.verify_ucan(&expired, &[]).await, Err(CryptoError::TokenExpired(_))));
    }

    #[tokio::test]
    async fn test_ucan_rejects_tampered_claims() {
        let (alice, bob) = pair();
        let bob_did = bob.get_local_did().await.unwrap();
        let token = alice
            .create_ucan(&bob_did, &[Capability::SyncRead], Duration::from_secs(300))
            .await
            .unwrap();

        let mut parsed = parse_token(&token).unwrap();
        parsed.claims.att.push(Capability::SyncAdmin);
        let forged_input = encode_signing_input(&parsed.header, &parsed.claims).unwrap();
        let forged = assemble_token(&forged_input, &parsed.signature);

        assert!(matches!(
            bob.verify_ucan(&forged, &[Capability::SyncAdmin]).await,
            Err(CryptoError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_derive_secret_is_context_bound() {
        let (alice, bob) = pair();
        let a1 = alice.derive_secret(b"queue").await.unwrap();
        assert_eq!(a1, alice.derive_secret(b"queue").await.unwrap());
        assert_ne!(a1, alice.derive_secret(b"other").await.unwrap());
        assert_ne!(a1, bob.derive_secret(b"queue").await.unwrap());
    }

    #[tokio::test]
    async fn test_key_cache_eviction() {
        let (alice, bob) = pair();
        let alice_did = alice.get_local_did().await.unwrap();
        let signature = alice.sign(b"m").await.unwrap();

        assert!(bob.verify(&alice_did, b"m", &signature).await.unwrap());
        assert_eq!(bob.cached_keys().await, 1);

        bob.remove_key_from_cache(&alice_did).await;
        assert_eq!(bob.cached_keys().await, 0);
        assert!(bob.verify(&alice_did, b"m", &signature).await.unwrap());

        bob.clear_key_cache().await;
        assert_eq!(bob.cached_keys().await, 0);
    }
}
