/*
    key_material.rs - Symmetric key for at-rest queue encryption

    Blob layout:
        version: u8 (=1) || nonce: [u8; 12] || AES-256-GCM ciphertext + 16-byte tag

    Keys come from HKDF-SHA256, either over the local DID signing key (via the
    crypto provider) or over a session id when no identity is loaded.
*/

use super::errors::{CryptoError, CryptoResult};
use super::provider::CryptoProvider;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const BLOB_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const SESSION_SALT: &[u8] = b"aeon-sync/queue/session";
const QUEUE_CONTEXT: &[u8] = b"aeon-sync/queue/v1";

/// Where a key was derived from, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Identity,
    Session(String),
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; 32],
    #[zeroize(skip)]
    source: KeySource,
}

impl KeyMaterial {
    /// Derive from the provider's identity key
    ///
    /// # Arguments
    /// * `provider` - must have a local identity loaded
    /// * `context` - domain separation label, e.g. a queue name
    pub async fn from_provider(provider: &dyn CryptoProvider, context: &str) -> CryptoResult<Self> {
        let mut info = QUEUE_CONTEXT.to_vec();
        info.extend_from_slice(context.as_bytes());
        let key = provider.derive_secret(&info).await?;
        Ok(Self { key, source: KeySource::Identity })
    }

    /// Derive from a session id, for unauthenticated operation
    pub fn from_session_id(session_id: &str) -> CryptoResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(SESSION_SALT), session_id.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(QUEUE_CONTEXT, &mut key).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self { key, source: KeySource::Session(session_id.to_string()) })
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    fn cipher(&self) -> CryptoResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }

    /// Encrypt into a versioned blob
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by `seal`
    pub fn open(&self, blob: &[u8]) -> CryptoResult<Vec<u8>> {
        let Some((&version, rest)) = blob.split_first() else {
            return Err(CryptoError::Decryption("empty blob".to_string()));
        };
        if version != BLOB_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!("blob too short: {} bytes", blob.len())));
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").field("key", &"[REDACTED]").field("source", &self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::{LocalCryptoProvider, NullCryptoProvider};

    #[test]
    fn test_blob_layout() {
        let key = KeyMaterial::from_session_id("session-1").unwrap();
        let blob = key.seal(b"operation").unwrap();

        assert_eq!(blob[0], BLOB_VERSION);
        assert_eq!(blob.len(), 1 + NONCE_LEN + b"operation".len() + TAG_LEN);
        assert_eq!(key.open(&blob).unwrap(), b"operation");
    }

    #[test]
    fn test_rejects_foreign_and_damaged_blobs() {
        let key = KeyMaterial::from_session_id("session-1").unwrap();
        let other = KeyMaterial::from_session_id("session-2").unwrap();
        let blob = key.seal(b"data").unwrap();

        assert!(other.open(&blob).is_err());

        let mut versioned = blob.clone();
        versioned[0] = 2;
        assert!(matches!(key.open(&versioned), Err(CryptoError::UnsupportedVersion(2))));

        assert!(key.open(&blob[..10]).is_err());
        assert!(key.open(&[]).is_err());
    }

    #[tokio::test]
    async fn test_from_provider() {
        let provider = LocalCryptoProvider::with_seed([4u8; 32]);
        let a = KeyMaterial::from_provider(&provider, "queue").await.unwrap();
        let b = KeyMaterial::from_provider(&provider, "queue").await.unwrap();
        assert_eq!(a.source(), &KeySource::Identity);
        assert_eq!(b.open(&a.seal(b"x").unwrap()).unwrap(), b"x");

        assert!(KeyMaterial::from_provider(&NullCryptoProvider, "queue").await.is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = KeyMaterial::from_session_id("s").unwrap();
        assert!(format!("{:?}", key).contains("REDACTED"));
    }
}
