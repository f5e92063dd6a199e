//! `did:key` identifiers for Ed25519 public keys
//!
//! Format: `did:key:z` + base58btc(0xed 0x01 || 32-byte public key).

use super::errors::{CryptoError, CryptoResult};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

const DID_KEY_PREFIX: &str = "did:key:z";
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// Decentralized identifier naming a node, replica or signer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Wrap an arbitrary DID string without checking its method
    pub fn new(value: impl Into<String>) -> Self {
        Did(value.into())
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut bytes = Vec::with_capacity(34);
        bytes.extend_from_slice(&ED25519_MULTICODEC);
        bytes.extend_from_slice(key.as_bytes());
        Did(format!("{}{}", DID_KEY_PREFIX, bs58::encode(bytes).into_string()))
    }

    /// Decode the Ed25519 public key embedded in a `did:key`
    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        let encoded = self
            .0
            .strip_prefix(DID_KEY_PREFIX)
            .ok_or_else(|| CryptoError::InvalidDid(format!("not a did:key: {}", self.0)))?;

        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CryptoError::InvalidDid(format!("{}: {}", self.0, e)))?;

        if bytes.len() != 34 || bytes[..2] != ED25519_MULTICODEC {
            return Err(CryptoError::InvalidDid(format!("not an Ed25519 did:key: {}", self.0)));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[2..]);
        VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::InvalidDid(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_did_key(&self) -> bool {
        self.0.starts_with(DID_KEY_PREFIX)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(value: &str) -> Self {
        Did(value.to_string())
    }
}
