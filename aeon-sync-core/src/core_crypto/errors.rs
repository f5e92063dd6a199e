//! Error types for crypto operations

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// No local identity has been generated or loaded
    #[error("Crypto provider not initialized")]
    NotInitialized,

    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid capability token: {0}")]
    InvalidToken(String),

    #[error("Capability token expired at {0}")]
    TokenExpired(i64),

    #[error("Missing capability: {0}")]
    MissingCapability(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
}
