/*
    errors.rs - Error taxonomy for the sync engine

    Every public operation returns SyncResult<T>. Expected divergence
    (conflicts, bad signatures, failed verification) is never an Err: it is
    returned as a tagged value by the component that detected it.
*/

use crate::config::ConfigError;
use crate::core_crypto::CryptoError;
use crate::logging::LoggingError;
use thiserror::Error;

/// Errors that can occur anywhere in the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Unknown node, replica, session, conflict, policy or migration id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or unparseable protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Signature or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Queue full and nothing evictable
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Network or timeout failure during a sync exchange
    #[error("Retryable sync failure: {0}")]
    RetryableSync(String),

    /// Retries exhausted
    #[error("Sync failed after {retries} retries: {reason}")]
    TerminalSync { retries: u32, reason: String },

    /// A migration's up/down function failed
    #[error("Migration {migration_id} failed: {reason}")]
    Migration { migration_id: String, reason: String },

    /// Illegal state transition or invalid argument
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration failure
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Logging initialization failure
    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

impl SyncError {
    /// Whether the failed item should go back to `pending`
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RetryableSync(_))
    }

    pub fn not_found(kind: &str, id: impl AsRef<str>) -> Self {
        SyncError::NotFound(format!("{} '{}'", kind, id.as_ref()))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type for sync engine operations
pub type SyncResult<T> = Result<T, SyncError>;
