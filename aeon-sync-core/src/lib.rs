//! Aeon sync engine
//!
//! Keeps nodes consistent over an unreliable network: local writes wait in
//! an offline queue, travel as signed (optionally sealed) delta batches, and
//! are checked for conflicts before being applied on the receiving side.

pub mod config;
pub mod core_bandwidth;
pub mod core_conflict;
pub mod core_crypto;
pub mod core_migration;
pub mod core_protocol;
pub mod core_queue;
pub mod core_sync;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Config, FeatureFlags};
pub use errors::{SyncError, SyncResult};
pub use logging::{init_logging, LogLevel};
