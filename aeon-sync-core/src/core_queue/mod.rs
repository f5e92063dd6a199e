//! Offline operation queue
//!
//! Local writes wait here until a sync round acknowledges them.

pub mod encrypted_queue;
pub mod offline_queue;
pub mod operation;
pub mod sync_queue;

pub use encrypted_queue::{CompactionReport, EncryptedOfflineQueue, EncryptedQueueStats};
pub use offline_queue::{OfflineOperationQueue, QueueStats};
pub use operation::{Operation, OperationPriority, OperationStatus};
pub use sync_queue::SyncQueue;
