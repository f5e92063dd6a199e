//! Node registry, replication policies and the sync control loop

pub mod backoff;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod replication;

pub use backoff::Backoff;
pub use coordinator::{
    CoordinatorStatistics, EncryptionMode, Node, NodeHealth, NodeInfo, NodeStatus, SessionStatus, SessionUpdate,
    SyncCoordinator, SyncSession,
};
pub use engine::{DocumentState, FlushReport, SyncEngine};
pub use events::{SyncEvent, SyncEventRecord};
pub use replication::{
    ConsistencyLevel, PolicyOptions, Replica, ReplicaStatus, ReplicationHealth, ReplicationManager,
    ReplicationPolicy, ReplicationStatusReport,
};
