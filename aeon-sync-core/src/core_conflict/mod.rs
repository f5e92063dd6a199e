//! Conflict detection, resolution and multi-version reconciliation

pub mod conflict;
pub mod reconciler;
pub mod resolver;

pub use conflict::{
    merge_values, similarity, Conflict, ConflictSeverity, ConflictType, Resolution, ResolutionStrategy,
};
pub use reconciler::{
    content_hash, ExcludedVersion, ReconciliationResult, ReconciliationStrategy, StateReconciler, StateVersion,
};
pub use resolver::{ConflictResolver, ConflictStatistics};
