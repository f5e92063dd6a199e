//! Schema versioning, migration execution and the migration audit trail

pub mod engine;
pub mod schema;
pub mod tracker;

pub use engine::{Migration, MigrationEngine, MigrationStep, StepError};
pub use schema::{SchemaVersion, SchemaVersionManager, SemVer, MAX_MIGRATION_HOPS};
pub use tracker::{
    DataSnapshot, MigrationDirection, MigrationRecord, MigrationStatistics, MigrationStatus, MigrationTracker,
};
