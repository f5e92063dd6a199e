//! Schema versions and the compatibility graph between them

use crate::errors::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Longest path `get_migration_path` will walk
pub const MAX_MIGRATION_HOPS: usize = 100;

/// `major.minor.patch`, ordered semantically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidState(format!("invalid schema version '{}'", s));
        let mut parts = s.trim().trim_start_matches('v').split('.');
        let mut next = || -> SyncResult<u32> { parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid()) };
        let version = SemVer::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl From<SemVer> for String {
    fn from(version: SemVer) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for SemVer {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A registered schema version
///
/// Equality and ordering only look at `major.minor.patch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub breaking: bool,
}

impl SchemaVersion {
    pub fn new(version: SemVer, description: impl Into<String>, breaking: bool) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
            patch: version.patch,
            timestamp: Utc::now(),
            description: description.into(),
            breaking,
        }
    }

    /// Parse `major.minor.patch` into a version
    pub fn parse(version: &str, description: impl Into<String>, breaking: bool) -> SyncResult<Self> {
        Ok(Self::new(version.parse()?, description, breaking))
    }

    pub fn semver(&self) -> SemVer {
        SemVer::new(self.major, self.minor, self.patch)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.semver().fmt(f)
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.semver() == other.semver()
    }
}

impl Eq for SchemaVersion {}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.semver().cmp(&other.semver())
    }
}

#[derive(Debug, Default)]
pub struct SchemaVersionManager {
    versions: BTreeMap<SemVer, SchemaVersion>,
    /// from -> versions reachable in one migration step
    compatibility: BTreeMap<SemVer, BTreeSet<SemVer>>,
    current: Option<SemVer>,
}

impl SchemaVersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_version(&mut self, version: SchemaVersion) -> SyncResult<()> {
        let key = version.semver();
        if self.versions.contains_key(&key) {
            return Err(SyncError::InvalidState(format!("schema version {} already registered", key)));
        }
        debug!(version = %key, breaking = version.breaking, "Schema version registered");
        self.versions.insert(key, version);
        Ok(())
    }

    pub fn get_version(&self, version: SemVer) -> Option<&SchemaVersion> {
        self.versions.get(&version)
    }

    /// Every registered version, oldest first
    pub fn get_versions(&self) -> Vec<&SchemaVersion> {
        self.versions.values().collect()
    }

    pub fn get_latest(&self) -> Option<&SchemaVersion> {
        self.versions.values().next_back()
    }

    fn require(&self, version: SemVer) -> SyncResult<()> {
        if self.versions.contains_key(&version) {
            Ok(())
        } else {
            Err(SyncError::not_found("schema version", version.to_string()))
        }
    }

    pub fn set_current(&mut self, version: SemVer) -> SyncResult<()> {
        self.require(version)?;
        info!(version = %version, "Schema version set");
        self.current = Some(version);
        Ok(())
    }

    pub fn get_current(&self) -> Option<&SchemaVersion> {
        self.current.and_then(|v| self.versions.get(&v))
    }

    /// Declare that data at `from` can migrate directly to `to`
    pub fn mark_compatible(&mut self, from: SemVer, to: SemVer) -> SyncResult<()> {
        self.require(from)?;
        self.require(to)?;
        self.compatibility.entry(from).or_default().insert(to);
        Ok(())
    }

    pub fn is_compatible(&self, from: SemVer, to: SemVer) -> bool {
        from == to || self.compatibility.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// Whether any version in `(from, to]` is marked breaking
    pub fn crosses_breaking_change(&self, from: SemVer, to: SemVer) -> bool {
        let (low, high) = if from < to { (from, to) } else { (to, from) };
        self.versions
            .range(low..=high)
            .any(|(key, version)| *key != low && version.breaking)
    }

    /// Versions to step through from `from` to `to`, excluding `from`
    ///
    /// Each hop moves to the compatible version closest to the target without
    /// passing it. Walks at most `MAX_MIGRATION_HOPS` steps.
    pub fn get_migration_path(&self, from: SemVer, to: SemVer) -> SyncResult<Vec<SemVer>> {
        self.require(from)?;
        self.require(to)?;

        let mut path = Vec::new();
        let mut current = from;
        while current != to {
            if path.len() == MAX_MIGRATION_HOPS {
                return Err(SyncError::InvalidState(format!(
                    "no migration path from {} to {} within {} hops",
                    from, to, MAX_MIGRATION_HOPS
                )));
            }
            let targets = self.compatibility.get(&current);
            let next = match targets {
                Some(targets) if targets.contains(&to) => Some(to),
                Some(targets) if to > current => targets.range(..to).rev().find(|v| **v > current).copied(),
                Some(targets) => targets.range(to..).find(|v| **v < current).copied(),
                None => None,
            };
            let Some(next) = next else {
                return Err(SyncError::NotFound(format!("no migration path from {} to {} (stuck at {})", from, to, current)));
            };
            path.push(next);
            current = next;
        }
        Ok(path)
    }
}
