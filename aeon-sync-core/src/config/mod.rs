//! Configuration management for the sync engine
//!
//! Defaults, TOML files and `AEON_SYNC_<SECTION>_<KEY>` environment
//! overrides, followed by validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod error;
mod feature_flags;

pub use error::ConfigError;
pub use feature_flags::FeatureFlags;

const ENV_PREFIX: &str = "AEON_SYNC";

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub queue: QueueConfig,
    pub bandwidth: BandwidthConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub features: FeatureFlags,
}

/// Node registry and liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How often the heartbeat monitor sweeps the registry
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// A node is healthy iff its last heartbeat is younger than this
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Mint and check capability tokens for authenticated sessions
    pub require_capabilities: bool,
}

/// Offline operation queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued operations
    pub max_operations: usize,

    /// Retry budget for operations enqueued without an explicit one
    pub default_max_retries: u32,

    /// How long a synced operation stays queryable before removal
    #[serde(with = "humantime_serde")]
    pub synced_retention: Duration,

    /// Compaction ticker period (encrypted queue)
    #[serde(with = "humantime_serde")]
    pub compaction_interval: Duration,

    /// Fraction of capacity above which compaction runs
    pub compaction_threshold: f64,

    /// Synced operations older than this are compacted away
    #[serde(with = "humantime_serde")]
    pub compaction_max_age: Duration,

    /// Byte budget for ciphertext held by the encrypted queue
    pub max_bytes: usize,
}

/// Compression, delta and conflict-merge tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Deltas larger than this many serialized bytes are sent as full snapshots
    pub full_operation_threshold: usize,

    /// Initial compression level, 1-9
    pub default_compression_level: u8,

    /// Payloads smaller than this are sent uncompressed
    pub min_compression_size: usize,

    /// Similarity above which update/update conflicts are auto-merged
    pub merge_similarity_threshold: f64,
}

/// Session exchange and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    pub batch_size: usize,

    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    pub backoff_multiplier: f64,

    pub max_reconnect_attempts: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub json_format: bool,
    pub with_target: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            require_capabilities: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            default_max_retries: 3,
            synced_retention: Duration::from_secs(5),
            compaction_interval: Duration::from_secs(60),
            compaction_threshold: 0.8,
            compaction_max_age: Duration::from_secs(3600),
            max_bytes: 50 * 1024 * 1024, // 50 MiB
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            full_operation_threshold: 1000,
            default_compression_level: 6,
            min_compression_size: 0,
            merge_similarity_threshold: 0.7,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            batch_size: 50,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, with_target: true }
    }
}

impl Config {
    /// Load defaults, then apply environment overrides
    ///
    /// Variables follow `AEON_SYNC_<SECTION>_<KEY>`, e.g.
    /// `AEON_SYNC_QUEUE_MAX_OPERATIONS=5000` or
    /// `AEON_SYNC_SYNC_REQUEST_TIMEOUT=15s`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml_string()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::FileWrite(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Coordinator
        env_duration("COORDINATOR_HEARTBEAT_INTERVAL", &mut self.coordinator.heartbeat_interval)?;
        env_duration("COORDINATOR_HEARTBEAT_TIMEOUT", &mut self.coordinator.heartbeat_timeout)?;
        env_parse("COORDINATOR_REQUIRE_CAPABILITIES", &mut self.coordinator.require_capabilities)?;

        // Queue
        env_parse("QUEUE_MAX_OPERATIONS", &mut self.queue.max_operations)?;
        env_parse("QUEUE_DEFAULT_MAX_RETRIES", &mut self.queue.default_max_retries)?;
        env_duration("QUEUE_SYNCED_RETENTION", &mut self.queue.synced_retention)?;
        env_duration("QUEUE_COMPACTION_INTERVAL", &mut self.queue.compaction_interval)?;
        env_parse("QUEUE_COMPACTION_THRESHOLD", &mut self.queue.compaction_threshold)?;
        env_duration("QUEUE_COMPACTION_MAX_AGE", &mut self.queue.compaction_max_age)?;
        env_parse("QUEUE_MAX_BYTES", &mut self.queue.max_bytes)?;

        // Bandwidth
        env_parse("BANDWIDTH_FULL_OPERATION_THRESHOLD", &mut self.bandwidth.full_operation_threshold)?;
        env_parse("BANDWIDTH_DEFAULT_COMPRESSION_LEVEL", &mut self.bandwidth.default_compression_level)?;
        env_parse("BANDWIDTH_MIN_COMPRESSION_SIZE", &mut self.bandwidth.min_compression_size)?;
        env_parse(
            "BANDWIDTH_MERGE_SIMILARITY_THRESHOLD",
            &mut self.bandwidth.merge_similarity_threshold,
        )?;

        // Sync
        env_duration("SYNC_REQUEST_TIMEOUT", &mut self.sync.request_timeout)?;
        env_parse("SYNC_BATCH_SIZE", &mut self.sync.batch_size)?;
        env_duration("SYNC_BACKOFF_INITIAL", &mut self.sync.backoff_initial)?;
        env_duration("SYNC_BACKOFF_MAX", &mut self.sync.backoff_max)?;
        env_parse("SYNC_MAX_RECONNECT_ATTEMPTS", &mut self.sync.max_reconnect_attempts)?;

        // Logging
        if let Ok(level) = env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            self.logging.level = level;
        }
        env_parse("LOG_JSON", &mut self.logging.json_format)?;

        // Features
        env_parse("FEATURES_ENCRYPTION", &mut self.features.encryption)?;
        env_parse("FEATURES_COMPRESSION", &mut self.features.compression)?;
        env_parse("FEATURES_DELTA_SYNC", &mut self.features.delta_sync)?;
        env_parse("FEATURES_CAPABILITY_VERIFICATION", &mut self.features.capability_verification)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.heartbeat_timeout <= self.coordinator.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_timeout must be greater than heartbeat_interval".to_string(),
            ));
        }

        if self.queue.max_operations == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_operations must be greater than 0".to_string(),
            ));
        }

        if !(self.queue.compaction_threshold > 0.0 && self.queue.compaction_threshold <= 1.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.queue.compaction_threshold
            )));
        }

        if !(1..=9).contains(&self.bandwidth.default_compression_level) {
            return Err(ConfigError::ValidationFailed(format!(
                "default_compression_level must be 1-9, got {}",
                self.bandwidth.default_compression_level
            )));
        }

        if !(self.bandwidth.merge_similarity_threshold > 0.0
            && self.bandwidth.merge_similarity_threshold <= 1.0)
        {
            return Err(ConfigError::ValidationFailed(format!(
                "merge_similarity_threshold must be in (0, 1], got {}",
                self.bandwidth.merge_similarity_threshold
            )));
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.sync.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

fn env_parse<T>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}_{}", ENV_PREFIX, key);
    if let Ok(raw) = env::var(&name) {
        *slot = raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue { key: name, reason: e.to_string() })?;
    }
    Ok(())
}

fn env_duration(key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
    let name = format!("{}_{}", ENV_PREFIX, key);
    if let Ok(raw) = env::var(&name) {
        *slot = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidValue { key: name, reason: e.to_string() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.bandwidth.full_operation_threshold, 1000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.queue.max_operations = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.coordinator.heartbeat_interval = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config = Config::default();
        config.bandwidth.default_compression_level = 10;
        assert!(config.validate().is_err());

        config = Config::default();
        config.queue.compaction_threshold = 1.5;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_with_humantime() {
        let toml = r#"
            [queue]
            max_operations = 25
            synced_retention = "2s"

            [sync]
            request_timeout = "1m 30s"

            [features]
            encryption = true
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.queue.max_operations, 25);
        assert_eq!(config.queue.synced_retention, Duration::from_secs(2));
        assert_eq!(config.sync.request_timeout, Duration::from_secs(90));
        assert!(config.features.encryption);
        // untouched sections keep their defaults
        assert_eq!(config.queue.default_max_retries, 3);

        let rendered = config.to_toml_string().unwrap();
        let reparsed = Config::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.sync.request_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aeon-sync.toml");

        let mut config = Config::default();
        config.sync.batch_size = 7;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.sync.batch_size, 7);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(Config::from_toml_str("[queue\nmax"), Err(ConfigError::Parse(_))));
    }
}
