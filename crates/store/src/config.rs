//! Database configuration.
//!
//! All config structs validate their values at construction time via fallible
//! builders. Deserialized configs should be checked with `validate()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default storage chunk size: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Smallest permitted chunk size: 1 MiB.
pub const MIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Default upper bound on an encoded B-tree node.
pub const DEFAULT_MAX_NODE_SIZE: usize = 4096;

/// Smallest permitted node size bound.
pub const MIN_NODE_SIZE: usize = 128;

/// Default number of decoded index nodes kept in memory.
pub const DEFAULT_NODE_CACHE_SIZE: usize = 16 * 1024;

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Per-transaction resource limits.
///
/// These are a liveness safety valve. Violators are aborted, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranLimits {
    /// Longest an update transaction may stay open.
    #[serde(default = "default_max_update_duration")]
    #[serde(with = "humantime_serde")]
    pub max_update_duration: Duration,
    /// Most records one update transaction may add or remove.
    #[serde(default = "default_max_writes")]
    pub max_writes: usize,
    /// Most update transactions outstanding at once.
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

#[bon::bon]
impl TranLimits {
    /// Creates validated transaction limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any limit is zero.
    #[builder]
    pub fn new(
        #[builder(default = default_max_update_duration())] max_update_duration: Duration,
        #[builder(default = default_max_writes())] max_writes: usize,
        #[builder(default = default_max_outstanding())] max_outstanding: usize,
    ) -> Result<Self, ConfigError> {
        let limits = Self { max_update_duration, max_writes, max_outstanding };
        limits.validate()?;
        Ok(limits)
    }
}

impl TranLimits {
    /// Validates the limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_update_duration.is_zero() {
            return Err(ConfigError::Validation {
                message: "max_update_duration must be non-zero".to_string(),
            });
        }
        if self.max_writes == 0 {
            return Err(ConfigError::Validation {
                message: "max_writes must be >= 1".to_string(),
            });
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Validation {
                message: "max_outstanding must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for TranLimits {
    fn default() -> Self {
        Self {
            max_update_duration: default_max_update_duration(),
            max_writes: default_max_writes(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

fn default_max_update_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_max_writes() -> usize {
    10_000
}

fn default_max_outstanding() -> usize {
    200
}

/// Database configuration.
///
/// # Validation Rules
///
/// - `chunk_size` must be a power of two and >= 1 MiB
/// - `max_node_size` must be >= 128 bytes
/// - `node_cache_size` must be >= 1
/// - `commit_lock_timeout` must be non-zero
///
/// # Example
///
/// ```no_run
/// # use tarn_store::DatabaseConfig;
/// let config = DatabaseConfig::builder()
///     .chunk_size(8 * 1024 * 1024)
///     .checkpoint_interval(100)
///     .build()
///     .expect("valid database config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Bytes per storage chunk. Files grow one chunk at a time.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Encoded size above which a B-tree node splits.
    #[serde(default = "default_max_node_size")]
    pub max_node_size: usize,
    /// Number of decoded index nodes cached.
    #[serde(default = "default_node_cache_size")]
    pub node_cache_size: usize,
    /// How long a commit or checkpoint waits for the commit lock.
    #[serde(default = "default_commit_lock_timeout")]
    #[serde(with = "humantime_serde")]
    pub commit_lock_timeout: Duration,
    /// Checkpoint after this many commits (0 disables automatic checkpoints).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    /// Transaction resource limits.
    #[serde(default)]
    pub limits: TranLimits,
}

#[bon::bon]
impl DatabaseConfig {
    /// Creates a new database configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value violates the rules above.
    #[builder]
    pub fn new(
        #[builder(default = default_chunk_size())] chunk_size: usize,
        #[builder(default = default_max_node_size())] max_node_size: usize,
        #[builder(default = default_node_cache_size())] node_cache_size: usize,
        #[builder(default = default_commit_lock_timeout())] commit_lock_timeout: Duration,
        #[builder(default = default_checkpoint_interval())] checkpoint_interval: u32,
        #[builder(default)] limits: TranLimits,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            chunk_size,
            max_node_size,
            node_cache_size,
            commit_lock_timeout,
            checkpoint_interval,
            limits,
        };
        config.validate()?;
        Ok(config)
    }
}

impl DatabaseConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_CHUNK_SIZE || !self.chunk_size.is_power_of_two() {
            return Err(ConfigError::Validation {
                message: format!(
                    "chunk_size must be a power of two >= {} (1 MiB), got {}",
                    MIN_CHUNK_SIZE, self.chunk_size
                ),
            });
        }
        if self.max_node_size < MIN_NODE_SIZE {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_node_size must be >= {}, got {}",
                    MIN_NODE_SIZE, self.max_node_size
                ),
            });
        }
        if self.max_node_size * 4 > self.chunk_size {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_node_size {} is too large for chunk_size {}",
                    self.max_node_size, self.chunk_size
                ),
            });
        }
        if self.node_cache_size == 0 {
            return Err(ConfigError::Validation {
                message: "node_cache_size must be >= 1".to_string(),
            });
        }
        if self.commit_lock_timeout.is_zero() {
            return Err(ConfigError::Validation {
                message: "commit_lock_timeout must be non-zero".to_string(),
            });
        }
        self.limits.validate()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_node_size: default_max_node_size(),
            node_cache_size: default_node_cache_size(),
            commit_lock_timeout: default_commit_lock_timeout(),
            checkpoint_interval: default_checkpoint_interval(),
            limits: TranLimits::default(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_node_size() -> usize {
    DEFAULT_MAX_NODE_SIZE
}

fn default_node_cache_size() -> usize {
    DEFAULT_NODE_CACHE_SIZE
}

fn default_commit_lock_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_checkpoint_interval() -> u32 {
    1
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_defaults_are_valid() {
        let config = DatabaseConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config, DatabaseConfig::default());
        assert_eq!(config.chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.limits.max_writes, 10_000);
        assert_eq!(config.limits.max_outstanding, 200);
        assert_eq!(config.limits.max_update_duration, Duration::from_secs(10));
    }

    #[test]
    fn test_chunk_size_must_be_power_of_two() {
        let result = DatabaseConfig::builder().chunk_size(3 * 1024 * 1024).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("chunk_size"));

        let result = DatabaseConfig::builder().chunk_size(512 * 1024).build();
        assert!(result.is_err());

        let result = DatabaseConfig::builder().chunk_size(MIN_CHUNK_SIZE).build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_node_size_bounds() {
        assert!(DatabaseConfig::builder().max_node_size(64).build().is_err());
        assert!(
            DatabaseConfig::builder()
                .chunk_size(MIN_CHUNK_SIZE)
                .max_node_size(MIN_CHUNK_SIZE)
                .build()
                .is_err()
        );
        assert!(DatabaseConfig::builder().max_node_size(256).build().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(TranLimits::builder().max_writes(0).build().is_err());
        assert!(TranLimits::builder().max_outstanding(0).build().is_err());
        assert!(TranLimits::builder().max_update_duration(Duration::ZERO).build().is_err());
        assert!(DatabaseConfig::builder().commit_lock_timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn test_serde_humantime_durations() {
        let config = DatabaseConfig::builder()
            .commit_lock_timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"250ms\""), "{json}");
        let back: DatabaseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"limits": {"max_writes": 5}}"#).unwrap();
        assert_eq!(config.limits.max_writes, 5);
        assert_eq!(config.limits.max_outstanding, 200);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        config.validate().unwrap();
    }
}
