//! Configuration for shardcoord components
//!
//! Settings are read from an optional TOML file and overridden by
//! `SHARDCOORD__<SECTION>__<KEY>` environment variables. Durations use the
//! short human form accepted by [`parse_duration`] (`"500ms"`, `"30s"`, `"5m"`).

use crate::common::utils::parse_duration;
use crate::common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "shardcoord.toml";

const ENV_PREFIX: &str = "SHARDCOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Voting configuration settings
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Replica allocation settings
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            allocation: AllocationConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Voting configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Shrink the voting configuration automatically as master-eligible
    /// nodes are lost
    #[serde(default = "default_auto_shrink")]
    pub auto_shrink_voting_configuration: bool,

    /// Upper bound on the encoded size of a published coordination metadata
    #[serde(default = "default_max_publication_bytes")]
    pub max_publication_bytes: u64,
}

fn default_auto_shrink() -> bool {
    true
}
fn default_max_publication_bytes() -> u64 {
    1024 * 1024
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            auto_shrink_voting_configuration: default_auto_shrink(),
            max_publication_bytes: default_max_publication_bytes(),
        }
    }
}

/// Replica allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Per-node timeout of a copy metadata request
    #[serde(
        default = "default_fetch_timeout",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub fetch_timeout: Duration,

    /// How many times an inconclusive fetch round is repeated before the
    /// engine decides with the data it has
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Base delay before an inconclusive round is repeated
    #[serde(
        default = "default_fetch_retry_backoff",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub fetch_retry_backoff: Duration,

    /// How long a node is skipped after a recovery towards it failed
    #[serde(
        default = "default_failure_cooldown",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub failure_cooldown: Duration,

    /// Failed recoveries tolerated before a shard is reported stuck
    #[serde(default = "default_max_failed_allocations")]
    pub max_failed_allocations: u32,
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_fetch_retries() -> u32 {
    3
}
fn default_fetch_retry_backoff() -> Duration {
    Duration::from_millis(100)
}
fn default_failure_cooldown() -> Duration {
    Duration::from_secs(60)
}
fn default_max_failed_allocations() -> u32 {
    5
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            max_fetch_retries: default_max_fetch_retries(),
            fetch_retry_backoff: default_fetch_retry_backoff(),
            failure_cooldown: default_failure_cooldown(),
            max_failed_allocations: default_max_failed_allocations(),
        }
    }
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn ser_duration<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", value.as_millis()))
}

impl Config {
    /// Load from `shardcoord.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given file (if present) and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordination layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.allocation.fetch_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "allocation.fetch_timeout must be positive".into(),
            ));
        }
        if self.allocation.max_failed_allocations == 0 {
            return Err(Error::InvalidConfig(
                "allocation.max_failed_allocations must be at least 1".into(),
            ));
        }
        if self.coordination.max_publication_bytes == 0 {
            return Err(Error::InvalidConfig(
                "coordination.max_publication_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn toml_file() -> NamedTempFile {
        Builder::new().suffix(".toml").tempfile().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.coordination.auto_shrink_voting_configuration);
        assert_eq!(config.allocation.max_failed_allocations, 5);
        assert_eq!(config.allocation.fetch_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = toml_file();
        writeln!(
            file,
            r#"
log_level = "debug"

[coordination]
auto_shrink_voting_configuration = false

[allocation]
fetch_timeout = "5s"
failure_cooldown = "2m"
max_failed_allocations = 2
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(!config.coordination.auto_shrink_voting_configuration);
        assert_eq!(config.coordination.max_publication_bytes, 1024 * 1024);
        assert_eq!(config.allocation.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.allocation.failure_cooldown, Duration::from_secs(120));
        assert_eq!(config.allocation.max_failed_allocations, 2);
        assert_eq!(config.allocation.max_fetch_retries, 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("absent.toml")).unwrap();
        assert!(config.coordination.auto_shrink_voting_configuration);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = toml_file();
        writeln!(file, "[allocation]\nmax_failed_allocations = 0").unwrap();
        assert!(matches!(
            Config::load_from(file.path()),
            Err(Error::InvalidConfig(_))
        ));

        let mut file = toml_file();
        writeln!(file, "[allocation]\nfetch_timeout = \"10x\"").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }
}
