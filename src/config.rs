//! Configuration management for Pause.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{PauseError, Result};

/// Main configuration for Pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseConfig {
    /// Width of a counter bucket in seconds
    #[serde(default = "default_resolution")]
    pub resolution: u64,

    /// How long buckets are retained, in seconds
    #[serde(default = "default_history")]
    pub history: u64,

    /// Which store implementation to build
    #[serde(default)]
    pub backend: StoreBackend,

    /// Use the sharded Redis store (no MULTI, no keyspace scans)
    #[serde(default)]
    pub sharded: bool,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            history: default_history(),
            backend: StoreBackend::default(),
            sharded: false,
            redis: RedisConfig::default(),
        }
    }
}

fn default_resolution() -> u64 {
    600
}

fn default_history() -> u64 {
    86400
}

/// Store implementation selected at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default = "default_redis_db")]
    pub db: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: default_redis_db(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_db() -> u32 {
    1
}

impl RedisConfig {
    /// Connection URL for the `redis` client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl PauseConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading Pause configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PauseConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PauseError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by `PAUSE__*`
    /// environment variables (e.g. `PAUSE__REDIS__HOST`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading Pause configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let config: PauseConfig = builder
            .add_source(
                config::Environment::with_prefix("PAUSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PauseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave no bucket to keep.
    pub fn validate(&self) -> Result<()> {
        if self.resolution == 0 {
            return Err(PauseError::Config("resolution must be positive".to_string()));
        }
        if self.history < self.resolution {
            return Err(PauseError::Config(format!(
                "history ({}s) must be at least resolution ({}s)",
                self.history, self.resolution
            )));
        }
        if self.sharded && self.backend == StoreBackend::Memory {
            return Err(PauseError::Config(
                "sharded mode requires the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of buckets retained per identifier.
    pub fn time_blocks_to_keep(&self) -> u64 {
        self.history / self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PauseConfig::default();
        assert_eq!(config.resolution, 600);
        assert_eq!(config.history, 86400);
        assert_eq!(config.time_blocks_to_keep(), 144);
        assert_eq!(config.backend, StoreBackend::Redis);
        assert!(!config.sharded);
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379/1");
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
resolution: 10
history: 60
sharded: true
redis:
  host: cache.internal
"#;
        let config = PauseConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.resolution, 10);
        assert_eq!(config.time_blocks_to_keep(), 6);
        assert!(config.sharded);
        assert_eq!(config.redis.host, "cache.internal");
        assert_eq!(config.redis.port, 6379);
    }

    #[test]
    fn test_history_shorter_than_resolution_rejected() {
        let yaml = "resolution: 60\nhistory: 30\n";
        assert!(matches!(
            PauseConfig::from_yaml(yaml),
            Err(PauseError::Config(_))
        ));
    }

    #[test]
    fn test_zero_resolution_rejected() {
        let config = PauseConfig {
            resolution: 0,
            ..PauseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sharded_memory_rejected() {
        let yaml = "backend: memory\nsharded: true\n";
        assert!(PauseConfig::from_yaml(yaml).is_err());
    }
}
