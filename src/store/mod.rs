//! Counter store implementations.
//!
//! - [`MemoryStore`]: single process, used for embedding and tests
//! - [`RedisStore`]: Redis with MULTI/EXEC batches and keyspace scans
//! - [`ShardedRedisStore`]: Redis behind a sharding proxy; no transactions,
//!   no operations that need every key

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, ShardedRedisStore};

use std::sync::Arc;
use tracing::info;

use crate::config::{PauseConfig, StoreBackend};
use crate::error::{PauseError, Result};
use crate::ratelimit::timing::Clock;
use crate::ratelimit::CounterStore;

/// Bucketing and retention settings shared by every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Bucket width in seconds
    pub resolution: u64,
    /// Retention horizon in seconds
    pub history: u64,
    /// Maximum number of buckets kept per identifier
    pub time_blocks_to_keep: u64,
}

impl StoreSettings {
    pub fn new(resolution: u64, history: u64) -> Result<Self> {
        if resolution == 0 {
            return Err(PauseError::Config("resolution must be positive".to_string()));
        }
        let time_blocks_to_keep = history / resolution;
        if time_blocks_to_keep == 0 {
            return Err(PauseError::Config(format!(
                "history ({}s) must be at least resolution ({}s)",
                history, resolution
            )));
        }
        Ok(Self {
            resolution,
            history,
            time_blocks_to_keep,
        })
    }

    pub fn from_config(config: &PauseConfig) -> Result<Self> {
        Self::new(config.resolution, config.history)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        let config = PauseConfig::default();
        Self {
            resolution: config.resolution,
            history: config.history,
            time_blocks_to_keep: config.time_blocks_to_keep(),
        }
    }
}

/// Build the store selected by the configuration.
pub fn build_store(config: &PauseConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    config.validate()?;
    let settings = StoreSettings::from_config(config)?;

    let store: Arc<dyn CounterStore> = match (config.backend, config.sharded) {
        (StoreBackend::Memory, _) => Arc::new(MemoryStore::with_clock(settings, clock)),
        (StoreBackend::Redis, false) => {
            Arc::new(RedisStore::open(&config.redis.url(), settings, clock)?)
        }
        (StoreBackend::Redis, true) => {
            Arc::new(ShardedRedisStore::open(&config.redis.url(), settings, clock)?)
        }
    };

    info!(
        backend = ?config.backend,
        sharded = config.sharded,
        resolution = settings.resolution,
        history = settings.history,
        "Counter store initialized"
    );
    Ok(store)
}
