//! In-process counter store.
//!
//! Keeps the same layout as the Redis store (bucket histories with a TTL,
//! blocks with an expiry, a disabled set) in concurrent maps. Each history
//! update runs under its map entry's lock, so increment, TTL refresh and
//! pruning are atomic per identifier.
//!
//! Expired entries are dropped when read, and swept in bulk every
//! `SWEEP_INTERVAL` increments and on every new block, so identifiers that
//! are never seen again do not pile up.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::StoreSettings;
use crate::error::Result;
use crate::ratelimit::keys::ScopedKey;
use crate::ratelimit::policy::MAX_BLOCK_TTL;
use crate::ratelimit::timing::{period_marker, Clock, SystemClock};
use crate::ratelimit::{Bucket, CounterStore};

const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Default)]
struct Series {
    /// bucket timestamp -> count
    buckets: BTreeMap<u64, u64>,
    expires_at: u64,
}

/// Counter store living in this process's memory.
#[derive(Debug)]
pub struct MemoryStore {
    settings: StoreSettings,
    clock: Arc<dyn Clock>,
    histories: DashMap<ScopedKey, Series>,
    /// identifier -> block expiry
    blocks: DashMap<ScopedKey, u64>,
    disabled: RwLock<HashSet<String>>,
    increments: AtomicU64,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new(settings: StoreSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock::new()))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(settings: StoreSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            histories: DashMap::new(),
            blocks: DashMap::new(),
            disabled: RwLock::new(HashSet::new()),
            increments: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn identifiers_in<V>(map: &DashMap<ScopedKey, V>, scope: &str) -> Vec<String> {
        let mut ids: Vec<String> = map
            .iter()
            .filter(|entry| entry.key().scope == scope)
            .map(|entry| entry.key().identifier.clone())
            .collect();
        ids.sort();
        ids
    }

    fn remove_expired_history(&self, key: &ScopedKey, now: u64) {
        self.histories
            .remove_if(key, |_, series| series.expires_at <= now);
    }

    /// Drop every expired history and block, whatever its scope.
    fn sweep(&self, now: u64) {
        self.histories.retain(|_, series| series.expires_at > now);
        self.blocks.retain(|_, expiry| *expiry > now);
        trace!(
            histories = self.histories.len(),
            blocks = self.blocks.len(),
            "Swept expired entries"
        );
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        scope: &str,
        identifier: &str,
        timestamp: u64,
        count: u64,
    ) -> Result<()> {
        let now = self.clock.now();
        let key = ScopedKey::new(scope, identifier);
        let marker = period_marker(self.settings.resolution, timestamp);

        // Must run before the entry below is locked
        let seen = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % SWEEP_INTERVAL == 0 {
            self.sweep(now);
        }

        let mut series = self.histories.entry(key).or_default();
        if series.expires_at <= now {
            // Whole history aged out before this increment
            series.buckets.clear();
        }
        let bucket = series.buckets.entry(marker).or_insert(0);
        *bucket = bucket.saturating_add(count);
        series.expires_at = now.saturating_add(self.settings.history);

        while series.buckets.len() as u64 > self.settings.time_blocks_to_keep {
            series.buckets.pop_first();
        }

        trace!(
            scope = %scope,
            identifier = %identifier,
            bucket = marker,
            count = count,
            "Incremented bucket"
        );
        Ok(())
    }

    async fn history(&self, scope: &str, identifier: &str) -> Result<Vec<Bucket>> {
        let now = self.clock.now();
        let key = ScopedKey::new(scope, identifier);
        self.remove_expired_history(&key, now);

        Ok(self
            .histories
            .get(&key)
            .map(|series| {
                series
                    .buckets
                    .iter()
                    .map(|(&timestamp, &count)| Bucket::new(timestamp, count))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rate_limit(&self, scope: &str, identifier: &str, ttl: u64) -> Result<()> {
        let expiry = self
            .clock
            .now()
            .saturating_add(ttl.clamp(1, MAX_BLOCK_TTL));
        self.expire_block_list(scope).await?;
        self.blocks
            .insert(ScopedKey::new(scope, identifier), expiry);
        Ok(())
    }

    async fn is_rate_limited(&self, scope: &str, identifier: &str) -> Result<bool> {
        let now = self.clock.now();
        let key = ScopedKey::new(scope, identifier);
        if self.blocks.remove_if(&key, |_, expiry| *expiry <= now).is_some() {
            return Ok(false);
        }
        Ok(self.blocks.contains_key(&key))
    }

    async fn all_keys(&self, scope: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        self.histories.retain(|_, series| series.expires_at > now);
        Ok(Self::identifiers_in(&self.histories, scope))
    }

    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.expire_block_list(scope).await?;
        Ok(Self::identifiers_in(&self.blocks, scope))
    }

    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<usize> {
        let ids = self.rate_limited_keys(scope).await?;
        let mut removed = 0;
        for id in &ids {
            removed += self.delete_rate_limited_key(scope, id).await?;
        }
        Ok(removed)
    }

    async fn delete_rate_limited_key(&self, scope: &str, identifier: &str) -> Result<usize> {
        let key = ScopedKey::new(scope, identifier);
        self.histories.remove(&key);
        Ok(usize::from(self.blocks.remove(&key).is_some()))
    }

    async fn enable(&self, scope: &str) -> Result<()> {
        self.disabled.write().remove(scope);
        Ok(())
    }

    async fn disable(&self, scope: &str) -> Result<()> {
        self.disabled.write().insert(scope.to_string());
        Ok(())
    }

    async fn is_enabled(&self, scope: &str) -> Result<bool> {
        Ok(!self.disabled.read().contains(scope))
    }

    async fn expire_block_list(&self, scope: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut dropped = 0;
        self.blocks.retain(|key, expiry| {
            let keep = key.scope != scope || *expiry > now;
            if !keep {
                dropped += 1;
            }
            keep
        });
        Ok(dropped)
    }
}
