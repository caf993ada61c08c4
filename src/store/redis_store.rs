//! Redis-backed counter stores.
//!
//! Layout:
//! - `i:{scope}:|{identifier}|` sorted set, member = bucket timestamp,
//!   score = count, expiring `history` seconds after the last increment
//! - `b:{scope}` sorted set of blocked identifiers scored by expiry
//!   (transactional store); expired members are dropped on every new block
//!   and the set expires with its last member
//! - `b:{scope}:|{identifier}|` string with a TTL per blocked identifier
//!   (sharded store, so every marker lives on its identifier's shard)
//! - `disabled:{scope}` present while the scope is disabled
//!
//! Connections are opened on first use through a shared
//! `redis::aio::ConnectionManager`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, trace};

use super::StoreSettings;
use crate::error::{PauseError, Result};
use crate::ratelimit::keys::{self, ScopedKey};
use crate::ratelimit::policy::MAX_BLOCK_TTL;
use crate::ratelimit::timing::{period_marker, Clock};
use crate::ratelimit::{Bucket, CounterStore};

const SCAN_BATCH: usize = 100;

/// Lazily connected Redis handle shared by clones.
#[derive(Clone)]
struct RedisConnection {
    client: Client,
    manager: Arc<OnceCell<ConnectionManager>>,
}

impl RedisConnection {
    fn open(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| PauseError::Config(format!("Invalid Redis URL {}: {}", url, e)))?;
        Ok(Self {
            client,
            manager: Arc::new(OnceCell::new()),
        })
    }

    async fn get(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        error!(
                            error = %e,
                            addr = ?self.client.get_connection_info().addr,
                            "Error connecting to Redis"
                        );
                        PauseError::from(e)
                    })
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Read a history sorted set, oldest bucket first.
async fn read_history(conn: &mut ConnectionManager, key: &str) -> Result<Vec<Bucket>> {
    let raw: Vec<(u64, f64)> = conn.zrange_withscores(key, 0, -1).await?;
    let mut buckets: Vec<Bucket> = raw
        .into_iter()
        .map(|(timestamp, score)| Bucket::new(timestamp, score.max(0.0) as u64))
        .collect();
    // Scores are counts, so Redis order is not time order
    buckets.sort_by_key(|b| b.timestamp);
    Ok(buckets)
}

/// Trim the oldest buckets once the set holds more than `keep`.
async fn prune_history(
    conn: &mut ConnectionManager,
    key: &str,
    cardinality: u64,
    keep: u64,
) -> Result<()> {
    if cardinality <= keep {
        return Ok(());
    }
    let buckets = read_history(conn, key).await?;
    let excess = buckets.len().saturating_sub(keep as usize);
    if excess == 0 {
        return Ok(());
    }
    let stale: Vec<u64> = buckets[..excess].iter().map(|b| b.timestamp).collect();
    let _: () = conn.zrem(key, stale).await?;

    trace!(key = %key, removed = excess, "Pruned history");
    Ok(())
}

/// SCAN for keys matching `pattern` and return the identifiers of `scope`.
async fn scan_identifiers(
    conn: &mut ConnectionManager,
    pattern: &str,
    scope: &str,
    parse: fn(&str) -> Option<ScopedKey>,
) -> Result<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut ids = Vec::new();
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;

        ids.extend(
            keys.iter()
                .filter_map(|k| parse(k))
                .filter(|k| k.scope == scope)
                .map(|k| k.identifier),
        );

        if next == 0 {
            break;
        }
        cursor = next;
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
}

async fn set_enabled(conn: &mut ConnectionManager, scope: &str, enabled: bool) -> Result<()> {
    let key = keys::disabled_key(scope);
    if enabled {
        let _: () = conn.del(key).await?;
    } else {
        let _: () = conn.set(key, "1").await?;
    }
    debug!(scope = %scope, enabled = enabled, "Scope toggled");
    Ok(())
}

async fn is_enabled(conn: &mut ConnectionManager, scope: &str) -> Result<bool> {
    let disabled: bool = conn.exists(keys::disabled_key(scope)).await?;
    Ok(!disabled)
}

/// Redis store using MULTI/EXEC batches and keyspace scans.
#[derive(Clone)]
pub struct RedisStore {
    connection: RedisConnection,
    settings: StoreSettings,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url` (e.g. "redis://127.0.0.1:6379/1").
    ///
    /// No connection is made until the first operation.
    pub fn open(url: &str, settings: StoreSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            connection: RedisConnection::open(url)?,
            settings,
            clock,
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Unblock `ids` and delete their histories in one batch.
    async fn delete_identifiers(&self, scope: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let history_keys: Vec<String> = ids
            .iter()
            .map(|id| ScopedKey::new(scope, id).history_key())
            .collect();

        let mut conn = self.connection.get().await?;
        let (removed,): (usize,) = redis::pipe()
            .atomic()
            .del(history_keys)
            .ignore()
            .zrem(keys::block_list_key(scope), ids.to_vec())
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        scope: &str,
        identifier: &str,
        timestamp: u64,
        count: u64,
    ) -> Result<()> {
        let key = ScopedKey::new(scope, identifier).history_key();
        let marker = period_marker(self.settings.resolution, timestamp);
        let mut conn = self.connection.get().await?;

        let (cardinality,): (u64,) = redis::pipe()
            .atomic()
            .zincr(&key, marker, count)
            .ignore()
            .expire(&key, self.settings.history as i64)
            .ignore()
            .zcard(&key)
            .query_async(&mut conn)
            .await?;

        prune_history(
            &mut conn,
            &key,
            cardinality,
            self.settings.time_blocks_to_keep,
        )
        .await
    }

    async fn history(&self, scope: &str, identifier: &str) -> Result<Vec<Bucket>> {
        let key = ScopedKey::new(scope, identifier).history_key();
        let mut conn = self.connection.get().await?;
        read_history(&mut conn, &key).await
    }

    async fn rate_limit(&self, scope: &str, identifier: &str, ttl: u64) -> Result<()> {
        let key = keys::block_list_key(scope);
        let now = self.clock.now();
        let expiry = now.saturating_add(ttl.clamp(1, MAX_BLOCK_TTL));
        let mut conn = self.connection.get().await?;

        let (latest,): (Vec<(String, f64)>,) = redis::pipe()
            .atomic()
            .zrembyscore(&key, "-inf", now)
            .ignore()
            .zadd(&key, identifier, expiry)
            .ignore()
            .zrevrange_withscores(&key, 0, 0)
            .query_async(&mut conn)
            .await?;

        // Keep the set alive exactly as long as its longest block
        let latest = latest
            .first()
            .map_or(expiry, |(_, score)| (*score as u64).max(expiry));
        let lifetime = latest.saturating_sub(now).clamp(1, MAX_BLOCK_TTL);
        let _: () = conn.expire(&key, lifetime as i64).await?;
        Ok(())
    }

    async fn is_rate_limited(&self, scope: &str, identifier: &str) -> Result<bool> {
        let key = keys::block_list_key(scope);
        let now = self.clock.now();
        let mut conn = self.connection.get().await?;
        let expiry: Option<f64> = conn.zscore(&key, identifier).await?;

        match expiry {
            Some(expiry) if expiry > now as f64 => Ok(true),
            Some(_) => {
                // Range delete so a block renewed meanwhile survives
                let removed: usize = conn.zrembyscore(&key, "-inf", now).await?;
                trace!(scope = %scope, removed = removed, "Dropped expired blocks");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn all_keys(&self, scope: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.get().await?;
        scan_identifiers(
            &mut conn,
            &keys::history_pattern(scope),
            scope,
            ScopedKey::from_history_key,
        )
        .await
    }

    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>> {
        self.expire_block_list(scope).await?;
        let mut conn = self.connection.get().await?;
        let ids: Vec<String> = conn.zrange(keys::block_list_key(scope), 0, -1).await?;
        Ok(ids)
    }

    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<usize> {
        let ids = self.rate_limited_keys(scope).await?;
        self.delete_identifiers(scope, &ids).await
    }

    async fn delete_rate_limited_key(&self, scope: &str, identifier: &str) -> Result<usize> {
        self.delete_identifiers(scope, &[identifier.to_string()])
            .await
    }

    async fn enable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.get().await?;
        set_enabled(&mut conn, scope, true).await
    }

    async fn disable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.get().await?;
        set_enabled(&mut conn, scope, false).await
    }

    async fn is_enabled(&self, scope: &str) -> Result<bool> {
        let mut conn = self.connection.get().await?;
        is_enabled(&mut conn, scope).await
    }

    async fn expire_block_list(&self, scope: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut conn = self.connection.get().await?;
        let removed: usize = conn
            .zrembyscore(keys::block_list_key(scope), "-inf", now)
            .await?;
        Ok(removed)
    }
}

/// Redis store for sharded deployments.
///
/// Every command touches a single key, so it works behind a sharding proxy.
/// The count update and TTL refresh are separate round trips; a reader can
/// briefly see a stale TTL, never a lost count. Operations that need every
/// key of a scope fail with [`PauseError::UnsupportedOperation`].
#[derive(Clone)]
pub struct ShardedRedisStore {
    connection: RedisConnection,
    settings: StoreSettings,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ShardedRedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedRedisStore")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ShardedRedisStore {
    /// Create a store for `url`. No connection is made until the first
    /// operation.
    pub fn open(url: &str, settings: StoreSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            connection: RedisConnection::open(url)?,
            settings,
            clock,
        })
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }
}

#[async_trait]
impl CounterStore for ShardedRedisStore {
    async fn increment(
        &self,
        scope: &str,
        identifier: &str,
        timestamp: u64,
        count: u64,
    ) -> Result<()> {
        let key = ScopedKey::new(scope, identifier).history_key();
        let marker = period_marker(self.settings.resolution, timestamp);
        let mut conn = self.connection.get().await?;

        let _: () = conn.zincr(&key, marker, count).await?;
        let _: () = conn.expire(&key, self.settings.history as i64).await?;
        let cardinality: u64 = conn.zcard(&key).await?;

        prune_history(
            &mut conn,
            &key,
            cardinality,
            self.settings.time_blocks_to_keep,
        )
        .await
    }

    async fn history(&self, scope: &str, identifier: &str) -> Result<Vec<Bucket>> {
        let key = ScopedKey::new(scope, identifier).history_key();
        let mut conn = self.connection.get().await?;
        read_history(&mut conn, &key).await
    }

    async fn rate_limit(&self, scope: &str, identifier: &str, ttl: u64) -> Result<()> {
        let key = ScopedKey::new(scope, identifier).block_key();
        let ttl = ttl.clamp(1, MAX_BLOCK_TTL);
        let expiry = self.clock.now().saturating_add(ttl);
        let mut conn = self.connection.get().await?;
        let _: () = conn.set_ex(key, expiry, ttl).await?;
        Ok(())
    }

    async fn is_rate_limited(&self, scope: &str, identifier: &str) -> Result<bool> {
        let key = ScopedKey::new(scope, identifier).block_key();
        let mut conn = self.connection.get().await?;
        let blocked: bool = conn.exists(key).await?;
        Ok(blocked)
    }

    async fn all_keys(&self, _scope: &str) -> Result<Vec<String>> {
        Err(PauseError::UnsupportedOperation("all_keys"))
    }

    async fn rate_limited_keys(&self, _scope: &str) -> Result<Vec<String>> {
        Err(PauseError::UnsupportedOperation("rate_limited_keys"))
    }

    async fn delete_rate_limited_keys(&self, _scope: &str) -> Result<usize> {
        Err(PauseError::UnsupportedOperation("delete_rate_limited_keys"))
    }

    async fn delete_rate_limited_key(&self, scope: &str, identifier: &str) -> Result<usize> {
        let key = ScopedKey::new(scope, identifier);
        let mut conn = self.connection.get().await?;
        // The two keys may live on different shards
        let _: () = conn.del(key.history_key()).await?;
        let removed: usize = conn.del(key.block_key()).await?;
        Ok(removed)
    }

    async fn enable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.get().await?;
        set_enabled(&mut conn, scope, true).await
    }

    async fn disable(&self, scope: &str) -> Result<()> {
        let mut conn = self.connection.get().await?;
        set_enabled(&mut conn, scope, false).await
    }

    async fn is_enabled(&self, scope: &str) -> Result<bool> {
        let mut conn = self.connection.get().await?;
        is_enabled(&mut conn, scope).await
    }

    async fn expire_block_list(&self, _scope: &str) -> Result<usize> {
        // Markers carry their own TTL; Redis drops them on expiry
        Ok(0)
    }
}
