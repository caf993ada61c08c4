//! Counter store trait for abstracting in-memory, Redis and sharded Redis storage.

use async_trait::async_trait;

use crate::error::Result;

/// Count aggregated over one bucket of `resolution` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Bucket start, aligned to the resolution
    pub timestamp: u64,
    pub count: u64,
}

impl Bucket {
    pub fn new(timestamp: u64, count: u64) -> Self {
        Self { timestamp, count }
    }
}

/// Storage contract shared by every backend.
///
/// All state is keyed by (scope, identifier). Implementations must be safe
/// to call from many tasks and many processes at once; correctness relies on
/// the store's own atomic primitives, never on locks held by the caller.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `count` to the bucket containing `timestamp`, refresh the history
    /// TTL and drop the oldest buckets beyond the retention bound.
    async fn increment(
        &self,
        scope: &str,
        identifier: &str,
        timestamp: u64,
        count: u64,
    ) -> Result<()>;

    /// Buckets of an identifier, oldest first.
    async fn history(&self, scope: &str, identifier: &str) -> Result<Vec<Bucket>>;

    /// Block an identifier for `ttl` seconds from now. Expired blocks of the
    /// scope may be dropped on the way.
    async fn rate_limit(&self, scope: &str, identifier: &str, ttl: u64) -> Result<()>;

    /// Whether an unexpired block exists for the identifier. An expired one
    /// found here is dropped.
    async fn is_rate_limited(&self, scope: &str, identifier: &str) -> Result<bool>;

    /// Every identifier with history in the scope.
    async fn all_keys(&self, scope: &str) -> Result<Vec<String>>;

    /// Every identifier currently blocked in the scope.
    async fn rate_limited_keys(&self, scope: &str) -> Result<Vec<String>>;

    /// Unblock every identifier of the scope and delete their history.
    /// Returns the number of identifiers unblocked.
    async fn delete_rate_limited_keys(&self, scope: &str) -> Result<usize>;

    /// Unblock one identifier and delete its history.
    /// Returns the number of blocks removed (0 or 1).
    async fn delete_rate_limited_key(&self, scope: &str, identifier: &str) -> Result<usize>;

    async fn enable(&self, scope: &str) -> Result<()>;

    async fn disable(&self, scope: &str) -> Result<()>;

    async fn is_enabled(&self, scope: &str) -> Result<bool>;

    /// Drop expired blocks of the scope so enumeration stays accurate.
    /// Returns the number of blocks dropped.
    async fn expire_block_list(&self, scope: &str) -> Result<usize>;
}
