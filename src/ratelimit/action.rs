//! Per-identifier handle over a policy.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use super::analyzer::{RateLimitedEvent, Verdict};
use super::limiter::RateLimiter;
use super::policy::{Policy, MAX_BLOCK_TTL};
use crate::error::{PauseError, Result};

/// Result of [`Action::unless_rate_limited`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    /// The work ran and was counted
    Performed(T),
    /// The identifier is rate limited; the work did not run
    Denied(Verdict),
}

/// One identifier acting under one policy.
///
/// Handles are cheap to create: they borrow the limiter and share the
/// policy, so create one per request.
pub struct Action<'a> {
    limiter: &'a RateLimiter,
    policy: Arc<Policy>,
    identifier: String,
}

impl<'a> Action<'a> {
    pub(crate) fn new(limiter: &'a RateLimiter, policy: Arc<Policy>, identifier: String) -> Self {
        Self {
            limiter,
            policy,
            identifier,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn scope(&self) -> &str {
        self.policy.scope()
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Count one occurrence now.
    pub async fn increment(&self) -> Result<()> {
        self.increment_by(1).await
    }

    /// Count `count` occurrences now.
    pub async fn increment_by(&self, count: u64) -> Result<()> {
        let now = self.limiter.clock().now();
        self.increment_at(count, now).await
    }

    /// Count `count` occurrences at `timestamp` (epoch seconds).
    ///
    /// Never evaluates the policy. Store errors propagate: a dropped
    /// increment would silently under-count.
    pub async fn increment_at(&self, count: u64, timestamp: u64) -> Result<()> {
        self.limiter
            .store()
            .increment(self.scope(), &self.identifier, timestamp, count)
            .await
    }

    /// Whether the identifier may proceed.
    ///
    /// Fails closed: if the store cannot answer, the failure is logged and
    /// the identifier is treated as rate limited.
    pub async fn is_ok(&self) -> bool {
        match self.analyze().await {
            Ok(verdict) => verdict.is_none(),
            Err(e) => {
                error!(
                    scope = %self.scope(),
                    identifier = %self.identifier,
                    error = %e,
                    "Rate limit check failed, denying"
                );
                false
            }
        }
    }

    /// Negation of [`Action::is_ok`], failing closed the same way.
    pub async fn is_rate_limited(&self) -> bool {
        !self.is_ok().await
    }

    /// Evaluate the policy. `None` means permitted.
    pub async fn analyze(&self) -> Result<Option<Verdict>> {
        self.analyze_with(false).await
    }

    /// Evaluate the policy; with `recalculate` an existing block is ignored
    /// and the history re-evaluated, so the verdict carries event detail.
    pub async fn analyze_with(&self, recalculate: bool) -> Result<Option<Verdict>> {
        self.limiter
            .analyzer()
            .check(&self.policy, &self.identifier, recalculate)
            .await
    }

    /// Run `work` and count it, unless the identifier is rate limited.
    ///
    /// Only permitted work is counted.
    pub async fn unless_rate_limited<F, Fut, T>(&self, work: F) -> Result<Admission<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(verdict) = self.analyze().await? {
            return Ok(Admission::Denied(verdict));
        }
        let output = work().await;
        self.increment().await?;
        Ok(Admission::Performed(output))
    }

    /// Call `callback` with the breach if a fresh evaluation finds one.
    ///
    /// Returns whether the callback ran.
    pub async fn if_rate_limited<F>(&self, callback: F) -> Result<bool>
    where
        F: FnOnce(&RateLimitedEvent),
    {
        match self.analyze_with(true).await? {
            Some(Verdict::RateLimited(event)) => {
                callback(&event);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Block the identifier for `ttl` seconds without looking at history.
    ///
    /// `ttl` must lie in `1..=MAX_BLOCK_TTL`.
    pub async fn block_for(&self, ttl: u64) -> Result<()> {
        if ttl == 0 || ttl > MAX_BLOCK_TTL {
            return Err(PauseError::Config(format!(
                "block ttl must be between 1 and {} seconds, got {}",
                MAX_BLOCK_TTL, ttl
            )));
        }
        debug!(scope = %self.scope(), identifier = %self.identifier, ttl = ttl, "Manual block");
        self.limiter
            .store()
            .rate_limit(self.scope(), &self.identifier, ttl)
            .await
    }

    /// Whether a block is currently stored, ignoring history and the
    /// scope's enabled flag.
    pub async fn is_blocked(&self) -> Result<bool> {
        self.limiter
            .store()
            .is_rate_limited(self.scope(), &self.identifier)
            .await
    }

    /// Remove the block together with the identifier's history, so the
    /// next check starts from a clean window. Returns whether a block was
    /// removed.
    pub async fn unblock(&self) -> Result<bool> {
        let removed = self
            .limiter
            .store()
            .delete_rate_limited_key(self.scope(), &self.identifier)
            .await?;
        debug!(scope = %self.scope(), identifier = %self.identifier, "Unblocked");
        Ok(removed > 0)
    }
}
