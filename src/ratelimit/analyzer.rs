//! The decision engine.
//!
//! Sums bucket history over each check's sliding window, newest bucket
//! first, and blocks the identifier on the first check whose threshold is
//! met. The window is approximated at bucket granularity, so a bucket
//! counts in full as long as its start lies inside the window.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Bucket, CounterStore};
use super::policy::{BlockMode, PeriodCheck, Policy};
use super::timing::{period_marker, Clock};
use crate::error::Result;

/// A breach detected by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitedEvent {
    pub scope: String,
    pub identifier: String,
    /// The check that breached
    pub period_check: PeriodCheck,
    /// Sum of the window at the moment the threshold was met
    pub sum: u64,
    /// How long the identifier was blocked for
    pub block_ttl: u64,
    /// Wall-clock decision time in epoch seconds (not bucket aligned)
    pub timestamp: u64,
}

/// Why an identifier is not allowed to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A block was already in place; nothing was recomputed
    Blocked,
    /// This evaluation found a breach and applied a block
    RateLimited(RateLimitedEvent),
}

impl Verdict {
    /// The breach detail, when this evaluation produced one.
    pub fn event(&self) -> Option<&RateLimitedEvent> {
        match self {
            Verdict::Blocked => None,
            Verdict::RateLimited(event) => Some(event),
        }
    }
}

/// Outcome of evaluating a policy over a history, before any block is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach<'a> {
    pub check: &'a PeriodCheck,
    pub sum: u64,
    pub block_ttl: u64,
}

/// Evaluate `checks` in order against `history` (oldest bucket first).
///
/// Returns the first breaching check. Later checks are not evaluated.
pub fn evaluate<'a>(
    checks: &'a [PeriodCheck],
    history: &[Bucket],
    now_bucket: u64,
) -> Option<Breach<'a>> {
    for check in checks {
        let window_start = now_bucket.saturating_sub(check.period_seconds);
        let mut sum: u64 = 0;

        for bucket in history.iter().rev() {
            // History is time ordered: everything further back is older still
            if bucket.timestamp < window_start {
                break;
            }
            sum = sum.saturating_add(bucket.count);

            if sum >= check.max_allowed {
                let block_ttl = match check.mode {
                    BlockMode::Fixed => check.block_ttl(),
                    // Until this bucket falls out of the window
                    BlockMode::Dynamic => bucket
                        .timestamp
                        .saturating_add(check.period_seconds)
                        .saturating_sub(now_bucket)
                        .max(1),
                };
                return Some(Breach {
                    check,
                    sum,
                    block_ttl,
                });
            }
        }
    }
    None
}

/// Reads history from the store, evaluates a policy and applies blocks.
pub struct Analyzer {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    resolution: u64,
}

impl Analyzer {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, resolution: u64) -> Self {
        Self {
            store,
            clock,
            resolution,
        }
    }

    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Decide whether `identifier` may proceed under `policy`.
    ///
    /// Returns `None` when permitted. Unless `recalculate` is set, an
    /// existing block short-circuits to [`Verdict::Blocked`]. Store errors
    /// propagate.
    pub async fn check(
        &self,
        policy: &Policy,
        identifier: &str,
        recalculate: bool,
    ) -> Result<Option<Verdict>> {
        let scope = policy.scope();

        if !self.store.is_enabled(scope).await? {
            trace!(scope = %scope, "Scope disabled, skipping analysis");
            return Ok(None);
        }

        if !recalculate && self.store.is_rate_limited(scope, identifier).await? {
            trace!(scope = %scope, identifier = %identifier, "Already blocked");
            return Ok(Some(Verdict::Blocked));
        }

        let now = self.clock.now();
        let now_bucket = period_marker(self.resolution, now);
        let history = self.store.history(scope, identifier).await?;

        let Some(breach) = evaluate(policy.checks(), &history, now_bucket) else {
            return Ok(None);
        };

        self.store
            .rate_limit(scope, identifier, breach.block_ttl)
            .await?;

        debug!(
            scope = %scope,
            identifier = %identifier,
            period_seconds = breach.check.period_seconds,
            max_allowed = breach.check.max_allowed,
            sum = breach.sum,
            block_ttl = breach.block_ttl,
            "Rate limit exceeded"
        );

        Ok(Some(Verdict::RateLimited(RateLimitedEvent {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
            period_check: breach.check.clone(),
            sum: breach.sum,
            block_ttl: breach.block_ttl,
            timestamp: now,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::MAX_BLOCK_TTL;
    use crate::ratelimit::timing::ManualClock;
    use crate::store::{MemoryStore, StoreSettings};

    const T0: u64 = 1_700_000_000;

    fn check(period: u64, max: u64, ttl: u64) -> PeriodCheck {
        PeriodCheck::new(period, max, Some(ttl)).unwrap()
    }

    fn setup() -> (ManualClock, Arc<MemoryStore>, Analyzer) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(
            StoreSettings::new(10, 60).unwrap(),
            Arc::new(clock.clone()),
        ));
        let analyzer = Analyzer::new(store.clone(), Arc::new(clock.clone()), 10);
        (clock, store, analyzer)
    }

    #[test]
    fn test_evaluate_below_threshold() {
        let checks = vec![check(20, 5, 12)];
        let history = vec![Bucket::new(T0, 4)];
        assert!(evaluate(&checks, &history, T0).is_none());
    }

    #[test]
    fn test_evaluate_threshold_is_inclusive() {
        let checks = vec![check(20, 5, 12)];
        let history = vec![Bucket::new(T0 - 10, 2), Bucket::new(T0, 3)];

        let breach = evaluate(&checks, &history, T0).unwrap();
        assert_eq!(breach.sum, 5);
        assert_eq!(breach.block_ttl, 12);
    }

    #[test]
    fn test_evaluate_excludes_buckets_outside_window() {
        let checks = vec![check(20, 5, 12)];
        let history = vec![Bucket::new(T0 - 100, 50), Bucket::new(T0, 1)];
        assert!(evaluate(&checks, &history, T0).is_none());
    }

    #[test]
    fn test_evaluate_window_edge_bucket_counts() {
        let checks = vec![check(20, 5, 12)];
        // window_start = T0 - 20, so that bucket is inside
        let history = vec![Bucket::new(T0 - 20, 4), Bucket::new(T0, 1)];
        assert_eq!(evaluate(&checks, &history, T0).unwrap().sum, 5);

        let history = vec![Bucket::new(T0 - 30, 4), Bucket::new(T0, 1)];
        assert!(evaluate(&checks, &history, T0).is_none());
    }

    #[test]
    fn test_evaluate_registration_order_wins() {
        let checks = vec![check(20, 5, 12), check(40, 7, 99)];
        let history = vec![Bucket::new(T0 - 30, 10), Bucket::new(T0, 5)];

        let breach = evaluate(&checks, &history, T0).unwrap();
        assert_eq!(breach.check.period_seconds, 20);
        assert_eq!(breach.block_ttl, 12);
    }

    #[test]
    fn test_evaluate_falls_through_to_later_check() {
        let checks = vec![check(20, 5, 12), check(40, 7, 99)];
        let history = vec![Bucket::new(T0 - 30, 4), Bucket::new(T0, 3)];

        let breach = evaluate(&checks, &history, T0).unwrap();
        assert_eq!(breach.check.period_seconds, 40);
        assert_eq!(breach.sum, 7);
    }

    #[test]
    fn test_evaluate_dynamic_ttl() {
        let checks = vec![check(60, 5, 3600).with_mode(BlockMode::Dynamic)];
        // Threshold met at the T0 - 40 bucket; it leaves the window 20s after T0
        let history = vec![
            Bucket::new(T0 - 50, 9),
            Bucket::new(T0 - 40, 2),
            Bucket::new(T0, 3),
        ];

        let breach = evaluate(&checks, &history, T0).unwrap();
        assert_eq!(breach.sum, 5);
        assert_eq!(breach.block_ttl, 20);
    }

    #[test]
    fn test_evaluate_dynamic_ttl_counts_from_now_not_last_activity() {
        let checks = vec![check(60, 5, 3600).with_mode(BlockMode::Dynamic)];
        // The burst happened 50s ago and leaves the window in 10s
        let history = vec![Bucket::new(T0 - 50, 5)];
        assert_eq!(evaluate(&checks, &history, T0).unwrap().block_ttl, 10);
    }

    #[test]
    fn test_evaluate_large_values_do_not_overflow() {
        let checks = vec![check(MAX_BLOCK_TTL, u64::MAX, MAX_BLOCK_TTL)
            .with_mode(BlockMode::Dynamic)];
        let history = vec![
            Bucket::new(u64::MAX - 20, u64::MAX - 1),
            Bucket::new(u64::MAX - 10, 5),
        ];
        let breach = evaluate(&checks, &history, u64::MAX - 10).unwrap();
        assert_eq!(breach.sum, u64::MAX);
        assert_eq!(breach.block_ttl, 10);
    }

    #[test]
    fn test_evaluate_dynamic_ttl_single_bucket_blocks_full_period() {
        let checks = vec![check(60, 5, 3600).with_mode(BlockMode::Dynamic)];
        let history = vec![Bucket::new(T0, 5)];
        assert_eq!(evaluate(&checks, &history, T0).unwrap().block_ttl, 60);
    }

    #[tokio::test]
    async fn test_check_blocks_on_breach() {
        let (_clock, store, analyzer) = setup();
        let policy = Policy::new("ipn:follow", vec![check(20, 5, 12), check(40, 7, 12)]).unwrap();

        for _ in 0..4 {
            store.increment("ipn:follow", "1243123", T0, 1).await.unwrap();
            assert!(analyzer
                .check(&policy, "1243123", false)
                .await
                .unwrap()
                .is_none());
        }

        store.increment("ipn:follow", "1243123", T0, 1).await.unwrap();
        let verdict = analyzer.check(&policy, "1243123", false).await.unwrap();
        let event = verdict.as_ref().and_then(Verdict::event).unwrap();
        assert_eq!(event.sum, 5);
        assert_eq!(event.period_check.period_seconds, 20);
        assert_eq!(event.timestamp, T0);
        assert!(store.is_rate_limited("ipn:follow", "1243123").await.unwrap());

        // Now blocked: short-circuit without recomputing
        assert_eq!(
            analyzer.check(&policy, "1243123", false).await.unwrap(),
            Some(Verdict::Blocked)
        );
    }

    #[tokio::test]
    async fn test_event_timestamp_is_not_bucket_rounded() {
        let (clock, store, analyzer) = setup();
        let policy = Policy::new("scope", vec![check(20, 1, 12)]).unwrap();

        clock.set(T0 + 7);
        store.increment("scope", "id", T0 + 7, 1).await.unwrap();
        let verdict = analyzer.check(&policy, "id", false).await.unwrap().unwrap();
        assert_eq!(verdict.event().unwrap().timestamp, T0 + 7);
    }

    #[tokio::test]
    async fn test_recalculate_ignores_existing_block() {
        let (_clock, store, analyzer) = setup();
        let policy = Policy::new("scope", vec![check(20, 5, 12)]).unwrap();

        store.rate_limit("scope", "id", 100).await.unwrap();
        assert!(analyzer.check(&policy, "id", true).await.unwrap().is_none());

        store.increment("scope", "id", T0, 5).await.unwrap();
        let verdict = analyzer.check(&policy, "id", true).await.unwrap().unwrap();
        assert_eq!(verdict.event().unwrap().sum, 5);
    }

    #[tokio::test]
    async fn test_disabled_scope_skips_analysis() {
        let (_clock, store, analyzer) = setup();
        let policy = Policy::new("scope", vec![check(20, 1, 12)]).unwrap();

        store.increment("scope", "id", T0, 10).await.unwrap();
        store.rate_limit("scope", "id", 100).await.unwrap();
        store.disable("scope").await.unwrap();

        assert!(analyzer.check(&policy, "id", false).await.unwrap().is_none());
        assert!(analyzer.check(&policy, "id", true).await.unwrap().is_none());
    }
}
