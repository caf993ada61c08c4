//! Core rate limiter: the entry point a host service holds.

use std::sync::Arc;
use tracing::{debug, info};

use super::action::Action;
use super::analyzer::Analyzer;
use super::backend::CounterStore;
use super::policy::{Policy, PolicyRegistry};
use super::timing::{Clock, SystemClock};
use crate::config::PauseConfig;
use crate::error::Result;
use crate::store::build_store;

/// Binds a counter store, a clock and the registered policies.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Per-identifier work goes through [`Action`] handles; scope-wide
/// operations live here.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    analyzer: Analyzer,
    policies: PolicyRegistry,
}

impl RateLimiter {
    /// Create a rate limiter over an existing store.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, resolution: u64) -> Self {
        let analyzer = Analyzer::new(Arc::clone(&store), Arc::clone(&clock), resolution);
        Self {
            store,
            clock,
            analyzer,
            policies: PolicyRegistry::new(),
        }
    }

    /// Build the configured store and a rate limiter on top of it.
    pub fn from_config(config: &PauseConfig, policies: PolicyRegistry) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = build_store(config, Arc::clone(&clock))?;

        info!(
            policies = policies.len(),
            resolution = config.resolution,
            "Rate limiter initialized"
        );
        Ok(Self::new(store, clock, config.resolution).with_policies(policies))
    }

    /// Replace the policy registry used by [`RateLimiter::action_for`].
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Handle for `identifier` under `policy`.
    pub fn action(&self, policy: &Arc<Policy>, identifier: impl Into<String>) -> Action<'_> {
        Action::new(self, Arc::clone(policy), identifier.into())
    }

    /// Handle for `identifier` under the registered policy of `scope`.
    pub fn action_for(&self, scope: &str, identifier: impl Into<String>) -> Result<Action<'_>> {
        let policy = self.policies.get(scope)?;
        Ok(Action::new(self, policy, identifier.into()))
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Re-enable a scope. Stored counts and blocks apply again immediately.
    pub async fn enable(&self, policy: &Policy) -> Result<()> {
        info!(scope = %policy.scope(), "Enabling scope");
        self.store.enable(policy.scope()).await
    }

    /// Disable a scope: every identifier is permitted until re-enabled.
    /// Counts and blocks are kept.
    pub async fn disable(&self, policy: &Policy) -> Result<()> {
        info!(scope = %policy.scope(), "Disabling scope");
        self.store.disable(policy.scope()).await
    }

    pub async fn is_enabled(&self, policy: &Policy) -> Result<bool> {
        self.store.is_enabled(policy.scope()).await
    }

    pub async fn is_disabled(&self, policy: &Policy) -> Result<bool> {
        Ok(!self.is_enabled(policy).await?)
    }

    /// Every identifier with history in the scope.
    pub async fn tracked_identifiers(&self, policy: &Policy) -> Result<Vec<String>> {
        self.store.all_keys(policy.scope()).await
    }

    /// Every identifier currently blocked in the scope.
    pub async fn rate_limited_identifiers(&self, policy: &Policy) -> Result<Vec<String>> {
        self.store.rate_limited_keys(policy.scope()).await
    }

    /// Unblock every identifier of the scope, dropping their history so
    /// stale counts do not block them again on the next check.
    pub async fn unblock_all(&self, policy: &Policy) -> Result<usize> {
        let removed = self.store.delete_rate_limited_keys(policy.scope()).await?;
        debug!(scope = %policy.scope(), removed = removed, "Unblocked all identifiers");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::error::PauseError;
    use crate::ratelimit::policy::PeriodCheck;
    use crate::ratelimit::timing::ManualClock;
    use crate::store::{MemoryStore, StoreSettings};

    const T0: u64 = 1_700_000_000;

    fn create_test_limiter() -> (ManualClock, RateLimiter) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::with_clock(
            StoreSettings::new(10, 60).unwrap(),
            Arc::new(clock.clone()),
        ));
        (clock.clone(), RateLimiter::new(store, Arc::new(clock), 10))
    }

    fn create_test_policy(scope: &str) -> Arc<Policy> {
        Arc::new(
            Policy::new(scope, vec![PeriodCheck::new(20, 2, Some(40)).unwrap()]).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_from_config_memory_backend() {
        let config = PauseConfig {
            backend: StoreBackend::Memory,
            ..PauseConfig::default()
        };
        let yaml = r#"
policies:
  - scope: login
    checks:
      - period_seconds: 300
        max_allowed: 5
"#;
        let limiter =
            RateLimiter::from_config(&config, PolicyRegistry::from_yaml(yaml).unwrap()).unwrap();
        assert_eq!(limiter.analyzer().resolution(), 600);

        let action = limiter.action_for("login", "alice").unwrap();
        assert!(action.is_ok().await);
    }

    #[tokio::test]
    async fn test_action_for_unknown_scope() {
        let (_clock, limiter) = create_test_limiter();
        assert!(matches!(
            limiter.action_for("nope", "id"),
            Err(PauseError::ScopeNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_enable_disable_scope() {
        let (_clock, limiter) = create_test_limiter();
        let policy = create_test_policy("sms");

        assert!(limiter.is_enabled(&policy).await.unwrap());
        limiter.disable(&policy).await.unwrap();
        assert!(limiter.is_disabled(&policy).await.unwrap());
        limiter.enable(&policy).await.unwrap();
        assert!(limiter.is_enabled(&policy).await.unwrap());
    }

    #[tokio::test]
    async fn test_tracked_and_rate_limited_identifiers() {
        let (_clock, limiter) = create_test_limiter();
        let policy = create_test_policy("sms");

        limiter.action(&policy, "a").increment().await.unwrap();
        let b = limiter.action(&policy, "b");
        b.increment_by(2).await.unwrap();
        assert!(b.is_rate_limited().await);

        assert_eq!(limiter.tracked_identifiers(&policy).await.unwrap(), vec!["a", "b"]);
        assert_eq!(limiter.rate_limited_identifiers(&policy).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_unblock_all_clears_blocks_and_history() {
        let (_clock, limiter) = create_test_limiter();
        let policy = create_test_policy("sms");

        for id in ["a", "b"] {
            let action = limiter.action(&policy, id);
            action.increment_by(2).await.unwrap();
            assert!(action.is_rate_limited().await);
        }

        assert_eq!(limiter.unblock_all(&policy).await.unwrap(), 2);
        assert!(limiter.rate_limited_identifiers(&policy).await.unwrap().is_empty());

        // History went with the blocks, so nobody is blocked again
        assert!(limiter.action(&policy, "a").is_ok().await);
        assert!(limiter.action(&policy, "b").is_ok().await);
    }
}
