//! Pause - Distributed Admission Control
//!
//! This crate decides whether an identifier may perform an action in a
//! scope, based on sliding-window counters kept in a shared store (Redis,
//! optionally sharded, or process memory). Identifiers that breach a
//! policy check are blocked for a while.
//!
//! ```no_run
//! use pause::config::PauseConfig;
//! use pause::ratelimit::{PeriodCheck, Policy, PolicyRegistry, RateLimiter};
//!
//! # async fn run() -> pause::error::Result<()> {
//! let mut policies = PolicyRegistry::new();
//! policies.register(Policy::new(
//!     "ipn:follow",
//!     vec![PeriodCheck::new(60, 100, Some(3600))?],
//! )?)?;
//!
//! let limiter = RateLimiter::from_config(&PauseConfig::default(), policies)?;
//! let action = limiter.action_for("ipn:follow", "user-123")?;
//! if action.is_ok().await {
//!     // send the notification
//!     action.increment().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
