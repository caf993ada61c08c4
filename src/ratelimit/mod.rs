//! Rate limiting logic: policies, the analyzer and per-identifier actions.

mod action;
mod analyzer;
mod backend;
mod limiter;
pub mod keys;
pub mod policy;
pub mod timing;

pub use action::{Action, Admission};
pub use analyzer::{evaluate, Analyzer, Breach, RateLimitedEvent, Verdict};
pub use backend::{Bucket, CounterStore};
pub use limiter::RateLimiter;
pub use policy::{BlockMode, PeriodCheck, Policy, PolicyRegistry, MAX_BLOCK_TTL};
pub use timing::{period_marker, Clock, ManualClock, SystemClock};
