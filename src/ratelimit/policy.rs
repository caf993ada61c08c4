//! Policies: a scope plus its ordered period checks.
//!
//! Policies are plain data. They can be built in code or loaded from YAML:
//!
//! ```yaml
//! policies:
//!   - scope: ipn:follow
//!     checks:
//!       - period_seconds: 60
//!         max_allowed: 100
//!         block_ttl: 3600
//!       - period_seconds: 1800
//!         max_allowed: 2000
//!         mode: dynamic
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::keys;
use crate::error::{PauseError, Result};

/// Longest block, and longest window, a check may ask for (ten years).
pub const MAX_BLOCK_TTL: u64 = 10 * 365 * 24 * 60 * 60;

/// How long an identifier stays blocked once a check breaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Block for the check's configured `block_ttl`
    #[default]
    Fixed,
    /// Block only until the buckets that caused the breach leave the window
    Dynamic,
}

/// One sliding-window rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCheck {
    /// Width of the sliding window
    pub period_seconds: u64,
    /// Inclusive threshold: a window sum reaching this value breaches
    pub max_allowed: u64,
    /// Seconds to block after a breach; defaults to `period_seconds`
    #[serde(default)]
    pub block_ttl: Option<u64>,
    #[serde(default)]
    pub mode: BlockMode,
}

impl PeriodCheck {
    /// Create a fixed-mode check.
    pub fn new(period_seconds: u64, max_allowed: u64, block_ttl: Option<u64>) -> Result<Self> {
        let check = Self {
            period_seconds,
            max_allowed,
            block_ttl,
            mode: BlockMode::Fixed,
        };
        check.validate()?;
        Ok(check)
    }

    /// Switch the check to another block mode.
    pub fn with_mode(mut self, mode: BlockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Configured block duration.
    pub fn block_ttl(&self) -> u64 {
        self.block_ttl.unwrap_or(self.period_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.period_seconds == 0 {
            return Err(PauseError::Config(
                "period_seconds must be positive".to_string(),
            ));
        }
        if self.period_seconds > MAX_BLOCK_TTL {
            return Err(PauseError::Config(format!(
                "period_seconds must be at most {}",
                MAX_BLOCK_TTL
            )));
        }
        match self.block_ttl {
            Some(0) => Err(PauseError::Config("block_ttl must be positive".to_string())),
            Some(ttl) if ttl > MAX_BLOCK_TTL => Err(PauseError::Config(format!(
                "block_ttl must be at most {}",
                MAX_BLOCK_TTL
            ))),
            _ => Ok(()),
        }
    }
}

/// A scope and the checks applied to every identifier in it.
///
/// Checks are evaluated in registration order and the first breach wins,
/// so register them in a meaningful order (usually ascending period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyDef")]
pub struct Policy {
    scope: String,
    checks: Vec<PeriodCheck>,
}

#[derive(Deserialize)]
struct PolicyDef {
    #[serde(default)]
    scope: String,
    #[serde(default)]
    checks: Vec<PeriodCheck>,
}

impl TryFrom<PolicyDef> for Policy {
    type Error = PauseError;

    fn try_from(def: PolicyDef) -> Result<Self> {
        Policy::new(def.scope, def.checks)
    }
}

impl Policy {
    /// Create a policy, validating the scope and every check.
    pub fn new(scope: impl Into<String>, checks: Vec<PeriodCheck>) -> Result<Self> {
        let scope = scope.into();
        if scope.is_empty() {
            return Err(PauseError::ScopeNotConfigured(
                "policy has no scope (e.g. \"ipn:follow\")".to_string(),
            ));
        }
        if !keys::is_valid_scope(&scope) {
            return Err(PauseError::Config(format!(
                "scope {:?} must not contain '|'",
                scope
            )));
        }
        for check in &checks {
            check.validate()?;
        }
        Ok(Self { scope, checks })
    }

    /// Append a check after the existing ones.
    pub fn with_check(mut self, check: PeriodCheck) -> Result<Self> {
        check.validate()?;
        self.checks.push(check);
        Ok(self)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn checks(&self) -> &[PeriodCheck] {
        &self.checks
    }
}

/// Read-only lookup of policies by scope.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

#[derive(Deserialize)]
struct RegistryDef {
    #[serde(default)]
    policies: Vec<Policy>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let def: RegistryDef = serde_yaml::from_str(yaml)
            .map_err(|e| PauseError::Config(format!("Failed to parse policies: {}", e)))?;

        let mut registry = Self::new();
        for policy in def.policies {
            registry.register(policy)?;
        }
        Ok(registry)
    }

    /// Add a policy; scopes must be unique.
    pub fn register(&mut self, policy: Policy) -> Result<Arc<Policy>> {
        if self.policies.contains_key(policy.scope()) {
            return Err(PauseError::Config(format!(
                "scope {:?} registered twice",
                policy.scope()
            )));
        }
        let policy = Arc::new(policy);
        self.policies
            .insert(policy.scope().to_string(), Arc::clone(&policy));
        Ok(policy)
    }

    /// Look up the policy of a scope.
    pub fn get(&self, scope: &str) -> Result<Arc<Policy>> {
        self.policies
            .get(scope)
            .cloned()
            .ok_or_else(|| PauseError::ScopeNotConfigured(scope.to_string()))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}
