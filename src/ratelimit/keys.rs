//! Store key encoding.
//!
//! Identifiers are wrapped in `|` sentinels after the scope. Scopes may not
//! contain `|`, so the first sentinel always starts the identifier and the
//! encoding stays injective whatever the identifier contains.

use std::fmt;

const HISTORY_PREFIX: &str = "i";
const BLOCK_PREFIX: &str = "b";
const DISABLED_PREFIX: &str = "disabled";
const SENTINEL: char = '|';

/// A (scope, identifier) pair naming one tracked actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopedKey {
    pub scope: String,
    pub identifier: String,
}

impl ScopedKey {
    pub fn new(scope: &str, identifier: &str) -> Self {
        Self {
            scope: scope.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Key of the bucket history sorted set.
    /// Format: "i:{scope}:|{identifier}|"
    pub fn history_key(&self) -> String {
        encode(HISTORY_PREFIX, &self.scope, &self.identifier)
    }

    /// Key of a per-identifier block marker.
    /// Format: "b:{scope}:|{identifier}|"
    pub fn block_key(&self) -> String {
        encode(BLOCK_PREFIX, &self.scope, &self.identifier)
    }

    /// Parse a history key back into its parts.
    pub fn from_history_key(key: &str) -> Option<Self> {
        decode(HISTORY_PREFIX, key)
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}{}", self.scope, SENTINEL, self.identifier, SENTINEL)
    }
}

/// Key of the per-scope block list sorted set.
pub fn block_list_key(scope: &str) -> String {
    format!("{}:{}", BLOCK_PREFIX, scope)
}

/// Key of the per-scope disabled flag.
pub fn disabled_key(scope: &str) -> String {
    format!("{}:{}", DISABLED_PREFIX, scope)
}

/// SCAN pattern matching every history key of a scope.
pub fn history_pattern(scope: &str) -> String {
    format!("{}:{}:{}*", HISTORY_PREFIX, escape_glob(scope), SENTINEL)
}

/// Whether `scope` can be encoded without ambiguity.
pub fn is_valid_scope(scope: &str) -> bool {
    !scope.contains(SENTINEL)
}

fn encode(prefix: &str, scope: &str, identifier: &str) -> String {
    format!("{}:{}:{}{}{}", prefix, scope, SENTINEL, identifier, SENTINEL)
}

fn decode(prefix: &str, key: &str) -> Option<ScopedKey> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(':')?;

    // The first sentinel opens the identifier; the scope before it ends in ':'
    let open = rest.find(SENTINEL)?;
    let scope = rest[..open].strip_suffix(':')?;
    let identifier = rest[open + 1..].strip_suffix(SENTINEL)?;

    Some(ScopedKey::new(scope, identifier))
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_key_format() {
        let key = ScopedKey::new("ipn:follow", "1243123");
        assert_eq!(key.history_key(), "i:ipn:follow:|1243123|");
        assert_eq!(key.block_key(), "b:ipn:follow:|1243123|");
        assert_eq!(block_list_key("ipn:follow"), "b:ipn:follow");
        assert_eq!(disabled_key("ipn:follow"), "disabled:ipn:follow");
    }

    #[test]
    fn test_key_parsing_roundtrip_with_delimiters_in_identifier() {
        let key = ScopedKey::new("login", "a|:|b:c|");
        let parsed = ScopedKey::from_history_key(&key.history_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_encoding_is_injective() {
        // Without sentinels these two would both encode as "i:a:b:c"
        let first = ScopedKey::new("a", "b:c");
        let second = ScopedKey::new("a:b", "c");
        assert_ne!(first.history_key(), second.history_key());
    }

    #[test]
    fn test_key_parsing_invalid() {
        assert!(ScopedKey::from_history_key("invalid").is_none());
        assert!(ScopedKey::from_history_key("i:scope:id").is_none());
        assert!(ScopedKey::from_history_key("b:scope:|id|").is_none());
        assert!(ScopedKey::from_history_key("i:scope:|id").is_none());
    }

    #[test]
    fn test_scan_pattern_escapes_glob() {
        assert_eq!(history_pattern("api*"), "i:api\\*:|*");
        assert_eq!(history_pattern("login"), "i:login:|*");
    }

    #[test]
    fn test_scope_validation() {
        assert!(is_valid_scope("ipn:follow"));
        assert!(!is_valid_scope("bad|scope"));
    }
}
