//! Process-wide configuration.
//!
//! Grounded on the teacher's `FastStartConfig` (`runtime.rs`): a small,
//! `Default`-able, cloneable struct threaded through the top-level type
//! rather than scattered constants.

use serde::{Deserialize, Serialize};

/// Knobs that affect how strictly the module subsystem validates and names
/// things. None of these change the lifecycle state machine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reject exports whose name starts with any of these prefixes, in
    /// addition to the always-reserved `__` prefix from the wire format.
    pub reserved_name_prefixes: Vec<String>,
    /// Fail a `commit` as soon as the first module is marked `Err` instead
    /// of letting siblings continue to resolve. Off by default, matching
    /// §7's "failures during commit never abort other modules" policy.
    pub fail_fast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reserved_name_prefixes: vec!["__".to_string()],
            fail_fast: false,
        }
    }
}

impl Config {
    pub fn is_reserved_name(&self, name: &str) -> bool {
        self.reserved_name_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rejects_dunder_prefix() {
        let config = Config::default();
        assert!(config.is_reserved_name("__internal"));
        assert!(!config.is_reserved_name("public_symbol"));
    }

    #[test]
    fn custom_prefixes_are_additive() {
        let mut config = Config::default();
        config.reserved_name_prefixes.push("test_".to_string());
        assert!(config.is_reserved_name("test_fixture"));
        assert!(config.is_reserved_name("__still_reserved"));
    }
}
