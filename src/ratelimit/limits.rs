//! Per-identifier limit overrides.

use std::collections::HashMap;

use super::identifier::Identifier;
use crate::config::RateLimitingConfig;

/// Maps identifiers to their per-window quota.
///
/// Built once at startup and never mutated afterwards, so lookups need no
/// synchronisation.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    /// Quota for identifiers without an override
    default_limit: u64,
    /// Identifier -> quota overrides
    overrides: HashMap<String, u64>,
}

impl LimitTable {
    /// Create a table from a default limit and a set of overrides.
    pub fn new(default_limit: u64, overrides: HashMap<String, u64>) -> Self {
        Self {
            default_limit,
            overrides,
        }
    }

    /// Build the table described by the rate limiting configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(config.default_limit, config.token_limits.clone())
    }

    /// The limit that applies to an identifier.
    pub fn effective_limit(&self, identifier: &Identifier) -> u64 {
        self.overrides
            .get(identifier.as_str())
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// The process-wide default limit.
    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    /// Number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}
