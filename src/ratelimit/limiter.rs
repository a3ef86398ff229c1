//! Rate decision engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{CounterStore, Decision};
use super::identifier::Identifier;
use super::limits::LimitTable;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Decides whether a request from an identifier may proceed.
///
/// Resolves the identifier's effective limit and hands the counting to the
/// counter store. The engine keeps no per-identifier state of its own:
/// whether an identifier is blocked is read from the store on every call.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// The shared counter store
    store: Arc<dyn CounterStore>,
    /// Per-identifier quotas
    limits: LimitTable,
    /// Length of the counting window
    window: Duration,
    /// Cooldown applied once an identifier exceeds its limit
    block_duration: Duration,
}

impl RateLimiter {
    /// Create a rate limiter from the rate limiting configuration.
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitingConfig) -> Self {
        Self {
            store,
            limits: LimitTable::from_config(config),
            window: config.window(),
            block_duration: config.block_duration(),
        }
    }

    /// The limit that applies to an identifier.
    pub fn effective_limit(&self, identifier: &Identifier) -> u64 {
        self.limits.effective_limit(identifier)
    }

    /// Count a request from `identifier` and decide whether it may proceed.
    ///
    /// Errors mean the store could not be consulted; the request is then
    /// neither proven admitted nor proven denied, and it is up to the caller
    /// to apply its failure policy.
    pub async fn allow(&self, identifier: &Identifier) -> Result<Decision> {
        let limit = self.effective_limit(identifier);

        trace!(
            identifier = %identifier,
            limit = limit,
            "Checking rate limit"
        );

        let decision = self
            .store
            .decide(identifier, limit, self.window, self.block_duration)
            .await
            .map_err(|e| {
                debug!(identifier = %identifier, error = %e, "Counter store failure");
                e
            })?;

        if !decision.admitted {
            debug!(
                identifier = %identifier,
                limit = limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// The configured cooldown.
    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// The configured counting window.
    pub fn window(&self) -> Duration {
        self.window
    }
}
