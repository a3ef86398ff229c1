//! Counter store trait for abstracting the Redis and in-memory implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::identifier::Identifier;
use crate::error::Result;

/// Outcome of a single rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Remaining cooldown when the request was denied, zero otherwise
    pub retry_after: Duration,
}

impl Decision {
    /// An admitting decision.
    pub fn admit() -> Self {
        Self {
            admitted: true,
            retry_after: Duration::ZERO,
        }
    }

    /// A denying decision with the given remaining cooldown.
    pub fn deny(retry_after: Duration) -> Self {
        Self {
            admitted: false,
            retry_after,
        }
    }
}

/// Trait for counter store implementations.
///
/// `decide` must run as one atomic operation per identifier:
///
/// 1. If the block flag has a positive TTL, deny with that TTL and touch
///    nothing else.
/// 2. Increment the window counter, giving it a TTL of `window` when the
///    increment created it.
/// 3. If the counter now exceeds `limit`, set the block flag with a TTL of
///    `block_duration` and deny with `block_duration`.
/// 4. Otherwise admit.
///
/// Implementations never retry internally; a failed call may or may not
/// have been counted, so retrying is left to the caller.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn decide(
        &self,
        identifier: &Identifier,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Decision>;
}
