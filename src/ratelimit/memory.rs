//! In-process counter store.
//!
//! Follows the same block flag / window counter algorithm as the Redis
//! store, with expiry evaluated lazily against a monotonic clock. Counts are
//! local to this process, so this store only suits a single instance.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::backend::{CounterStore, Decision};
use super::identifier::Identifier;
use crate::error::{Result, TurnstileError};

/// Block flag and window counter of one identifier.
#[derive(Debug, Default)]
struct Slot {
    /// Attempts seen in the current window
    count: u64,
    /// When the current window counter expires
    window_expires_at: Option<Instant>,
    /// When the block flag expires
    blocked_until: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|t| t > now)
            || self.window_expires_at.is_some_and(|t| t > now)
    }
}

/// A counter store kept in process memory.
///
/// Each identifier's slot is updated under its map entry lock, which makes
/// decisions for the same identifier linearizable while leaving other
/// identifiers unaffected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<Identifier, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn decide_at(
        &self,
        identifier: &Identifier,
        limit: u64,
        window: Duration,
        block_duration: Duration,
        now: Instant,
    ) -> Result<Decision> {
        let window_expires_at = deadline(now, window)?;
        let blocked_until = deadline(now, block_duration)?;

        let mut slot = self.slots.entry(identifier.clone()).or_default();

        if let Some(until) = slot.blocked_until {
            if until > now {
                return Ok(Decision::deny(until - now));
            }
            slot.blocked_until = None;
        }

        if slot.window_expires_at.map_or(true, |t| t <= now) {
            slot.count = 0;
            slot.window_expires_at = None;
        }

        slot.count += 1;
        if slot.count == 1 {
            slot.window_expires_at = Some(window_expires_at);
        }

        trace!(identifier = %identifier, count = slot.count, limit = limit, "Window counter incremented");

        if slot.count > limit {
            slot.blocked_until = Some(blocked_until);
            return Ok(Decision::deny(block_duration));
        }

        Ok(Decision::admit())
    }

    /// Drop every slot whose block flag and window counter have both expired.
    ///
    /// Returns the number of slots removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Number of identifiers currently tracked, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no identifiers are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current window count for an identifier, if its window is still open.
    pub fn current_count(&self, identifier: &Identifier) -> Option<u64> {
        let now = Instant::now();
        self.slots
            .get(identifier)
            .filter(|slot| slot.window_expires_at.is_some_and(|t| t > now))
            .map(|slot| slot.count)
    }
}

fn deadline(now: Instant, ttl: Duration) -> Result<Instant> {
    now.checked_add(ttl).ok_or_else(|| {
        TurnstileError::Config(format!("duration {:?} overflows the clock", ttl))
    })
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn decide(
        &self,
        identifier: &Identifier,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Decision> {
        self.decide_at(identifier, limit, window, block_duration, Instant::now())
    }
}
