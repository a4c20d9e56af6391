//! Shared counter strategy for multi-instance deployments.
//!
//! Instead of a timestamp sequence, each key holds a single integer in a
//! shared store. The first increment in a window attaches an expiry equal to
//! the window length; the count resets when the store expires the key.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{retry_secs, Decision, RateStore, StoreError, Ticket};
use super::clock::{Clock, SystemClock};
use super::key::RateKey;
use super::rules::Rule;

/// Primitives a shared counter store must offer.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Subtract one from `key` if it still exists; returns the new value.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Attach an expiry of `seconds` to `key`. Returns whether the key existed.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;

    /// Remaining time to live in seconds.
    ///
    /// Follows the Redis convention: `-2` when the key does not exist and
    /// `-1` when it exists without an expiry.
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;
}

/// Rate store that counts hits in a [`CounterStore`].
pub struct SharedCounterStore<C> {
    counters: C,
    clock: Arc<dyn Clock>,
}

impl<C: CounterStore> SharedCounterStore<C> {
    /// Create a strategy over `counters` driven by the system clock.
    pub fn new(counters: C) -> Self {
        Self::with_clock(counters, Arc::new(SystemClock::new()))
    }

    /// Create a strategy over `counters` driven by the given clock.
    pub fn with_clock(counters: C, clock: Arc<dyn Clock>) -> Self {
        Self { counters, clock }
    }

    /// Access the underlying counters.
    pub fn counters(&self) -> &C {
        &self.counters
    }

    /// Seconds until `key` expires, repairing a missing expiry.
    ///
    /// Increment and expire are separate calls, so a key can be left without
    /// an expiry if the process stops between them. Such a key would never
    /// reset; it gets the full window re-applied here.
    async fn seconds_left(&self, key: &str, window_secs: u64) -> Result<u64, StoreError> {
        let ttl = self.counters.ttl(key).await?;
        if ttl > 0 {
            return Ok(ttl as u64);
        }

        if ttl == -1 {
            debug!(key = %key, "Counter found without expiry, re-applying window");
            self.counters.expire(key, window_secs).await?;
        }

        Ok(window_secs)
    }
}

#[async_trait]
impl<C: CounterStore> RateStore for SharedCounterStore<C> {
    async fn hit(&self, key: &RateKey, rule: &Rule) -> Result<Decision, StoreError> {
        let storage_key = key.to_string_key();
        let window_secs = rule.window_secs();
        let limit = rule.max_requests;

        let count = self.counters.increment(&storage_key).await?;
        let now = self.clock.now_millis();

        let seconds_left = if count == 1 {
            self.counters.expire(&storage_key, window_secs).await?;
            window_secs
        } else {
            self.seconds_left(&storage_key, window_secs).await?
        };

        let reset_at = now + seconds_left * 1_000;
        let count = count.max(0) as u64;

        trace!(key = %key, count = count, limit = limit, "Shared counter incremented");

        if count > limit as u64 {
            return Ok(Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_millis: reset_at,
                retry_after_secs: retry_secs(seconds_left * 1_000),
                ticket: None,
            });
        }

        Ok(Decision {
            allowed: true,
            limit,
            remaining: (limit as u64).saturating_sub(count) as u32,
            reset_at_millis: reset_at,
            retry_after_secs: 0,
            ticket: Some(Ticket {
                key: key.clone(),
                at_millis: now,
            }),
        })
    }

    async fn refund(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.counters.decrement(&ticket.key.to_string_key()).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "shared-counter"
    }
}
