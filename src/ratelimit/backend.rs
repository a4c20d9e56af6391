//! Store trait for abstracting local and shared rate accounting.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::key::RateKey;
use super::rules::Rule;

/// Errors raised by a rate store.
///
/// The limiter never surfaces these to callers; they trigger fail-open.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or could not run an operation
    #[error("store backend error: {0}")]
    Backend(String),

    /// Redis command or connection failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Handle to an accepted hit, used to take it back later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// The key the hit was counted against
    pub key: RateKey,
    /// The timestamp the store recorded for the hit (epoch millis)
    pub at_millis: u64,
}

/// Outcome of one accounting attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is within the limit
    pub allowed: bool,
    /// The configured maximum for the window
    pub limit: u32,
    /// Requests still available in the current window
    pub remaining: u32,
    /// When the window frees capacity again (epoch millis)
    pub reset_at_millis: u64,
    /// Seconds the client should wait before retrying; zero when allowed
    pub retry_after_secs: u64,
    /// Present when the hit was counted and can be refunded
    pub ticket: Option<Ticket>,
}

impl Decision {
    /// Reset time in whole epoch seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_millis.div_ceil(1_000)
    }
}

/// Trait for rate accounting strategies.
///
/// Implementations must make the check-and-count step atomic per key and
/// must not serialize unrelated keys behind one another.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Count one request against `key` under `rule` and decide on it.
    async fn hit(&self, key: &RateKey, rule: &Rule) -> Result<Decision, StoreError>;

    /// Take back a previously accepted hit.
    async fn refund(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Short name of the strategy, for logs and health output.
    fn name(&self) -> &'static str;
}

/// Seconds to wait for `remaining_ms`, never less than one.
pub(crate) fn retry_secs(remaining_ms: u64) -> u64 {
    remaining_ms.div_ceil(1_000).max(1)
}
