//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod key;
mod limiter;
mod memory;
mod redis_counters;
mod rules;
mod window;

pub use backend::{Decision, RateStore, StoreError, Ticket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterStore, SharedCounterStore};
pub use key::{KeyGenerator, RateKey, RequestIdentity, FALLBACK_CLIENT};
pub use limiter::{RateLimiter, Verdict, DEFAULT_STORE_TIMEOUT};
pub use memory::{CleanupTask, MemoryStore, DEFAULT_CLEANUP_INTERVAL, DEFAULT_STALE_AFTER};
pub use redis_counters::{RedisCounters, DEFAULT_KEY_PREFIX};
pub use rules::{RouteConfig, RouteRules, Rule, RuleConfig, DEFAULT_SCOPE};
pub use window::Bucket;
