//! In-process sliding window store.
//!
//! Each key owns a [`Bucket`] behind its own mutex, so concurrent requests
//! for the same key serialize while different keys never wait on each
//! other beyond the map's brief shard access. A background sweep unlinks
//! buckets that have gone idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::backend::{retry_secs, Decision, RateStore, StoreError, Ticket};
use super::clock::{Clock, SystemClock};
use super::key::RateKey;
use super::rules::Rule;
use super::window::Bucket;

/// Default interval between cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default idle time after which a bucket is deleted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

type Slot = Arc<Mutex<Bucket>>;

/// Sliding window rate store kept in process memory.
pub struct MemoryStore {
    /// Buckets indexed by storage key
    buckets: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Fetch the slot for `key`, creating it on first use.
    ///
    /// The map guard is released before the caller locks the bucket.
    fn slot(&self, key: &str, now: u64) -> Slot {
        if let Some(slot) = self.buckets.get(key) {
            return slot.clone();
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(now))))
            .clone()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of timestamps currently counted for `key` within `window`.
    pub fn current_count(&self, key: &RateKey, window: Duration) -> usize {
        let now = self.clock.now_millis();
        self.buckets
            .get(&key.to_string_key())
            .map(|slot| slot.clone())
            .map(|slot| {
                let mut bucket = slot.lock();
                bucket.prune(now, window.as_millis() as u64);
                bucket.len()
            })
            .unwrap_or(0)
    }

    /// Delete every bucket idle for longer than `stale_after`.
    ///
    /// Keys are visited one at a time; only the key being examined is
    /// locked. Returns the number of buckets removed.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        let now = self.clock.now_millis();
        let stale_after_ms = stale_after.as_millis() as u64;

        let keys: Vec<String> = self.buckets.iter().map(|entry| entry.key().clone()).collect();

        let mut removed = 0;
        for key in keys {
            let unlinked = self.buckets.remove_if(&key, |_, slot| {
                let mut bucket = slot.lock();
                if bucket.is_stale(now, stale_after_ms) {
                    bucket.retire();
                    true
                } else {
                    false
                }
            });
            if unlinked.is_some() {
                removed += 1;
            }
        }

        removed
    }

    /// Run [`MemoryStore::sweep`] every `interval` on the tokio runtime.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, stale_after: Duration) -> CleanupTask {
        let store = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = store.sweep(stale_after);
                debug!(
                    removed = removed,
                    remaining = store.bucket_count(),
                    "Rate limit bucket sweep finished"
                );
            }
        });

        CleanupTask { handle }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn hit(&self, key: &RateKey, rule: &Rule) -> Result<Decision, StoreError> {
        let storage_key = key.to_string_key();
        let window_ms = rule.window_millis();
        let limit = rule.max_requests;

        loop {
            let now = self.clock.now_millis();
            let slot = self.slot(&storage_key, now);
            let mut bucket = slot.lock();

            // Unlinked by the sweep after we fetched it; look it up again.
            if bucket.is_retired() {
                continue;
            }

            bucket.prune(now, window_ms);
            bucket.touch(now);

            if bucket.len() >= limit as usize {
                let reset_at = bucket.oldest().map_or(now + window_ms, |oldest| oldest + window_ms);
                let retry_after = retry_secs(reset_at.saturating_sub(now));

                trace!(key = %key, count = bucket.len(), limit = limit, "Sliding window full");

                return Ok(Decision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at_millis: reset_at,
                    retry_after_secs: retry_after,
                    ticket: None,
                });
            }

            let at = bucket.record(now);
            let count = bucket.len() as u32;
            let reset_at = bucket.oldest().unwrap_or(at) + window_ms;

            return Ok(Decision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(count),
                reset_at_millis: reset_at,
                retry_after_secs: 0,
                ticket: Some(Ticket {
                    key: key.clone(),
                    at_millis: at,
                }),
            });
        }
    }

    async fn refund(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let storage_key = ticket.key.to_string_key();
        let Some(slot) = self.buckets.get(&storage_key).map(|slot| slot.clone()) else {
            return Ok(());
        };

        let mut bucket = slot.lock();
        if !bucket.remove(ticket.at_millis) {
            trace!(key = %ticket.key, "Refunded hit already left the window");
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Handle to the background cleanup sweep.
///
/// Dropping the handle stops the sweep.
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stop the sweep.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_at(start: u64) -> (Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (store, clock)
    }

    fn rule(max: u32, window_ms: u64) -> Rule {
        Rule::new("default", max, Duration::from_millis(window_ms))
    }

    #[tokio::test]
    async fn test_exact_limit_allowed_then_rejected() {
        let (store, _clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(5, 1_000);

        for i in 1..=5 {
            let decision = store.hit(&key, &rule).await.unwrap();
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.remaining, 5 - i);
        }

        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.ticket.is_none());
    }

    #[tokio::test]
    async fn test_sliding_window_timeline() {
        let (store, clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(3, 1_000);

        for at in [0, 100, 200] {
            clock.set(at);
            assert!(store.hit(&key, &rule).await.unwrap().allowed);
        }

        clock.set(300);
        let rejected = store.hit(&key, &rule).await.unwrap();
        assert!(!rejected.allowed);
        // Oldest entry (0) leaves the window at 1000
        assert_eq!(rejected.reset_at_millis, 1_000);
        assert_eq!(rejected.retry_after_secs, 1);

        // Window is now [100, 1100]: entries at 100 and 200 remain
        clock.set(1_100);
        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at_millis, 1_100);
    }

    #[tokio::test]
    async fn test_count_resets_after_window() {
        let (store, clock) = store_at(10_000);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(2, 1_000);

        assert!(store.hit(&key, &rule).await.unwrap().allowed);
        assert!(store.hit(&key, &rule).await.unwrap().allowed);
        assert!(!store.hit(&key, &rule).await.unwrap().allowed);

        clock.advance(1_001);
        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let (store, clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(1, 60_000);

        assert!(store.hit(&key, &rule).await.unwrap().allowed);

        clock.set(15_500);
        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 45);
        assert_eq!(decision.reset_at_secs(), 60);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (store, _clock) = store_at(0);
        let rule = rule(1, 1_000);
        let first = RateKey::new("10.0.0.1", "default");
        let second = RateKey::new("10.0.0.2", "default");
        let other_route = RateKey::new("10.0.0.1", "/api/auth");

        assert!(store.hit(&first, &rule).await.unwrap().allowed);
        assert!(!store.hit(&first, &rule).await.unwrap().allowed);
        assert!(store.hit(&second, &rule).await.unwrap().allowed);
        assert!(store.hit(&other_route, &rule).await.unwrap().allowed);
        assert_eq!(store.bucket_count(), 3);
    }

    #[tokio::test]
    async fn test_refund_frees_capacity() {
        let (store, _clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(1, 1_000);

        let decision = store.hit(&key, &rule).await.unwrap();
        let ticket = decision.ticket.unwrap();
        assert!(!store.hit(&key, &rule).await.unwrap().allowed);

        store.refund(&ticket).await.unwrap();
        assert_eq!(store.current_count(&key, rule.window), 0);
        assert!(store.hit(&key, &rule).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_refund_unknown_key_is_noop() {
        let (store, _clock) = store_at(0);
        let ticket = Ticket {
            key: RateKey::new("10.0.0.9", "default"),
            at_millis: 5,
        };

        store.refund(&ticket).await.unwrap();
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_same_key() {
        let (store, _clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(10, 60_000);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                let rule = rule.clone();
                tokio::spawn(async move { store.hit(&key, &rule).await.unwrap().allowed })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 10);
        assert_eq!(store.current_count(&key, rule.window), 10);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_buckets() {
        let (store, clock) = store_at(0);
        let rule = rule(10, 1_000);
        let idle = RateKey::new("10.0.0.1", "default");
        let active = RateKey::new("10.0.0.2", "default");

        store.hit(&idle, &rule).await.unwrap();
        store.hit(&active, &rule).await.unwrap();

        clock.set(3_000_000);
        store.hit(&active, &rule).await.unwrap();

        clock.set(3_700_000);
        let removed = store.sweep(Duration::from_secs(3600));

        assert_eq!(removed, 1);
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.current_count(&active, Duration::from_secs(3600)), 1);
    }

    #[tokio::test]
    async fn test_hit_after_sweep_starts_fresh_bucket() {
        let (store, clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(1, 1_000);

        assert!(store.hit(&key, &rule).await.unwrap().allowed);

        clock.advance(7_200_000);
        assert_eq!(store.sweep(Duration::from_secs(3600)), 1);

        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_retired_bucket_is_not_reused() {
        let (store, _clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        let rule = rule(1, 1_000);

        // A request that fetched the slot just before the sweep unlinked it
        let stale_slot = store.slot(&key.to_string_key(), 0);
        store.buckets.remove(&key.to_string_key());
        stale_slot.lock().retire();

        let decision = store.hit(&key, &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(stale_slot.lock().len(), 0);
        assert_eq!(store.current_count(&key, rule.window), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_on_interval() {
        let (store, clock) = store_at(0);
        let key = RateKey::new("10.0.0.1", "default");
        store.hit(&key, &rule(1, 1_000)).await.unwrap();

        let _task = store.spawn_cleanup(Duration::from_secs(300), Duration::from_secs(3600));

        clock.advance(3_600_001);
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(store.bucket_count(), 0);
    }
}
