//! Sliding window bucket used by the in-process store.

use std::collections::VecDeque;

/// Request timestamps recorded for one rate key.
///
/// Timestamps are kept in non-decreasing order. The bucket is not
/// thread-safe on its own; the memory store guards each bucket with its own
/// lock.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Accepted request timestamps (epoch millis), oldest first
    hits: VecDeque<u64>,
    /// When the most recent request for this key was seen
    last_seen: u64,
    /// Set by the cleanup sweep once the bucket has been unlinked
    retired: bool,
}

impl Bucket {
    /// Create an empty bucket first touched at `now`.
    pub fn new(now: u64) -> Self {
        Self {
            hits: VecDeque::new(),
            last_seen: now,
            retired: false,
        }
    }

    /// Drop every timestamp older than `now - window_ms`.
    ///
    /// A timestamp exactly at the window edge is kept.
    pub fn prune(&mut self, now: u64, window_ms: u64) {
        let cutoff = now.saturating_sub(window_ms);
        while self.hits.front().is_some_and(|&at| at < cutoff) {
            self.hits.pop_front();
        }
    }

    /// Record a request at `now` and return the timestamp actually stored.
    ///
    /// The stored value never goes below the newest existing entry, which
    /// keeps the sequence ordered if the wall clock steps backwards.
    pub fn record(&mut self, now: u64) -> u64 {
        let at = self.hits.back().map_or(now, |&newest| newest.max(now));
        self.hits.push_back(at);
        self.touch(now);
        at
    }

    /// Note activity on the bucket without recording a hit.
    pub fn touch(&mut self, now: u64) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Remove one occurrence of `at`, searching from the newest end.
    ///
    /// Returns `false` if the timestamp already left the window.
    pub fn remove(&mut self, at: u64) -> bool {
        match self.hits.iter().rposition(|&hit| hit == at) {
            Some(index) => {
                self.hits.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of timestamps currently held.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether the bucket holds no timestamps.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// The oldest timestamp still held.
    pub fn oldest(&self) -> Option<u64> {
        self.hits.front().copied()
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Whether the bucket has been idle for longer than `stale_after_ms`.
    pub fn is_stale(&self, now: u64, stale_after_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) > stale_after_ms
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }
}
