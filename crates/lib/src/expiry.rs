//! Per-path TTL deadlines.
//!
//! An [`ExpiryTracker`] maps serialized path strings to deadlines. It does
//! no timing of its own: the server's command loop passes `now` in and runs
//! [`take_due`] from its sweep timer, then evicts each due path through the
//! store and announces the eviction to watchers. Keeping the clock a
//! parameter keeps the tracker trivially testable.
//!
//! A deadline sticks to the path string, not the node: rewriting or removing
//! the path does not cancel it, and the sweep's removal is simply a no-op
//! when nothing is there anymore.
//!
//! [`take_due`]: ExpiryTracker::take_due

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Path-keyed deadline map.
#[derive(Debug, Default)]
pub struct ExpiryTracker {
    deadlines: HashMap<String, Instant>,
}

impl ExpiryTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        ExpiryTracker::default()
    }

    /// Set `path` to expire `ttl` from `now`, replacing any earlier deadline.
    pub fn expire(&mut self, path: String, ttl: Duration, now: Instant) {
        self.deadlines.insert(path, now + ttl);
    }

    /// Drop the deadline for `path`. Unknown paths are a no-op.
    pub fn unexpire(&mut self, path: &str) {
        self.deadlines.remove(path);
    }

    /// Time left before `path` expires, `None` when it has no deadline.
    ///
    /// A deadline that has already passed but not yet swept reports zero.
    pub fn remaining(&self, path: &str, now: Instant) -> Option<Duration> {
        self.deadlines
            .get(path)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove and return every path whose deadline is at or before `now`,
    /// sorted for a deterministic eviction order.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort_unstable();
        for path in &due {
            self.deadlines.remove(path);
        }
        due
    }

    /// Number of tracked deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
