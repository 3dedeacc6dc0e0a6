//! Bookkeeping for desynchronized ("wedged") pairwise sessions.
//!
//! Two directions feed this tracker:
//!
//! - **Receiver side**: an integrity failure on a session we know marks the
//!   sender as wedged. [`super::OlmChannelManager::unwedge_devices`] later
//!   opens a fresh session towards it.
//! - **Sender side**: a stale-session notice from a peer requests a fresh
//!   handshake on our next encrypt to it.
//!
//! Each direction is limited to one forced refresh per device per rate-limit
//! window. The windows are tracked separately so that unwedging a peer never
//! suppresses a refresh that peer asked us for.

#![allow(clippy::disallowed_types, reason = "Tracker maps are only locked synchronously")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Wedge {
    session_id: String,
    failures: u32,
}

#[derive(Default)]
struct Inner {
    wedged: HashMap<String, Wedge>,
    last_unwedged: HashMap<String, u64>,
    last_refreshed: HashMap<String, u64>,
    refresh_requested: HashSet<String>,
}

/// Wedge and forced-refresh state, keyed by remote identity key (base64).
#[derive(Default)]
pub struct WedgeTracker {
    inner: Mutex<Inner>,
}

impl WedgeTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Count an integrity failure on a known session.
    ///
    /// Returns `true` once the device reaches `threshold` failures.
    pub fn record_failure(&self, identity_key: &str, session_id: &str, threshold: u32) -> bool {
        self.with(|inner| {
            let entry = inner
                .wedged
                .entry(identity_key.to_owned())
                .or_insert_with(|| Wedge { session_id: session_id.to_owned(), failures: 0 });
            entry.session_id = session_id.to_owned();
            entry.failures = entry.failures.saturating_add(1);
            entry.failures >= threshold.max(1)
        })
    }

    /// Wedged devices whose rate limit has expired, with the broken session.
    pub fn due(&self, now: u64, rate_limit_ms: u64, threshold: u32) -> Vec<(String, String)> {
        self.with(|inner| {
            let mut due: Vec<_> = inner
                .wedged
                .iter()
                .filter(|(_, wedge)| wedge.failures >= threshold.max(1))
                .filter(|(key, _)| allowed(&inner.last_unwedged, key, now, rate_limit_ms))
                .map(|(key, wedge)| (key.clone(), wedge.session_id.clone()))
                .collect();
            due.sort();
            due
        })
    }

    /// Devices marked wedged, regardless of rate limit.
    pub fn wedged(&self) -> Vec<String> {
        self.with(|inner| {
            let mut keys: Vec<_> = inner.wedged.keys().cloned().collect();
            keys.sort();
            keys
        })
    }

    /// A fresh session was opened for a wedged device.
    pub fn resolved(&self, identity_key: &str, now: u64) {
        self.with(|inner| {
            inner.wedged.remove(identity_key);
            inner.last_unwedged.insert(identity_key.to_owned(), now);
        });
    }

    /// Stop tracking a device (unknown or deleted).
    pub fn forget(&self, identity_key: &str) {
        self.with(|inner| {
            inner.wedged.remove(identity_key);
            inner.refresh_requested.remove(identity_key);
        });
    }

    /// Ask for a new handshake on the next encrypt, unless rate limited.
    ///
    /// Returns `false` when a refresh was forced within the window.
    pub fn request_refresh(&self, identity_key: &str, now: u64, rate_limit_ms: u64) -> bool {
        self.with(|inner| {
            if !allowed(&inner.last_refreshed, identity_key, now, rate_limit_ms) {
                return false;
            }
            inner.last_refreshed.insert(identity_key.to_owned(), now);
            inner.refresh_requested.insert(identity_key.to_owned());
            true
        })
    }

    /// Whether the next encrypt must run a new handshake.
    pub fn refresh_pending(&self, identity_key: &str) -> bool {
        self.with(|inner| inner.refresh_requested.contains(identity_key))
    }

    /// The requested handshake happened.
    pub fn refreshed(&self, identity_key: &str) {
        self.with(|inner| {
            inner.refresh_requested.remove(identity_key);
        });
    }

    /// Forget everything (logout).
    pub fn clear(&self) {
        self.with(|inner| *inner = Inner::default());
    }
}

fn allowed(last: &HashMap<String, u64>, identity_key: &str, now: u64, rate_limit_ms: u64) -> bool {
    last.get(identity_key).is_none_or(|at| now.saturating_sub(*at) >= rate_limit_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    #[test]
    fn failure_marks_device_due() {
        let tracker = WedgeTracker::new();
        assert!(tracker.record_failure("bob", "s1", 1));
        assert_eq!(tracker.due(0, HOUR, 1), vec![("bob".to_owned(), "s1".to_owned())]);
    }

    #[test]
    fn threshold_delays_wedge() {
        let tracker = WedgeTracker::new();
        assert!(!tracker.record_failure("bob", "s1", 2));
        assert!(tracker.due(0, HOUR, 2).is_empty());
        assert!(tracker.record_failure("bob", "s1", 2));
    }

    #[test]
    fn forced_refresh_is_rate_limited() {
        let tracker = WedgeTracker::new();
        tracker.record_failure("bob", "s1", 1);
        tracker.resolved("bob", 1_000);

        tracker.record_failure("bob", "s2", 1);
        assert!(tracker.due(1_000 + HOUR - 1, HOUR, 1).is_empty());
        assert_eq!(tracker.due(1_000 + HOUR, HOUR, 1).len(), 1);
    }

    #[test]
    fn stale_notice_requests_one_refresh_per_window() {
        let tracker = WedgeTracker::new();
        assert!(tracker.request_refresh("alice", 0, HOUR));
        assert!(tracker.refresh_pending("alice"));
        tracker.refreshed("alice");

        assert!(!tracker.request_refresh("alice", 10, HOUR));
        assert!(!tracker.refresh_pending("alice"));
        assert!(tracker.request_refresh("alice", HOUR, HOUR));
    }

    #[test]
    fn unwedge_and_refresh_windows_are_independent() {
        let tracker = WedgeTracker::new();
        tracker.record_failure("alice", "s1", 1);
        tracker.resolved("alice", 0);
        assert!(tracker.request_refresh("alice", 10, HOUR));

        tracker.record_failure("alice", "s2", 1);
        assert!(tracker.due(20, HOUR, 1).is_empty());
        assert_eq!(tracker.due(HOUR, HOUR, 1).len(), 1);
    }
}
