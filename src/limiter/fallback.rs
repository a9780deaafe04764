//! In-process fallback limiter for counter store outages.
//!
//! Keeps the same purge-then-count-then-insert contract as the remote
//! limiter, over per-key timestamp lists in local memory. State here is
//! strictly process-local: with N processes degraded at once, aggregate
//! traffic may reach N times the intended limit. Decisions built from this
//! limiter are flagged degraded so callers can see the difference.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

use super::key::RateLimitKey;
use super::sliding::WindowCheck;

/// Timestamps for one key, guarded by a single mutation point so concurrent
/// local callers cannot lose updates.
struct KeyWindow {
    window_ms: u64,
    stamps: VecDeque<u64>,
}

/// Approximate local rolling-window counter.
pub struct FallbackLimiter {
    windows: DashMap<String, Mutex<KeyWindow>>,
}

impl FallbackLimiter {
    /// Create an empty fallback limiter.
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check the window for `key` and consume a slot when under `limit`.
    pub fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
    ) -> WindowCheck {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        self.check_and_increment_at(key, limit, window, now_ms)
    }

    /// Same as `check_and_increment`, with an explicit evaluation instant.
    pub(crate) fn check_and_increment_at(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> WindowCheck {
        let window_ms = window.as_millis() as u64;
        let entry = self
            .windows
            .entry(key.to_string_key())
            .or_insert_with(|| {
                Mutex::new(KeyWindow {
                    window_ms,
                    stamps: VecDeque::new(),
                })
            });

        let mut key_window = entry.lock();
        key_window.window_ms = window_ms;

        let cutoff = now_ms.saturating_sub(window_ms);
        while key_window.stamps.front().is_some_and(|&t| t <= cutoff) {
            key_window.stamps.pop_front();
        }

        let count_before = key_window.stamps.len() as u64;
        if count_before < limit {
            key_window.stamps.push_back(now_ms);
        }

        let check = WindowCheck::from_count_before(count_before, limit, window, now_ms);

        trace!(
            key = %key,
            allowed = check.allowed,
            count = check.current_count,
            "Fallback window check"
        );

        check
    }

    /// Drop keys whose newest entry is older than their window.
    ///
    /// Remote keys expire through the store's TTL; local state needs this
    /// passive pruning to avoid growing with every caller ever seen.
    pub fn prune_idle(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        self.prune_idle_at(now_ms);
    }

    pub(crate) fn prune_idle_at(&self, now_ms: u64) {
        self.windows.retain(|_, entry| {
            let key_window = entry.lock();
            key_window
                .stamps
                .back()
                .is_some_and(|&t| t > now_ms.saturating_sub(key_window.window_ms))
        });
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for FallbackLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EndpointCategory;

    const WINDOW: Duration = Duration::from_secs(60);

    fn test_key(identifier: &str) -> RateLimitKey {
        RateLimitKey::new(identifier, EndpointCategory::Public, "60s".to_string())
    }

    #[test]
    fn test_enforces_limit() {
        let limiter = FallbackLimiter::new();
        let key = test_key("ip:10.0.0.1");

        for _ in 0..3 {
            assert!(limiter.check_and_increment_at(&key, 3, WINDOW, 1_000).allowed);
        }
        let check = limiter.check_and_increment_at(&key, 3, WINDOW, 1_000);
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
    }

    #[test]
    fn test_expired_entries_are_purged() {
        let limiter = FallbackLimiter::new();
        let key = test_key("ip:10.0.0.1");

        for _ in 0..2 {
            assert!(limiter.check_and_increment_at(&key, 2, WINDOW, 1_000).allowed);
        }
        assert!(!limiter.check_and_increment_at(&key, 2, WINDOW, 1_000).allowed);

        let later = 1_000 + WINDOW.as_millis() as u64 + 1;
        let check = limiter.check_and_increment_at(&key, 2, WINDOW, later);
        assert!(check.allowed);
        assert_eq!(check.remaining, 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = FallbackLimiter::new();
        let a = test_key("user:1");
        let b = test_key("user:2");

        assert!(limiter.check_and_increment_at(&a, 1, WINDOW, 1_000).allowed);
        assert!(!limiter.check_and_increment_at(&a, 1, WINDOW, 1_000).allowed);
        assert!(limiter.check_and_increment_at(&b, 1, WINDOW, 1_000).allowed);
    }

    #[test]
    fn test_prune_idle_drops_stale_keys() {
        let limiter = FallbackLimiter::new();
        let stale = test_key("user:stale");
        let fresh = test_key("user:fresh");

        limiter.check_and_increment_at(&stale, 5, WINDOW, 1_000);
        let later = 1_000 + WINDOW.as_millis() as u64 + 1;
        limiter.check_and_increment_at(&fresh, 5, WINDOW, later);
        assert_eq!(limiter.key_count(), 2);

        limiter.prune_idle_at(later);
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_denied_calls_do_not_consume_slots() {
        let limiter = FallbackLimiter::new();
        let key = test_key("user:1");

        limiter.check_and_increment_at(&key, 1, WINDOW, 1_000);
        for _ in 0..5 {
            limiter.check_and_increment_at(&key, 1, WINDOW, 1_000);
        }

        // Only the single admitted entry should remain in the window.
        let later = 1_000 + WINDOW.as_millis() as u64 + 1;
        let check = limiter.check_and_increment_at(&key, 1, WINDOW, later);
        assert!(check.allowed);
    }
}
