//! Sliding-window limiter backed by the remote counter store.
//!
//! The rolling window is a sorted set of timestamped members per key. Every
//! check purges expired members, counts the remainder, and conditionally
//! inserts the new request, all inside one atomic store operation. Without
//! that atomicity two concurrent callers could both observe
//! `count = limit - 1` and both be admitted, overshooting the limit.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

use super::key::RateLimitKey;
use super::store::{CounterStore, StoreError};
use crate::config::StoreConfig;

/// Outcome of one window check.
#[derive(Debug, Clone, Copy)]
pub struct WindowCheck {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Quota remaining after this check
    pub remaining: u64,
    /// When the consumed slot leaves the window
    pub reset_at: DateTime<Utc>,
    /// Non-expired members in the window, including this request if admitted
    pub current_count: u64,
}

impl WindowCheck {
    /// Build a check result from the pre-insert count the store observed.
    pub(crate) fn from_count_before(
        count_before: u64,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> Self {
        let allowed = count_before < limit;
        let current_count = if allowed { count_before + 1 } else { count_before };
        let reset_ms = now_ms.saturating_add(window.as_millis() as u64);

        Self {
            allowed,
            remaining: limit.saturating_sub(current_count),
            reset_at: DateTime::from_timestamp_millis(reset_ms as i64).unwrap_or_else(Utc::now),
            current_count,
        }
    }
}

/// Race-free rolling-window counter over a shared remote store.
pub struct SlidingWindowLimiter {
    /// The remote counter store
    store: Arc<dyn CounterStore>,
    /// Prefix applied to every store key
    key_prefix: String,
    /// Per-round-trip timeout; expiry counts as a store failure
    timeout: Duration,
}

impl SlidingWindowLimiter {
    /// Create a new limiter over the given store.
    pub fn new(store: Arc<dyn CounterStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
        }
    }

    /// Check the window for `key` and consume a slot when under `limit`.
    pub async fn check_and_increment(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
    ) -> Result<WindowCheck, StoreError> {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.check_and_increment_at(key, limit, window, now_ms).await
    }

    /// Same as `check_and_increment`, with an explicit evaluation instant.
    pub(crate) async fn check_and_increment_at(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCheck, StoreError> {
        // A uuid suffix disambiguates members that land on the same
        // millisecond, so ties never collapse into one entry.
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let store_key = format!("{}{}", self.key_prefix, key.to_string_key());

        let round_trip = self
            .store
            .check_and_increment(&store_key, limit, window, now_ms, &member);
        let count_before = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| StoreError::Timeout)??;

        let check = WindowCheck::from_count_before(count_before, limit, window, now_ms);

        trace!(
            key = %key,
            allowed = check.allowed,
            count = check.current_count,
            limit = limit,
            "Sliding window check"
        );

        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::testing::{MemoryStore, SlowStore};
    use crate::policy::EndpointCategory;

    const WINDOW: Duration = Duration::from_secs(60);

    fn test_key() -> RateLimitKey {
        RateLimitKey::new("tenant:1", EndpointCategory::Authenticated, "60s".to_string())
    }

    fn test_limiter(store: Arc<dyn CounterStore>) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(store, &StoreConfig::default())
    }

    #[tokio::test]
    async fn test_sequence_within_limit_then_denied() {
        let limiter = test_limiter(Arc::new(MemoryStore::new()));
        let key = test_key();

        for expected_remaining in [4, 3, 2, 1, 0] {
            let check = limiter
                .check_and_increment_at(&key, 5, WINDOW, 1_000)
                .await
                .unwrap();
            assert!(check.allowed);
            assert_eq!(check.remaining, expected_remaining);
        }

        let check = limiter
            .check_and_increment_at(&key, 5, WINDOW, 1_000)
            .await
            .unwrap();
        assert!(!check.allowed);
        assert_eq!(check.remaining, 0);
        assert_eq!(check.current_count, 5);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let limiter = test_limiter(Arc::new(MemoryStore::new()));
        let key = test_key();

        let start = 1_000_000;
        for _ in 0..3 {
            let check = limiter
                .check_and_increment_at(&key, 3, WINDOW, start)
                .await
                .unwrap();
            assert!(check.allowed);
        }
        let check = limiter
            .check_and_increment_at(&key, 3, WINDOW, start)
            .await
            .unwrap();
        assert!(!check.allowed);

        // One full window later the old members are expired and the quota
        // is whole again.
        let later = start + WINDOW.as_millis() as u64 + 1;
        let check = limiter
            .check_and_increment_at(&key, 3, WINDOW, later)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.remaining, 2);
    }

    #[tokio::test]
    async fn test_partial_expiry_frees_only_old_slots() {
        let limiter = test_limiter(Arc::new(MemoryStore::new()));
        let key = test_key();

        // Two early requests, then two late in the same window.
        for now in [1_000, 1_001, 30_000, 30_001] {
            assert!(limiter
                .check_and_increment_at(&key, 4, WINDOW, now)
                .await
                .unwrap()
                .allowed);
        }

        // 61s after the early pair: those two expired, the late pair has not.
        let now = 62_000;
        let check = limiter
            .check_and_increment_at(&key, 4, WINDOW, now)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.current_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let limiter = Arc::new(test_limiter(Arc::new(MemoryStore::new())));
        let key = test_key();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check_and_increment_at(&key, 5, WINDOW, 1_000)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let limiter = test_limiter(Arc::new(SlowStore {
            delay: Duration::from_secs(5),
        }));
        let key = test_key();

        let result = limiter.check_and_increment(&key, 5, WINDOW).await;
        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[tokio::test]
    async fn test_reset_at_is_one_window_out() {
        let limiter = test_limiter(Arc::new(MemoryStore::new()));
        let key = test_key();

        let now_ms = 1_700_000_000_000;
        let check = limiter
            .check_and_increment_at(&key, 5, WINDOW, now_ms)
            .await
            .unwrap();
        assert_eq!(
            check.reset_at.timestamp_millis() as u64,
            now_ms + WINDOW.as_millis() as u64
        );
    }
}
