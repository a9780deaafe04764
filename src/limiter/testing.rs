//! Counter store doubles shared by limiter tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::store::{CounterStore, StoreError};

/// In-memory store that honors the atomicity contract by holding one lock
/// across the whole purge-count-insert sequence.
#[derive(Default)]
pub(crate) struct MemoryStore {
    windows: Mutex<HashMap<String, Vec<(u64, String)>>>,
    calls: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// How many times `check_and_increment` has been invoked.
    pub(crate) fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();

        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        entries.retain(|(score, _)| *score > cutoff);

        let count = entries.len() as u64;
        if count < limit {
            entries.push((now_ms, member.to_string()));
        }

        Ok(count)
    }
}

/// Wrapper that fails with a connectivity error while `down` is set,
/// delegating to the inner store otherwise.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner
            .check_and_increment(key, limit, window, now_ms, member)
            .await
    }
}

/// Store whose round trip takes `delay`, for exercising the timeout path.
pub(crate) struct SlowStore {
    pub(crate) delay: Duration,
}

#[async_trait]
impl CounterStore for SlowStore {
    async fn check_and_increment(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
        _now_ms: u64,
        _member: &str,
    ) -> Result<u64, StoreError> {
        tokio::time::sleep(self.delay).await;
        Ok(0)
    }
}
