//! Remote counter store abstraction and Redis-backed implementation.
//!
//! The store must execute the purge-count-insert-expire sequence as a single
//! atomic operation relative to concurrent callers on the same key. The Redis
//! implementation achieves this with a Lua script; tests substitute an
//! in-memory double behind the same trait.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors from the remote counter store.
///
/// These are the *only* conditions that trigger local fallback. A valid
/// over-limit count is a normal result, never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or refused the connection
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The round trip exceeded the configured store timeout
    #[error("Counter store request timed out")]
    Timeout,
}

/// Abstraction over the shared remote counter store.
///
/// Implementations must make `check_and_increment` atomic per key: two
/// concurrent callers must never both observe `count = limit - 1` and both
/// be admitted.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically purge members older than `now_ms - window`, count the
    /// remainder, insert `member` scored `now_ms` when the pre-insert count
    /// is below `limit`, and refresh the key expiry to `window`.
    ///
    /// Returns the count taken *before* the conditional insert; the caller
    /// admits the request iff `count < limit`.
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError>;
}

/// Lua script executing the full window check atomically on the Redis side.
///
/// KEYS[1] = counter key; ARGV = [now_ms, window_ms, limit, member].
/// Returns the member count before the conditional insert.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, cutoff)
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return count
"#;

/// Redis-backed counter store.
///
/// Uses a multiplexed connection with automatic reconnection, so service
/// resumes without intervention once a failed Redis instance comes back.
pub struct RedisStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis at the given URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(classify_redis_error)?;

        info!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis() as u64;

        let count: u64 = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        Ok(count)
    }
}

fn classify_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(e.to_string())
    }
}
