//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the Gatekeeper engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Remote counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit: CircuitConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            limiter: LimiterConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Remote counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix applied to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Round-trip timeout in milliseconds.
    ///
    /// Deliberately shorter than typical caller-facing timeouts so the
    /// admission layer never becomes the slow path; a timeout is treated as
    /// a store failure and triggers fallback.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    /// The round-trip timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "gatekeeper:ratelimit:".to_string()
}

fn default_store_timeout_ms() -> u64 {
    150
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Path to a policy catalog YAML file; built-in defaults when unset
    pub policy_path: Option<String>,

    /// Whether to fail open when the counter store is unreachable.
    ///
    /// When true (the default), the in-process fallback limiter enforces
    /// quotas independently per process, so aggregate traffic may exceed the
    /// intended limit while degraded. When false, every request is denied
    /// until the store recovers.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            fail_open: default_fail_open(),
        }
    }
}

fn default_fail_open() -> bool {
    true
}

/// Circuit breaker configuration, applied per backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling period in seconds within which failures count as consecutive
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Seconds an open breaker waits before allowing a probe call
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl CircuitConfig {
    /// The failure window as a `Duration`.
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    /// The recovery timeout as a `Duration`.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatekeeperConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::GatekeeperError::Config(e.to_string()))?;
        Ok(config)
    }
}
