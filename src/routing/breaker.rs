//! Per-backend-instance circuit breaker.
//!
//! State machine: closed (pass-through) opens after `failure_threshold`
//! consecutive failures within `failure_window`; an open breaker fails calls
//! immediately without invoking the target; after `recovery_timeout` it goes
//! half-open and admits exactly one probe call, whose outcome alone decides
//! whether the breaker closes again or reopens.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::error::{GatekeeperError, Result};

/// Breaker state, owned per backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast, target not invoked
    Open,
    /// One probe call allowed through
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure tracker that fails fast against a misbehaving backend instance.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    failure_window: std::time::Duration,
    recovery_timeout: std::time::Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for the named backend instance.
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            failure_window: config.failure_window(),
            recovery_timeout: config.recovery_timeout(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Name of the instance this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask whether a call may proceed.
    ///
    /// An open breaker whose recovery timeout has elapsed transitions to
    /// half-open here and admits the caller as the single probe. A failing
    /// preflight returns `CircuitOpen` without touching the target.
    pub fn preflight(&self) -> Result<()> {
        self.preflight_at(Instant::now())
    }

    pub(crate) fn preflight_at(&self, now: Instant) -> Result<()> {
        self.preflight_claim_at(now).map(|_| ())
    }

    /// Preflight that also reports whether this call claimed the half-open
    /// probe slot. A claimed slot must be released through
    /// `record_success`, `record_failure`, or `abandon_probe`.
    pub(crate) fn preflight_claim(&self) -> Result<bool> {
        self.preflight_claim_at(Instant::now())
    }

    pub(crate) fn preflight_claim_at(&self, now: Instant) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    info!(instance = %self.name, "Recovery timeout elapsed, allowing probe call");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(GatekeeperError::CircuitOpen {
                        instance: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    // Exactly one trial call at a time.
                    Err(GatekeeperError::CircuitOpen {
                        instance: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Record a successful call against the guarded instance.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                info!(instance = %self.name, "Probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.first_failure_at = None;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.first_failure_at = None;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call against the guarded instance.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(instance = %self.name, "Probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                // Failures only count as consecutive inside the bounded
                // window; older streaks start over.
                if let Some(first) = inner.first_failure_at {
                    if now.saturating_duration_since(first) > self.failure_window {
                        inner.consecutive_failures = 0;
                        inner.first_failure_at = None;
                    }
                }

                if inner.first_failure_at.is_none() {
                    inner.first_failure_at = Some(now);
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        instance = %self.name,
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
        }
    }

    /// Release a claimed probe slot when the call was abandoned before an
    /// outcome could be recorded.
    ///
    /// An abandoned trial proves nothing about the instance, so the circuit
    /// reopens and the recovery timer restarts. Without this, a dropped
    /// probe would hold the slot forever and wedge the breaker half-open.
    pub(crate) fn abandon_probe(&self) {
        self.abandon_probe_at(Instant::now());
    }

    pub(crate) fn abandon_probe_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            warn!(instance = %self.name, "Probe abandoned before completion, reopening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
        }
    }

    /// Current state as last recorded.
    ///
    /// Open-to-half-open transitions happen on `preflight`, not here.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}
