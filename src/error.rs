//! Error types for the Gatekeeper engine.

use thiserror::Error;

use crate::limiter::StoreError;

/// Main error type for Gatekeeper operations.
///
/// Over-limit outcomes are *not* errors: they are returned as decisions by
/// the limiter facade. This enum covers the conditions callers must
/// distinguish to apply their own retry or backoff.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// The selected backend instance's circuit breaker is open.
    ///
    /// The target was never invoked; callers can tell this apart from a
    /// failure of the target itself.
    #[error("Circuit open for backend instance {instance}")]
    CircuitOpen {
        /// Identifier of the instance whose breaker rejected the call
        instance: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
