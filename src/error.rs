//! Error types for the Turnstile limiter.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rate-limit denials and blocks are not errors; they are reported through
/// [`crate::ratelimit::Decision`].
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The caller supplied an unusable request (e.g. an empty identifier).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while loading layered configuration
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// Backing store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`crate::ratelimit::RateLimitStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing store returned data that could not be interpreted.
    #[error("corrupt entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
