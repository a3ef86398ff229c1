//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The counter store answered with something other than the expected reply
    #[error("Malformed counter store response: {0}")]
    MalformedResponse(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
