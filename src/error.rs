//! Error types for the Turnstile service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config store or counter store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A counter value that does not parse as a non-negative integer
    #[error("Malformed counter for {key}: {value:?}")]
    MalformedCounter { key: String, value: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error comes from the stores backing an admission decision.
    ///
    /// These are the failures the middleware answers with a 500.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::MalformedCounter { .. })
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
