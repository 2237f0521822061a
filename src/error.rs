//! Error types for the Turnstile admission layer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// A rejected request is not an error: it is a
/// [`Decision`](crate::admission::Decision).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
