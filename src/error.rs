//! Error types for the Authguard service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Authguard operations.
///
/// Policy outcomes (a denied request, a locked account) are never errors;
/// they are reported through `RateLimitInfo` and `LockoutStatus`.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// A bounded call to the shared store did not finish in time
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Authguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
