//! Error types for Pause.

use thiserror::Error;

/// Main error type for Pause operations.
#[derive(Error, Debug)]
pub enum PauseError {
    /// The backing store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The backing store rejected a command
    #[error("Store error: {0}")]
    Store(String),

    /// The operation needs a full keyspace scan, which a sharded store cannot answer
    #[error("Operation not supported by a sharded store: {0}")]
    UnsupportedOperation(&'static str),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy without a scope, or a scope nobody registered
    #[error("Scope not configured: {0}")]
    ScopeNotConfigured(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for PauseError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            PauseError::StoreUnavailable(err.to_string())
        } else {
            PauseError::Store(err.to_string())
        }
    }
}

/// Result type alias for Pause operations.
pub type Result<T> = std::result::Result<T, PauseError>;
