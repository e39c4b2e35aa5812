//! Error types for timewindow.

use thiserror::Error;

/// Main error type for timewindow operations.
#[derive(Error, Debug)]
pub enum TimeWindowError {
    /// The store could not be reached (refused, dropped, timed out, I/O)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store was reached but reported an error; nothing was applied
    #[error("Store execution error: {0}")]
    StoreExecution(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TimeWindowError {
    /// Whether this error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TimeWindowError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for TimeWindowError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            TimeWindowError::StoreUnavailable(err.to_string())
        } else {
            TimeWindowError::StoreExecution(err.to_string())
        }
    }
}

impl From<config::ConfigError> for TimeWindowError {
    fn from(err: config::ConfigError) -> Self {
        TimeWindowError::Config(err.to_string())
    }
}

/// Result type alias for timewindow operations.
pub type Result<T> = std::result::Result<T, TimeWindowError>;
