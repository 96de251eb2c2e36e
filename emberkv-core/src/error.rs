//! Error types for EmberKV

use thiserror::Error;

/// Result type alias for EmberKV operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberKV error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Table file structure is inconsistent
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Timestamp cannot be represented by the on-disk encoding
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Write attempted after the engine was closed
    #[error("Storage engine is closed")]
    Closed,

    /// A blocking flush did not complete in time
    #[error("Flush of generation {0} timed out")]
    FlushTimeout(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EmberError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, EmberError::Corruption(_))
    }
}
