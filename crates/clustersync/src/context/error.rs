//! Errors raised by desired-state tree operations.

use thiserror::Error;

/// Errors that can occur while reading or writing the desired-state tree.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The handle, level or instance does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to (de)serialize tree value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid instruction '{kind}': {message}")]
    InvalidInstruction { kind: String, message: String },
}

impl ContextError {
    /// Returns true if this error means the addressed item is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContextError::NotFound(_))
    }
}

/// Result type for desired-state tree operations.
pub type Result<T> = std::result::Result<T, ContextError>;
