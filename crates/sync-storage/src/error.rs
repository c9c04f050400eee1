//! Storage error types

use thiserror::Error;

/// Storage error type
///
/// Soft errors are transient (serialization conflicts, connectivity
/// blips); retrying the whole operation may succeed. Hard errors
/// indicate bugs or schema problems and retries are futile.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transient storage error: {0}")]
    Soft(String),

    #[error("Storage backend error: {0}")]
    Hard(String),
}

impl StorageError {
    pub fn is_soft(&self) -> bool {
        matches!(self, StorageError::Soft(_))
    }
}

/// Result type alias
pub type StorageResult<T> = Result<T, StorageError>;
