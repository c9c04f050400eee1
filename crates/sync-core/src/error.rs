//! Error types for sync-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid base32 encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
