//! HTTP protocol types
//!
//! Error envelope and the /config terms document. Header names live in
//! sync-core next to the types they carry.

use serde::{Deserialize, Serialize};
use sync_core::{Amount, PROTOCOL_VERSION, SERVICE_NAME};

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error message
    pub message: String,
    /// HTTP status code
    #[serde(skip)]
    pub status: u16,
}

impl ApiError {
    pub fn bad_request(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 400,
        }
    }

    pub fn forbidden(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 403,
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 404,
        }
    }

    pub fn payload_too_large(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 413,
        }
    }

    pub fn internal(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 500,
        }
    }

    pub fn unavailable(message: &str) -> Self {
        Self {
            message: message.to_string(),
            status: 503,
        }
    }
}

/// Terms of service document returned by GET /config
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceTerms {
    /// Service name, always "sync"
    pub name: String,
    /// Upload size cap in megabytes
    pub storage_limit_in_megabytes: u64,
    /// Fee for one year of service
    pub annual_fee: Amount,
    /// Protocol version (current:revision:age)
    pub version: String,
}

impl ServiceTerms {
    pub fn new(storage_limit_in_megabytes: u64, annual_fee: Amount) -> Self {
        Self {
            name: SERVICE_NAME.to_string(),
            storage_limit_in_megabytes,
            annual_fee,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}
