//! Server configuration

use serde::{Deserialize, Serialize};
use sync_core::Amount;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Storage backend configuration
    pub storage: StorageConfig,
    /// Merchant backend base URL for order management
    pub merchant_url: String,
    /// Bearer token for the merchant backend, if it requires one
    pub merchant_api_key: Option<String>,
    /// Maximum upload size in megabytes
    pub upload_limit_mb: u64,
    /// Fee charged per year of account lifetime
    pub annual_fee: Amount,
    /// How long a client may long-poll for payment confirmation, in seconds
    pub payment_timeout_secs: u64,
    /// Garbage collection configuration
    #[serde(default)]
    pub gc: GcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9967".to_string(),
            storage: StorageConfig::default(),
            merchant_url: "http://localhost:8888/".to_string(),
            merchant_api_key: None,
            upload_limit_mb: 16,
            annual_fee: "KUDOS:0.1".parse().expect("valid default fee"),
            payment_timeout_secs: 1800,
            gc: GcConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config backed by PostgreSQL
    pub fn postgres(url: &str) -> Self {
        Self {
            storage: StorageConfig::Postgres {
                url: url.to_string(),
            },
            ..Default::default()
        }
    }

    /// Set the merchant backend URL
    pub fn with_merchant(mut self, url: &str) -> Self {
        self.merchant_url = url.to_string();
        self
    }

    /// Set the annual fee
    pub fn with_annual_fee(mut self, fee: Amount) -> Self {
        self.annual_fee = fee;
        self
    }

    /// Upload size cap in bytes.
    pub fn upload_limit_bytes(&self) -> u64 {
        self.upload_limit_mb * 1024 * 1024
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory store, for development and tests
    #[serde(rename = "memory")]
    Memory,
    /// PostgreSQL
    #[serde(rename = "postgres")]
    Postgres { url: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Enable the periodic GC task
    pub enabled: bool,
    /// Interval in hours between GC runs
    pub interval_hours: u64,
    /// Unpaid orders older than this are dropped
    pub payment_retention_hours: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 6,
            payment_retention_hours: 24,
        }
    }
}
