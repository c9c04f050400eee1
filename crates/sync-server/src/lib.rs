//! Pay-gated backup server
//!
//! Stores one encrypted backup blob per account, where an account is
//! an EdDSA public key and service is paid for through a Taler
//! merchant backend. See the `backup` module for the upload protocol
//! and `payments` for the paywall.

pub mod backup;
pub mod config;
pub mod payments;
pub mod protocol;
pub mod server;

pub use config::{GcConfig, ServerConfig, StorageConfig};
pub use server::{run_server, ServerState};
