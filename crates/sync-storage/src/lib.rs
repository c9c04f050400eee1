//! Storage backends for the sync backup service
//!
//! One backup record per account, an account lifetime ledger, and the
//! pending-payment table gating uploads. Backends implement the
//! [`SyncStore`] trait; every multi-statement operation is atomic and
//! business outcomes (conflict, duplicate, payment required) are enum
//! values rather than errors.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AccountLookup, BackupRecord, CreditOutcome, GcStats, PendingPayment, StoreOutcome, SyncStore,
};
