//! Storage contract
//!
//! The trait below is the whole consistency story of the service:
//! every operation either succeeds atomically or reports a structured
//! outcome the handler can branch on. Hash-chain enforcement lives in
//! `update_backup`, payment idempotence in `increment_lifetime`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sync_core::{AccountId, AccountSignature, Amount, BackupHash};

use crate::error::StorageResult;

/// Result of looking up an account's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLookup {
    /// Account unknown (or never paid); uploads must go through payment.
    PaymentRequired,
    /// Account exists but holds no backup yet.
    NoBackup,
    /// Account holds a backup with this hash.
    Backup(BackupHash),
}

/// Result of a store/update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The backup was written.
    Stored,
    /// Byte-identical backup already present, nothing changed.
    Unchanged,
    /// Account unknown, payment needed before storing anything.
    PaymentRequired,
    /// A different backup is stored and its hash does not match the
    /// client's claimed predecessor.
    Conflict,
    /// Update requested but no backup exists at all.
    Missing,
}

/// Result of crediting a confirmed payment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Payment marked paid and account lifetime extended.
    Credited,
    /// Order unknown or already credited; account untouched.
    AlreadyCredited,
}

/// One stored backup
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub account_sig: AccountSignature,
    pub prev_hash: BackupHash,
    pub backup_hash: BackupHash,
    pub data: Vec<u8>,
}

/// One unpaid order on an account
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub token: Option<String>,
    pub amount: Amount,
}

/// Counters from one GC run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Expired accounts deleted (backups go by cascade).
    pub accounts_deleted: u64,
    /// Stale unpaid payment rows deleted.
    pub payments_deleted: u64,
}

/// Transactional store backing the backup service
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Look up an account and the hash of its current backup, if any.
    async fn lookup_account(&self, account: &AccountId) -> StorageResult<AccountLookup>;

    /// Store the FIRST backup for an account.
    ///
    /// Valid only when no prior backup exists. A byte-identical
    /// existing backup is `Unchanged`, any other existing backup is
    /// `Conflict`.
    async fn store_backup(
        &self,
        account: &AccountId,
        sig: &AccountSignature,
        backup_hash: &BackupHash,
        data: &[u8],
    ) -> StorageResult<StoreOutcome>;

    /// Replace an existing backup, guarded by the predecessor hash.
    ///
    /// Succeeds only if the stored hash equals `old_hash` at the
    /// instant of the update; this is the optimistic-concurrency
    /// check, not advisory.
    async fn update_backup(
        &self,
        account: &AccountId,
        old_hash: &BackupHash,
        sig: &AccountSignature,
        backup_hash: &BackupHash,
        data: &[u8],
    ) -> StorageResult<StoreOutcome>;

    /// Fetch the full current backup record.
    async fn lookup_backup(&self, account: &AccountId) -> StorageResult<Option<BackupRecord>>;

    /// Record a newly created, unpaid order.
    async fn store_payment(
        &self,
        account: &AccountId,
        order_id: &str,
        token: Option<&str>,
        amount: &Amount,
    ) -> StorageResult<()>;

    /// All unpaid orders on the account, most recent first.
    async fn lookup_pending_payments(
        &self,
        account: &AccountId,
    ) -> StorageResult<Vec<PendingPayment>>;

    /// Atomically mark an order paid and extend the account lifetime.
    ///
    /// Creating the account row if absent (expiring `lifetime` from
    /// now) or extending an existing expiration by `lifetime`. An
    /// already-paid or unknown order yields `AlreadyCredited` and
    /// leaves the account untouched, so retried confirmations cannot
    /// double-credit.
    async fn increment_lifetime(
        &self,
        account: &AccountId,
        order_id: &str,
        lifetime: Duration,
    ) -> StorageResult<CreditOutcome>;

    /// Delete expired accounts (cascading to backups) and stale unpaid
    /// payment rows.
    async fn gc(
        &self,
        expire_accounts_before: DateTime<Utc>,
        expire_payments_before: DateTime<Utc>,
    ) -> StorageResult<GcStats>;
}
