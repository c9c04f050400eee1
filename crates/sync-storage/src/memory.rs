//! In-memory store
//!
//! Backs the test suites and the `storage = "memory"` dev
//! configuration. One async lock around the whole state gives the same
//! per-operation atomicity the Postgres backend gets from serializable
//! transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use sync_core::{AccountId, AccountSignature, Amount, BackupHash};

use crate::error::StorageResult;
use crate::store::{
    AccountLookup, BackupRecord, CreditOutcome, GcStats, PendingPayment, StoreOutcome, SyncStore,
};

#[derive(Clone)]
struct PaymentRow {
    timestamp: DateTime<Utc>,
    token: Option<String>,
    amount: Amount,
    paid: bool,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, DateTime<Utc>>,
    backups: HashMap<AccountId, BackupRecord>,
    payments: HashMap<(AccountId, String), PaymentRow>,
}

/// In-memory implementation of [`SyncStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiration timestamp of an account, for tests and diagnostics.
    pub async fn account_expiration(&self, account: &AccountId) -> Option<DateTime<Utc>> {
        self.inner.read().await.accounts.get(account).copied()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn lookup_account(&self, account: &AccountId) -> StorageResult<AccountLookup> {
        let inner = self.inner.read().await;
        if !inner.accounts.contains_key(account) {
            return Ok(AccountLookup::PaymentRequired);
        }
        Ok(match inner.backups.get(account) {
            Some(record) => AccountLookup::Backup(record.backup_hash),
            None => AccountLookup::NoBackup,
        })
    }

    async fn store_backup(
        &self,
        account: &AccountId,
        sig: &AccountSignature,
        backup_hash: &BackupHash,
        data: &[u8],
    ) -> StorageResult<StoreOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.accounts.contains_key(account) {
            return Ok(StoreOutcome::PaymentRequired);
        }
        if let Some(existing) = inner.backups.get(account) {
            if existing.backup_hash == *backup_hash {
                return Ok(StoreOutcome::Unchanged);
            }
            return Ok(StoreOutcome::Conflict);
        }
        inner.backups.insert(
            *account,
            BackupRecord {
                account_sig: *sig,
                prev_hash: BackupHash::ZERO,
                backup_hash: *backup_hash,
                data: data.to_vec(),
            },
        );
        Ok(StoreOutcome::Stored)
    }

    async fn update_backup(
        &self,
        account: &AccountId,
        old_hash: &BackupHash,
        sig: &AccountSignature,
        backup_hash: &BackupHash,
        data: &[u8],
    ) -> StorageResult<StoreOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.accounts.contains_key(account) {
            return Ok(StoreOutcome::PaymentRequired);
        }
        let existing = match inner.backups.get(account) {
            Some(existing) => existing,
            None => return Ok(StoreOutcome::Missing),
        };
        if existing.backup_hash == *backup_hash {
            return Ok(StoreOutcome::Unchanged);
        }
        if existing.backup_hash != *old_hash {
            return Ok(StoreOutcome::Conflict);
        }
        inner.backups.insert(
            *account,
            BackupRecord {
                account_sig: *sig,
                prev_hash: *old_hash,
                backup_hash: *backup_hash,
                data: data.to_vec(),
            },
        );
        Ok(StoreOutcome::Stored)
    }

    async fn lookup_backup(&self, account: &AccountId) -> StorageResult<Option<BackupRecord>> {
        Ok(self.inner.read().await.backups.get(account).cloned())
    }

    async fn store_payment(
        &self,
        account: &AccountId,
        order_id: &str,
        token: Option<&str>,
        amount: &Amount,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.payments.insert(
            (*account, order_id.to_string()),
            PaymentRow {
                timestamp: Utc::now(),
                token: token.map(str::to_string),
                amount: amount.clone(),
                paid: false,
            },
        );
        Ok(())
    }

    async fn lookup_pending_payments(
        &self,
        account: &AccountId,
    ) -> StorageResult<Vec<PendingPayment>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<PendingPayment> = inner
            .payments
            .iter()
            .filter(|((acc, _), row)| acc == account && !row.paid)
            .map(|((_, order_id), row)| PendingPayment {
                timestamp: row.timestamp,
                order_id: order_id.clone(),
                token: row.token.clone(),
                amount: row.amount.clone(),
            })
            .collect();
        pending.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(pending)
    }

    async fn increment_lifetime(
        &self,
        account: &AccountId,
        order_id: &str,
        lifetime: Duration,
    ) -> StorageResult<CreditOutcome> {
        let mut inner = self.inner.write().await;
        match inner.payments.get_mut(&(*account, order_id.to_string())) {
            Some(row) if !row.paid => row.paid = true,
            _ => return Ok(CreditOutcome::AlreadyCredited),
        }
        let expiration = inner
            .accounts
            .entry(*account)
            .or_insert_with(Utc::now);
        *expiration += lifetime;
        Ok(CreditOutcome::Credited)
    }

    async fn gc(
        &self,
        expire_accounts_before: DateTime<Utc>,
        expire_payments_before: DateTime<Utc>,
    ) -> StorageResult<GcStats> {
        let mut inner = self.inner.write().await;
        let mut stats = GcStats::default();

        let expired: Vec<AccountId> = inner
            .accounts
            .iter()
            .filter(|(_, expiration)| **expiration < expire_accounts_before)
            .map(|(account, _)| *account)
            .collect();
        for account in expired {
            inner.accounts.remove(&account);
            inner.backups.remove(&account);
            stats.accounts_deleted += 1;
        }

        let stale: Vec<(AccountId, String)> = inner
            .payments
            .iter()
            .filter(|(_, row)| !row.paid && row.timestamp < expire_payments_before)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            inner.payments.remove(&key);
            stats.payments_deleted += 1;
        }
        Ok(stats)
    }
}
