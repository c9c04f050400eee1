//! PostgreSQL store
//!
//! Every multi-statement operation runs in its own SERIALIZABLE
//! transaction; serialization failures surface as soft errors and the
//! caller retries the whole operation, never individual statements.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use tracing::error;

use sync_core::{AccountId, AccountSignature, Amount, BackupHash};

use crate::error::{StorageError, StorageResult};
use crate::store::{
    AccountLookup, BackupRecord, CreditOutcome, GcStats, PendingPayment, StoreOutcome, SyncStore,
};

/// Embedded schema, applied at connect time.
const SCHEMA: &str = include_str!("schema.sql");

/// PostgreSQL implementation of [`SyncStore`]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and apply the schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPool::connect(database_url).await.map_err(map_sqlx)?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_schema(&self) -> StorageResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn begin_serializable(&self) -> StorageResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(tx)
    }

    async fn account_exists(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account: &AccountId,
    ) -> StorageResult<bool> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE account_pub = $1")
            .bind(account.as_bytes().as_slice())
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    async fn stored_hash(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account: &AccountId,
    ) -> StorageResult<Option<BackupHash>> {
        let row = sqlx::query("SELECT backup_hash FROM backups WHERE account_pub = $1")
            .bind(account.as_bytes().as_slice())
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.try_get("backup_hash").map_err(map_sqlx)?;
                Ok(Some(hash_from_bytes(&bytes)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SyncStore for PostgresStore {
    async fn lookup_account(&self, account: &AccountId) -> StorageResult<AccountLookup> {
        let mut tx = self.begin_serializable().await?;
        if !self.account_exists(&mut tx, account).await? {
            return Ok(AccountLookup::PaymentRequired);
        }
        let lookup = match self.stored_hash(&mut tx, account).await? {
            Some(hash) => AccountLookup::Backup(hash),
            None => AccountLookup::NoBackup,
        };
        tx.commit().await.map_err(map_sqlx)?;
        Ok(lookup)
    }

    async fn store_backup(
        &self,
        account: &AccountId,
        sig: &AccountSignature,
        backup_hash: &BackupHash,
        data: &[u8],
    ) -> StorageResult<StoreOutcome> {
        let mut tx = self.begin_serializable().await?;
        if !self.account_exists(&mut tx, account).await? {
            return Ok(StoreOutcome::PaymentRequired);
        }
        match self.stored_hash(&mut tx, account).await? {
            Some(existing) if existing == *backup_hash => return Ok(StoreOutcome::Unchanged),
            Some(_) => return Ok(StoreOutcome::Conflict),
            None => {}
        }
        sqlx::query(
            "INSERT INTO backups \
             (account_pub, account_sig, prev_hash, backup_hash, data) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(account.as_bytes().as_slice())
        .bind(sig.as_bytes().as_slice())
        .bind(BackupHash::ZERO.as_bytes().as_slice())
        .bind(backup_hash.as_bytes().as_slice())
        .bind(data)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
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
        let mut tx = self.begin_serializable().await?;
        if !self.account_exists(&mut tx, account).await? {
            return Ok(StoreOutcome::PaymentRequired);
        }
        match self.stored_hash(&mut tx, account).await? {
            None => return Ok(StoreOutcome::Missing),
            Some(existing) if existing == *backup_hash => return Ok(StoreOutcome::Unchanged),
            Some(existing) if existing != *old_hash => return Ok(StoreOutcome::Conflict),
            Some(_) => {}
        }
        // the WHERE clause re-checks the chain inside the same
        // serializable transaction
        let result = sqlx::query(
            "UPDATE backups SET \
             account_sig = $1, prev_hash = $2, backup_hash = $3, data = $4 \
             WHERE account_pub = $5 AND backup_hash = $2",
        )
        .bind(sig.as_bytes().as_slice())
        .bind(old_hash.as_bytes().as_slice())
        .bind(backup_hash.as_bytes().as_slice())
        .bind(data)
        .bind(account.as_bytes().as_slice())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() != 1 {
            error!("backup update matched no row after passing the chain check");
            return Err(StorageError::Hard(
                "backup update affected no rows".to_string(),
            ));
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(StoreOutcome::Stored)
    }

    async fn lookup_backup(&self, account: &AccountId) -> StorageResult<Option<BackupRecord>> {
        let row = sqlx::query(
            "SELECT account_sig, prev_hash, backup_hash, data \
             FROM backups WHERE account_pub = $1",
        )
        .bind(account.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let sig_bytes: Vec<u8> = row.try_get("account_sig").map_err(map_sqlx)?;
        let prev: Vec<u8> = row.try_get("prev_hash").map_err(map_sqlx)?;
        let hash: Vec<u8> = row.try_get("backup_hash").map_err(map_sqlx)?;
        let data: Vec<u8> = row.try_get("data").map_err(map_sqlx)?;
        Ok(Some(BackupRecord {
            account_sig: sig_from_bytes(&sig_bytes)?,
            prev_hash: hash_from_bytes(&prev)?,
            backup_hash: hash_from_bytes(&hash)?,
            data,
        }))
    }

    async fn store_payment(
        &self,
        account: &AccountId,
        order_id: &str,
        token: Option<&str>,
        amount: &Amount,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO payments \
             (account_pub, order_id, token, timestamp, amount, paid) \
             VALUES ($1, $2, $3, $4, $5, FALSE)",
        )
        .bind(account.as_bytes().as_slice())
        .bind(order_id)
        .bind(token)
        .bind(Utc::now())
        .bind(amount.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn lookup_pending_payments(
        &self,
        account: &AccountId,
    ) -> StorageResult<Vec<PendingPayment>> {
        let rows = sqlx::query(
            "SELECT order_id, token, timestamp, amount \
             FROM payments WHERE account_pub = $1 AND NOT paid \
             ORDER BY timestamp DESC",
        )
        .bind(account.as_bytes().as_slice())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let amount_s: String = row.try_get("amount").map_err(map_sqlx)?;
            let amount: Amount = amount_s
                .parse()
                .map_err(|e| StorageError::Hard(format!("corrupt amount column: {e}")))?;
            pending.push(PendingPayment {
                timestamp: row.try_get("timestamp").map_err(map_sqlx)?,
                order_id: row.try_get("order_id").map_err(map_sqlx)?,
                token: row.try_get("token").map_err(map_sqlx)?,
                amount,
            });
        }
        Ok(pending)
    }

    async fn increment_lifetime(
        &self,
        account: &AccountId,
        order_id: &str,
        lifetime: Duration,
    ) -> StorageResult<CreditOutcome> {
        let mut tx = self.begin_serializable().await?;
        let marked = sqlx::query(
            "UPDATE payments SET paid = TRUE \
             WHERE account_pub = $1 AND order_id = $2 AND NOT paid",
        )
        .bind(account.as_bytes().as_slice())
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if marked.rows_affected() == 0 {
            // unknown or already-paid order; nothing to credit
            return Ok(CreditOutcome::AlreadyCredited);
        }

        let row = sqlx::query("SELECT expiration_date FROM accounts WHERE account_pub = $1")
            .bind(account.as_bytes().as_slice())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let expiration: DateTime<Utc> =
                    row.try_get("expiration_date").map_err(map_sqlx)?;
                sqlx::query(
                    "UPDATE accounts SET expiration_date = $1 WHERE account_pub = $2",
                )
                .bind(expiration + lifetime)
                .bind(account.as_bytes().as_slice())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO accounts (account_pub, expiration_date) VALUES ($1, $2)",
                )
                .bind(account.as_bytes().as_slice())
                .bind(Utc::now() + lifetime)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
            }
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(CreditOutcome::Credited)
    }

    async fn gc(
        &self,
        expire_accounts_before: DateTime<Utc>,
        expire_payments_before: DateTime<Utc>,
    ) -> StorageResult<GcStats> {
        let mut tx = self.begin_serializable().await?;
        let accounts = sqlx::query("DELETE FROM accounts WHERE expiration_date < $1")
            .bind(expire_accounts_before)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let payments = sqlx::query("DELETE FROM payments WHERE NOT paid AND timestamp < $1")
            .bind(expire_payments_before)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(GcStats {
            accounts_deleted: accounts.rows_affected(),
            payments_deleted: payments.rows_affected(),
        })
    }
}

/// Split the embedded schema into executable statements, dropping
/// comment-only fragments.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn hash_from_bytes(bytes: &[u8]) -> StorageResult<BackupHash> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| StorageError::Hard(format!("corrupt hash column: {} bytes", bytes.len())))?;
    Ok(BackupHash::from_bytes(arr))
}

fn sig_from_bytes(bytes: &[u8]) -> StorageResult<AccountSignature> {
    let arr: [u8; 64] = bytes.try_into().map_err(|_| {
        StorageError::Hard(format!("corrupt signature column: {} bytes", bytes.len()))
    })?;
    Ok(AccountSignature::from_bytes(arr))
}

fn map_sqlx(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            // serialization_failure / deadlock_detected are retryable
            if matches!(code.as_ref(), "40001" | "40P01") {
                return StorageError::Soft(e.to_string());
            }
        }
    }
    StorageError::Hard(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_drop_comments() {
        let statements = schema_statements(SCHEMA);
        assert!(statements.len() >= 6);
        assert!(statements.iter().all(|s| !s.is_empty()));
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS accounts"));
    }

    #[test]
    fn test_hash_from_bytes_rejects_bad_length() {
        assert!(hash_from_bytes(&[0u8; 64]).is_ok());
        assert!(hash_from_bytes(&[0u8; 32]).is_err());
        assert!(sig_from_bytes(&[0u8; 63]).is_err());
    }
}
