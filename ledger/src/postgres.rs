//! Postgres ledger store.
//!
//! Each mutating call runs in one database transaction. Debits use a
//! conditional update so the balance check and the write are a single
//! statement:
//!
//! ```sql
//! UPDATE stablecoin_accounts SET balance = balance - $1
//! WHERE id = $2 AND balance >= $1 AND is_active AND currency = $3
//! ```
//!
//! Zero affected rows means the debit was refused; a follow-up read decides
//! which error to report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use closedloop_common::{
    AccountId, AccountNumber, Counterparty, Currency, EntryId, LedgerError, Result, Transaction,
    TransactionId, TransactionStatus, TransactionType, UserId,
};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::account::{AccountType, StablecoinAccount};
use crate::journal::{EntryType, JournalBatch, JournalLine, LedgerEntry};
use crate::store::{LedgerStore, PostedTransaction, TransactionTotals};

const ACCOUNT_COLUMNS: &str = "id, account_number, owner_id, balance, currency, account_type, \
     is_active, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, user_id, amount, currency, transaction_type, \
     status, description, counterparty, external_id, idempotency_key, metadata, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "id, transaction_id, account_id, entry_type, amount, balance_after, description, created_at";

fn db_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Store an enum by its serde name.
fn encode_name<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(LedgerError::Internal(format!("not a unit variant: {}", other))),
        Err(e) => Err(LedgerError::Internal(e.to_string())),
    }
}

fn decode_name<T: DeserializeOwned>(name: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|e| LedgerError::Internal(format!("unknown stored value {:?}: {}", name, e)))
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    account_number: String,
    owner_id: Uuid,
    balance: Decimal,
    currency: String,
    account_type: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for StablecoinAccount {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self> {
        let account_type = AccountType::parse(&row.account_type).ok_or_else(|| {
            LedgerError::Internal(format!("unknown account type {:?}", row.account_type))
        })?;
        Ok(Self {
            id: AccountId::from_uuid(row.id),
            account_number: AccountNumber::new(row.account_number),
            owner: UserId::from_uuid(row.owner_id),
            balance: row.balance,
            currency: Currency::new(row.currency),
            account_type,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    transaction_id: String,
    user_id: Uuid,
    amount: Decimal,
    currency: String,
    transaction_type: String,
    status: String,
    description: Option<String>,
    counterparty: Option<Json<Counterparty>>,
    external_id: Option<String>,
    idempotency_key: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let status = TransactionStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Internal(format!("unknown status {:?}", row.status)))?;
        Ok(Self {
            id: TransactionId::from_string(row.transaction_id),
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            currency: Currency::new(row.currency),
            transaction_type: decode_name::<TransactionType>(&row.transaction_type)?,
            status,
            description: row.description,
            counterparty: row.counterparty.map(|c| c.0),
            external_id: row.external_id,
            idempotency_key: row.idempotency_key,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    transaction_id: String,
    account_id: Uuid,
    entry_type: String,
    amount: Decimal,
    balance_after: Decimal,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let entry_type = EntryType::parse(&row.entry_type).ok_or_else(|| {
            LedgerError::Internal(format!("unknown entry type {:?}", row.entry_type))
        })?;
        Ok(Self {
            id: EntryId::from_uuid(row.id),
            transaction_id: TransactionId::from_string(row.transaction_id),
            account_id: AccountId::from_uuid(row.account_id),
            entry_type,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TotalsRow {
    transaction_id: String,
    transaction_type: String,
    debits: Decimal,
    credits: Decimal,
}

/// Ledger store backed by Postgres.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with at most `max_connections` connections.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Apply embedded schema migrations.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        // Other crates record their own migrations in the same table.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        info!("Ledger migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_transaction(conn: &mut PgConnection, transaction: &Transaction) -> Result<()> {
        let sql = format!(
            "INSERT INTO transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            TRANSACTION_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(transaction.id.as_str())
            .bind(*transaction.user_id.as_uuid())
            .bind(transaction.amount)
            .bind(transaction.currency.code())
            .bind(encode_name(&transaction.transaction_type)?)
            .bind(transaction.status.as_str())
            .bind(transaction.description.as_deref())
            .bind(transaction.counterparty.as_ref().map(Json))
            .bind(transaction.external_id.as_deref())
            .bind(transaction.idempotency_key.as_deref())
            .bind(&transaction.metadata)
            .bind(transaction.created_at)
            .bind(transaction.updated_at)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateRequest(
                transaction
                    .idempotency_key
                    .clone()
                    .unwrap_or_else(|| transaction.id.to_string()),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Explain why a conditional update touched no rows.
    async fn refusal(conn: &mut PgConnection, line: &JournalLine) -> LedgerError {
        let row: std::result::Result<Option<(Decimal, bool, String)>, sqlx::Error> =
            sqlx::query_as(
                "SELECT balance, is_active, currency FROM stablecoin_accounts WHERE id = $1",
            )
            .bind(*line.account_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await;

        match row {
            Err(e) => db_err(e),
            Ok(None) => LedgerError::AccountNotFound(line.account_id.to_string()),
            Ok(Some((_, false, _))) => LedgerError::AccountInactive(line.account_id),
            Ok(Some((_, _, currency))) if currency != line.currency.code() => {
                LedgerError::CurrencyMismatch {
                    expected: Currency::new(currency),
                    actual: line.currency.clone(),
                }
            }
            Ok(Some((available, _, _))) => LedgerError::InsufficientFunds {
                required: line.amount,
                available,
            },
        }
    }

    async fn apply_line(
        conn: &mut PgConnection,
        transaction_id: &TransactionId,
        line: &JournalLine,
    ) -> Result<LedgerEntry> {
        let sql = match line.entry_type {
            EntryType::Debit => {
                "UPDATE stablecoin_accounts SET balance = balance - $1, updated_at = now() \
                 WHERE id = $2 AND balance >= $1 AND is_active AND currency = $3"
            }
            EntryType::Credit => {
                "UPDATE stablecoin_accounts SET balance = balance + $1, updated_at = now() \
                 WHERE id = $2 AND is_active AND currency = $3"
            }
        };
        let affected = sqlx::query(sql)
            .bind(line.amount)
            .bind(*line.account_id.as_uuid())
            .bind(line.currency.code())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?
            .rows_affected();

        if affected == 0 {
            return Err(Self::refusal(conn, line).await);
        }

        let (balance_after,): (Decimal,) =
            sqlx::query_as("SELECT balance FROM stablecoin_accounts WHERE id = $1")
                .bind(*line.account_id.as_uuid())
                .fetch_one(&mut *conn)
                .await
                .map_err(db_err)?;

        let entry = LedgerEntry::from_line(transaction_id, line, balance_after);
        let sql = format!(
            "INSERT INTO ledger_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            ENTRY_COLUMNS
        );
        sqlx::query(&sql)
            .bind(*entry.id.as_uuid())
            .bind(entry.transaction_id.as_str())
            .bind(*entry.account_id.as_uuid())
            .bind(entry.entry_type.as_str())
            .bind(entry.amount)
            .bind(entry.balance_after)
            .bind(entry.description.as_deref())
            .bind(entry.created_at)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        Ok(entry)
    }

    #[instrument(skip(self, transaction, lines), fields(transaction_id = %transaction.id))]
    async fn post(
        &self,
        transaction: Transaction,
        lines: &[JournalLine],
    ) -> Result<PostedTransaction> {
        let mut dbtx: sqlx::Transaction<'_, Postgres> = self.pool.begin().await.map_err(db_err)?;

        Self::insert_transaction(&mut dbtx, &transaction).await?;

        // Row locks are always taken in id order.
        let mut ids: Vec<Uuid> = lines.iter().map(|l| *l.account_id.as_uuid()).collect();
        ids.sort();
        ids.dedup();
        sqlx::query("SELECT id FROM stablecoin_accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&ids)
            .execute(&mut *dbtx)
            .await
            .map_err(db_err)?;

        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            entries.push(Self::apply_line(&mut dbtx, &transaction.id, line).await?);
        }

        dbtx.commit().await.map_err(db_err)?;
        debug!(entries = entries.len(), "Transaction committed");

        Ok(PostedTransaction::new(transaction, entries))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_account(&self, account: &StablecoinAccount) -> Result<()> {
        let sql = format!(
            "INSERT INTO stablecoin_accounts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            ACCOUNT_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(*account.id.as_uuid())
            .bind(account.account_number.as_str())
            .bind(*account.owner.as_uuid())
            .bind(account.balance)
            .bind(account.currency.code())
            .bind(account.account_type.as_str())
            .bind(account.is_active)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateRequest(
                account.account_number.to_string(),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<StablecoinAccount>> {
        let sql = format!("SELECT {} FROM stablecoin_accounts WHERE id = $1", ACCOUNT_COLUMNS);
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(StablecoinAccount::try_from).transpose()
    }

    async fn find_account_by_number(
        &self,
        number: &AccountNumber,
    ) -> Result<Option<StablecoinAccount>> {
        let sql = format!(
            "SELECT {} FROM stablecoin_accounts WHERE account_number = $1",
            ACCOUNT_COLUMNS
        );
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(StablecoinAccount::try_from).transpose()
    }

    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<StablecoinAccount>> {
        let sql = format!(
            "SELECT {} FROM stablecoin_accounts WHERE owner_id = $1 ORDER BY created_at, id",
            ACCOUNT_COLUMNS
        );
        let rows: Vec<AccountRow> = sqlx::query_as(&sql)
            .bind(*owner.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(StablecoinAccount::try_from).collect()
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<StablecoinAccount> {
        let sql = format!(
            "UPDATE stablecoin_accounts SET is_active = $2, updated_at = now() WHERE id = $1 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?
            .try_into()
    }

    async fn apply_deposit(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction> {
        if line.entry_type != EntryType::Credit {
            return Err(LedgerError::Internal("deposit requires a credit line".into()));
        }
        self.post(transaction, std::slice::from_ref(&line)).await
    }

    async fn apply_withdrawal(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction> {
        if line.entry_type != EntryType::Debit {
            return Err(LedgerError::Internal("withdrawal requires a debit line".into()));
        }
        self.post(transaction, std::slice::from_ref(&line)).await
    }

    async fn apply_transfer(
        &self,
        transaction: Transaction,
        batch: JournalBatch,
    ) -> Result<PostedTransaction> {
        if !batch.is_balanced() {
            return Err(LedgerError::UnbalancedJournal(transaction.id.to_string()));
        }
        self.post(transaction, &batch.lines).await
    }

    async fn record_transaction(&self, transaction: Transaction) -> Result<PostedTransaction> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        Self::insert_transaction(&mut conn, &transaction).await?;
        Ok(PostedTransaction::new(transaction, Vec::new()))
    }

    async fn update_transaction_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let sql = format!(
            "UPDATE transactions SET status = $2, updated_at = now() WHERE transaction_id = $1 RETURNING {}",
            TRANSACTION_COLUMNS
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?
            .try_into()
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Transaction::try_from).transpose()
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE idempotency_key = $1",
            TRANSACTION_COLUMNS
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Transaction::try_from).transpose()
    }

    async fn entries_for_transaction(&self, id: &TransactionId) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE transaction_id = $1 ORDER BY seq",
            ENTRY_COLUMNS
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn entries_for_account(
        &self,
        id: AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE account_id = $1 \
             ORDER BY created_at DESC, seq DESC LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        let rows: Vec<EntryRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn totals_by_transaction(&self) -> Result<Vec<TransactionTotals>> {
        let rows: Vec<TotalsRow> = sqlx::query_as(
            "SELECT e.transaction_id, t.transaction_type, \
                    COALESCE(SUM(CASE WHEN e.entry_type = 'DEBIT' THEN e.amount END), 0) AS debits, \
                    COALESCE(SUM(CASE WHEN e.entry_type = 'CREDIT' THEN e.amount END), 0) AS credits \
             FROM ledger_entries e \
             JOIN transactions t ON t.transaction_id = e.transaction_id \
             GROUP BY e.transaction_id, t.transaction_type \
             ORDER BY e.transaction_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(TransactionTotals {
                    transaction_id: TransactionId::from_string(row.transaction_id),
                    transaction_type: decode_name(&row.transaction_type)?,
                    debits: row.debits,
                    credits: row.credits,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_names_match_storage() {
        assert_eq!(
            encode_name(&TransactionType::StablecoinTransfer).unwrap(),
            "STABLECOIN_TRANSFER"
        );
        assert_eq!(
            decode_name::<TransactionType>("CORRESPONDENT_SETTLEMENT").unwrap(),
            TransactionType::CorrespondentSettlement
        );
        assert!(decode_name::<TransactionType>("NOT_A_TYPE").is_err());
    }

    #[test]
    fn test_row_conversion_rejects_unknown_entry_type() {
        let row = EntryRow {
            id: Uuid::new_v4(),
            transaction_id: "00".repeat(16),
            account_id: Uuid::new_v4(),
            entry_type: "SIDEWAYS".into(),
            amount: Decimal::ONE,
            balance_after: Decimal::ONE,
            description: None,
            created_at: Utc::now(),
        };
        assert!(LedgerEntry::try_from(row).is_err());
    }
}
