//! Postgres settlement store.
//!
//! Shares its pool with the ledger store. Institution seeding relies on
//! `ON CONFLICT (swift_lookup_key) DO NOTHING`, so concurrent or repeated
//! seeds never create duplicates. Cutting a batch locks the bank row first,
//! then claims its open queue rows inside the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use closedloop_common::{
    AccountId, BankId, Currency, InstitutionId, LedgerError, Result, SwiftCode, TransactionId,
};

use crate::bank::{CorrespondentBank, SettlementMethod};
use crate::batch::{BatchStatus, SettlementBatch};
use crate::institution::{FinancialInstitution, InstitutionType, UpsertOutcome};
use crate::store::{BatchCutter, PendingSettlement, SettlementStore};

const INSTITUTION_COLUMNS: &str = "id, name, institution_type, swift_code, ach_routing_number, \
     country, rtgs_system, rtgs_enabled, s2s_enabled, is_active, created_at";

const BANK_COLUMNS: &str = "id, name, bank_code, swift_code, ach_routing_number, \
     clearing_account_number, settlement_account, settlement_threshold, settlement_fee_percentage, \
     supports_ach, supports_swift, supports_wire, is_active, created_at, updated_at";

const BATCH_COLUMNS: &str = "batch_id, bank_id, total_amount, fee_amount, net_amount, currency, \
     status, method, external_reference, failure_reason, transactions, created_at, updated_at, \
     completed_at";

const QUEUE_COLUMNS: &str = "seq, transaction_id, amount, currency, queued_at";

fn db_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(sqlx::FromRow)]
struct InstitutionRow {
    id: Uuid,
    name: String,
    institution_type: String,
    swift_code: String,
    ach_routing_number: Option<String>,
    country: String,
    rtgs_system: Option<String>,
    rtgs_enabled: bool,
    s2s_enabled: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<InstitutionRow> for FinancialInstitution {
    type Error = LedgerError;

    fn try_from(row: InstitutionRow) -> Result<Self> {
        let institution_type = InstitutionType::parse(&row.institution_type).ok_or_else(|| {
            LedgerError::Internal(format!("unknown institution type {:?}", row.institution_type))
        })?;
        Ok(Self {
            id: InstitutionId::from_uuid(row.id),
            name: row.name,
            institution_type,
            swift_code: SwiftCode::parse(&row.swift_code)?,
            ach_routing_number: row.ach_routing_number,
            country: row.country,
            rtgs_system: row.rtgs_system,
            rtgs_enabled: row.rtgs_enabled,
            s2s_enabled: row.s2s_enabled,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BankRow {
    id: Uuid,
    name: String,
    bank_code: String,
    swift_code: Option<String>,
    ach_routing_number: Option<String>,
    clearing_account_number: Option<String>,
    settlement_account: Uuid,
    settlement_threshold: Decimal,
    settlement_fee_percentage: Decimal,
    supports_ach: bool,
    supports_swift: bool,
    supports_wire: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BankRow> for CorrespondentBank {
    type Error = LedgerError;

    fn try_from(row: BankRow) -> Result<Self> {
        Ok(Self {
            id: BankId::from_uuid(row.id),
            name: row.name,
            bank_code: row.bank_code,
            swift_code: row.swift_code.as_deref().map(SwiftCode::parse).transpose()?,
            ach_routing_number: row.ach_routing_number,
            clearing_account_number: row.clearing_account_number,
            settlement_account: AccountId::from_uuid(row.settlement_account),
            settlement_threshold: row.settlement_threshold,
            settlement_fee_percentage: row.settlement_fee_percentage,
            supports_ach: row.supports_ach,
            supports_swift: row.supports_swift,
            supports_wire: row.supports_wire,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    batch_id: String,
    bank_id: Uuid,
    total_amount: Decimal,
    fee_amount: Decimal,
    net_amount: Decimal,
    currency: String,
    status: String,
    method: String,
    external_reference: Option<String>,
    failure_reason: Option<String>,
    transactions: Json<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for SettlementBatch {
    type Error = LedgerError;

    fn try_from(row: BatchRow) -> Result<Self> {
        let status = BatchStatus::parse(&row.status)
            .ok_or_else(|| LedgerError::Internal(format!("unknown batch status {:?}", row.status)))?;
        let method: SettlementMethod = row.method.parse()?;
        Ok(Self {
            batch_id: row.batch_id,
            bank_id: BankId::from_uuid(row.bank_id),
            total_amount: row.total_amount,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            currency: Currency::new(row.currency),
            status,
            method,
            external_reference: row.external_reference,
            failure_reason: row.failure_reason,
            transactions: row
                .transactions
                .0
                .into_iter()
                .map(TransactionId::from_string)
                .collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    transaction_id: String,
    amount: Decimal,
    currency: String,
    queued_at: DateTime<Utc>,
}

impl From<QueueRow> for PendingSettlement {
    fn from(row: QueueRow) -> Self {
        Self {
            transaction_id: TransactionId::from_string(row.transaction_id),
            amount: row.amount,
            currency: Currency::new(row.currency),
            queued_at: row.queued_at,
        }
    }
}

/// Settlement store backed by Postgres.
#[derive(Clone)]
pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the settlement schema migrations.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        info!("Settlement migrations applied");
        Ok(())
    }

    async fn insert_batch_on(conn: &mut PgConnection, batch: &SettlementBatch) -> Result<()> {
        let sql = format!(
            "INSERT INTO settlement_batches ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            BATCH_COLUMNS
        );
        let transactions: Vec<String> = batch
            .transactions
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        let result = sqlx::query(&sql)
            .bind(&batch.batch_id)
            .bind(*batch.bank_id.as_uuid())
            .bind(batch.total_amount)
            .bind(batch.fee_amount)
            .bind(batch.net_amount)
            .bind(batch.currency.code())
            .bind(batch.status.as_str())
            .bind(batch.method.as_str())
            .bind(batch.external_reference.as_deref())
            .bind(batch.failure_reason.as_deref())
            .bind(Json(transactions))
            .bind(batch.created_at)
            .bind(batch.updated_at)
            .bind(batch.completed_at)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::DuplicateRequest(batch.batch_id.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn fetch_batches(&self, filter: &str, bind: BatchFilter) -> Result<Vec<SettlementBatch>> {
        let sql = format!(
            "SELECT {} FROM settlement_batches WHERE {} ORDER BY created_at, batch_id",
            BATCH_COLUMNS, filter
        );
        let query = sqlx::query_as::<_, BatchRow>(&sql);
        let query = match bind {
            BatchFilter::Bank(id) => query.bind(*id.as_uuid()),
            BatchFilter::Status(status) => query.bind(status.as_str()),
        };
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(SettlementBatch::try_from).collect()
    }
}

enum BatchFilter {
    Bank(BankId),
    Status(BatchStatus),
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    async fn insert_institution(&self, institution: &FinancialInstitution) -> Result<UpsertOutcome> {
        let sql = format!(
            "INSERT INTO financial_institutions ({}, swift_lookup_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (swift_lookup_key) DO NOTHING \
             RETURNING {}",
            INSTITUTION_COLUMNS, INSTITUTION_COLUMNS
        );
        let inserted: Option<InstitutionRow> = sqlx::query_as(&sql)
            .bind(*institution.id.as_uuid())
            .bind(&institution.name)
            .bind(institution.institution_type.as_str())
            .bind(institution.swift_code.as_str())
            .bind(institution.ach_routing_number.as_deref())
            .bind(&institution.country)
            .bind(institution.rtgs_system.as_deref())
            .bind(institution.rtgs_enabled)
            .bind(institution.s2s_enabled)
            .bind(institution.is_active)
            .bind(institution.created_at)
            .bind(institution.swift_code.lookup_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        if let Some(row) = inserted {
            return Ok(UpsertOutcome::Created(row.try_into()?));
        }
        let existing = self
            .get_institution(institution.swift_code.lookup_key())
            .await?
            .ok_or_else(|| {
                LedgerError::Internal(format!(
                    "institution {} conflicted but could not be read back",
                    institution.swift_code
                ))
            })?;
        Ok(UpsertOutcome::Skipped(existing))
    }

    async fn get_institution(&self, lookup_key: &str) -> Result<Option<FinancialInstitution>> {
        let sql = format!(
            "SELECT {} FROM financial_institutions WHERE swift_lookup_key = $1",
            INSTITUTION_COLUMNS
        );
        let row: Option<InstitutionRow> = sqlx::query_as(&sql)
            .bind(lookup_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(FinancialInstitution::try_from).transpose()
    }

    async fn get_institution_by_id(&self, id: InstitutionId) -> Result<Option<FinancialInstitution>> {
        let sql = format!("SELECT {} FROM financial_institutions WHERE id = $1", INSTITUTION_COLUMNS);
        let row: Option<InstitutionRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(FinancialInstitution::try_from).transpose()
    }

    async fn set_institution_active(
        &self,
        lookup_key: &str,
        active: bool,
    ) -> Result<Option<FinancialInstitution>> {
        let sql = format!(
            "UPDATE financial_institutions SET is_active = $2 WHERE swift_lookup_key = $1 RETURNING {}",
            INSTITUTION_COLUMNS
        );
        let row: Option<InstitutionRow> = sqlx::query_as(&sql)
            .bind(lookup_key)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(FinancialInstitution::try_from).transpose()
    }

    async fn list_institutions(&self) -> Result<Vec<FinancialInstitution>> {
        let sql = format!(
            "SELECT {} FROM financial_institutions ORDER BY name",
            INSTITUTION_COLUMNS
        );
        let rows: Vec<InstitutionRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(FinancialInstitution::try_from).collect()
    }

    async fn insert_bank(&self, bank: &CorrespondentBank) -> Result<()> {
        let sql = format!(
            "INSERT INTO correspondent_banks ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            BANK_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(*bank.id.as_uuid())
            .bind(&bank.name)
            .bind(&bank.bank_code)
            .bind(bank.swift_code.as_ref().map(|c| c.as_str()))
            .bind(bank.ach_routing_number.as_deref())
            .bind(bank.clearing_account_number.as_deref())
            .bind(*bank.settlement_account.as_uuid())
            .bind(bank.settlement_threshold)
            .bind(bank.settlement_fee_percentage)
            .bind(bank.supports_ach)
            .bind(bank.supports_swift)
            .bind(bank.supports_wire)
            .bind(bank.is_active)
            .bind(bank.created_at)
            .bind(bank.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::DuplicateBankCode(bank.bank_code.clone()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_bank(&self, id: BankId) -> Result<Option<CorrespondentBank>> {
        let sql = format!("SELECT {} FROM correspondent_banks WHERE id = $1", BANK_COLUMNS);
        let row: Option<BankRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(CorrespondentBank::try_from).transpose()
    }

    async fn find_bank_by_code(&self, bank_code: &str) -> Result<Option<CorrespondentBank>> {
        let sql = format!("SELECT {} FROM correspondent_banks WHERE bank_code = $1", BANK_COLUMNS);
        let row: Option<BankRow> = sqlx::query_as(&sql)
            .bind(bank_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(CorrespondentBank::try_from).transpose()
    }

    async fn list_banks(&self) -> Result<Vec<CorrespondentBank>> {
        let sql = format!("SELECT {} FROM correspondent_banks ORDER BY name", BANK_COLUMNS);
        let rows: Vec<BankRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(CorrespondentBank::try_from).collect()
    }

    async fn set_bank_active(&self, id: BankId, active: bool) -> Result<CorrespondentBank> {
        let sql = format!(
            "UPDATE correspondent_banks SET is_active = $2, updated_at = now() WHERE id = $1 RETURNING {}",
            BANK_COLUMNS
        );
        let row: Option<BankRow> = sqlx::query_as(&sql)
            .bind(*id.as_uuid())
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.ok_or(LedgerError::BankNotFound(id))?.try_into()
    }

    async fn enqueue(&self, bank_id: BankId, item: &PendingSettlement) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO settlement_queue (transaction_id, bank_id, amount, currency, queued_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(item.transaction_id.as_str())
        .bind(*bank_id.as_uuid())
        .bind(item.amount)
        .bind(item.currency.code())
        .bind(item.queued_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::DuplicateRequest(item.transaction_id.to_string()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn pending(&self, bank_id: BankId) -> Result<Vec<PendingSettlement>> {
        let sql = format!(
            "SELECT {} FROM settlement_queue WHERE bank_id = $1 AND batch_id IS NULL ORDER BY seq",
            QUEUE_COLUMNS
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(*bank_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(PendingSettlement::from).collect())
    }

    #[instrument(skip(self, cut))]
    async fn cut_batch(
        &self,
        bank_id: BankId,
        cut: &BatchCutter<'_>,
    ) -> Result<Option<SettlementBatch>> {
        let mut dbtx: sqlx::Transaction<'_, Postgres> = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT id FROM correspondent_banks WHERE id = $1 FOR UPDATE")
            .bind(*bank_id.as_uuid())
            .execute(&mut *dbtx)
            .await
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {} FROM settlement_queue WHERE bank_id = $1 AND batch_id IS NULL \
             ORDER BY seq FOR UPDATE",
            QUEUE_COLUMNS
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(*bank_id.as_uuid())
            .fetch_all(&mut *dbtx)
            .await
            .map_err(db_err)?;
        let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
        let items: Vec<PendingSettlement> = rows.into_iter().map(PendingSettlement::from).collect();

        // Dropping the transaction without commit releases the locks.
        let Some(batch) = cut(&items)? else {
            return Ok(None);
        };

        Self::insert_batch_on(&mut dbtx, &batch).await?;
        sqlx::query("UPDATE settlement_queue SET batch_id = $1 WHERE seq = ANY($2)")
            .bind(&batch.batch_id)
            .bind(&seqs)
            .execute(&mut *dbtx)
            .await
            .map_err(db_err)?;

        dbtx.commit().await.map_err(db_err)?;
        debug!(items = seqs.len(), batch_id = %batch.batch_id, "Batch committed");
        Ok(Some(batch))
    }

    async fn insert_batch(&self, batch: &SettlementBatch) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        Self::insert_batch_on(&mut conn, batch).await
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<SettlementBatch>> {
        let sql = format!("SELECT {} FROM settlement_batches WHERE batch_id = $1", BATCH_COLUMNS);
        let row: Option<BatchRow> = sqlx::query_as(&sql)
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(SettlementBatch::try_from).transpose()
    }

    async fn update_batch(&self, batch: &SettlementBatch, expected: BatchStatus) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE settlement_batches \
             SET status = $2, external_reference = $3, failure_reason = $4, \
                 updated_at = $5, completed_at = $6 \
             WHERE batch_id = $1 AND status = $7",
        )
        .bind(&batch.batch_id)
        .bind(batch.status.as_str())
        .bind(batch.external_reference.as_deref())
        .bind(batch.failure_reason.as_deref())
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if affected == 0 && self.get_batch(&batch.batch_id).await?.is_none() {
            return Err(LedgerError::BatchNotFound(batch.batch_id.clone()));
        }
        Ok(affected == 1)
    }

    async fn batches_for_bank(&self, bank_id: BankId) -> Result<Vec<SettlementBatch>> {
        self.fetch_batches("bank_id = $1", BatchFilter::Bank(bank_id)).await
    }

    async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<SettlementBatch>> {
        self.fetch_batches("status = $1", BatchFilter::Status(status)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_row(status: &str, method: &str) -> BatchRow {
        BatchRow {
            batch_id: "SETTLE-00000000000000AA".into(),
            bank_id: Uuid::new_v4(),
            total_amount: Decimal::ONE_HUNDRED,
            fee_amount: Decimal::ZERO,
            net_amount: Decimal::ONE_HUNDRED,
            currency: "NVCT".into(),
            status: status.into(),
            method: method.into(),
            external_reference: None,
            failure_reason: None,
            transactions: Json(vec!["ab".repeat(16)]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_batch_row_conversion() {
        let batch = SettlementBatch::try_from(batch_row("PROCESSING", "WIRE")).unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
        assert_eq!(batch.method, SettlementMethod::Wire);
        assert_eq!(batch.transactions.len(), 1);

        assert!(SettlementBatch::try_from(batch_row("LOST", "WIRE")).is_err());
        assert!(SettlementBatch::try_from(batch_row("PENDING", "PIGEON")).is_err());
    }

    #[test]
    fn test_institution_row_rejects_bad_code() {
        let row = InstitutionRow {
            id: Uuid::new_v4(),
            name: "Broken".into(),
            institution_type: "bank".into(),
            swift_code: "NOPE".into(),
            ach_routing_number: None,
            country: "Nowhere".into(),
            rtgs_system: None,
            rtgs_enabled: false,
            s2s_enabled: false,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(matches!(
            FinancialInstitution::try_from(row),
            Err(LedgerError::InvalidSwiftCode(_))
        ));
    }
}
