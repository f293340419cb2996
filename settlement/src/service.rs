//! Correspondent bank registration and settlement batch aggregation.
//!
//! Transfers into a bank's settlement account are queued per bank in arrival
//! order. A batch takes every queued item for a bank once the pending total
//! reaches the bank's threshold (or when forced); each item joins exactly one
//! batch.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use closedloop_common::{
    AccountId, BankId, LedgerError, Result, TransactionId, TransactionStatus, UserId,
};
use closedloop_ledger::{AccountType, LedgerEngine, PostedTransaction, TransferRequest};

use crate::bank::{CorrespondentBank, NewCorrespondentBank, SettlementMethod};
use crate::batch::{BatchStatus, SettlementBatch};
use crate::store::{self, PendingSettlement, SettlementStore};

/// Sum queued amounts, failing instead of overflowing.
fn queued_total(items: &[PendingSettlement]) -> Result<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |total, item| {
        total.checked_add(item.amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "queued total overflows after {} items",
                items.len()
            ))
        })
    })
}

/// Service owning correspondent banks, their settlement queues and batches.
pub struct SettlementService {
    ledger: Arc<LedgerEngine>,
    /// Owner recorded on bank settlement accounts.
    operator: UserId,
    store: Arc<dyn SettlementStore>,
}

impl SettlementService {
    pub fn new(ledger: Arc<LedgerEngine>, operator: UserId, store: Arc<dyn SettlementStore>) -> Self {
        Self {
            ledger,
            operator,
            store,
        }
    }

    /// Service over a fresh in-memory settlement store.
    pub fn in_memory(ledger: Arc<LedgerEngine>, operator: UserId) -> Self {
        Self::new(ledger, operator, store::memory())
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn SettlementStore> {
        &self.store
    }

    /// Register a correspondent bank and open its institution settlement account.
    ///
    /// The request is validated before any account is opened.
    #[instrument(skip(self, request), fields(bank_code = %request.bank_code))]
    pub async fn register_bank(&self, request: NewCorrespondentBank) -> Result<CorrespondentBank> {
        // The placeholder account is replaced once the request has passed validation.
        let mut bank = CorrespondentBank::from_request(request, AccountId::new())?;
        if self.store.find_bank_by_code(&bank.bank_code).await?.is_some() {
            return Err(LedgerError::DuplicateBankCode(bank.bank_code));
        }

        let account = self
            .ledger
            .open_account(self.operator, AccountType::Institution, Decimal::ZERO)
            .await?;
        bank.settlement_account = account.id;

        if let Err(e) = self.store.insert_bank(&bank).await {
            // Lost a race for the code.
            self.ledger.deactivate_account(account.id).await?;
            return Err(e);
        }

        info!(
            bank_id = %bank.id,
            name = %bank.name,
            settlement_account = %account.account_number,
            "Correspondent bank registered"
        );
        Ok(bank)
    }

    pub async fn get_bank(&self, id: BankId) -> Result<CorrespondentBank> {
        self.store
            .get_bank(id)
            .await?
            .ok_or(LedgerError::BankNotFound(id))
    }

    pub async fn find_bank_by_code(&self, bank_code: &str) -> Result<Option<CorrespondentBank>> {
        let code = bank_code.trim().to_ascii_uppercase();
        self.store.find_bank_by_code(&code).await
    }

    /// All banks sorted by name.
    pub async fn list_banks(&self) -> Result<Vec<CorrespondentBank>> {
        self.store.list_banks().await
    }

    pub async fn set_bank_active(&self, id: BankId, active: bool) -> Result<CorrespondentBank> {
        let bank = self.store.set_bank_active(id, active).await?;
        info!(bank_id = %id, active, "Correspondent bank status changed");
        Ok(bank)
    }

    async fn active_bank(&self, id: BankId) -> Result<CorrespondentBank> {
        let bank = self.get_bank(id).await?;
        if !bank.is_active {
            return Err(LedgerError::Configuration(format!(
                "correspondent bank {} is inactive",
                bank.bank_code
            )));
        }
        Ok(bank)
    }

    /// Record a completed ledger transaction as awaiting settlement with an
    /// active bank.
    #[instrument(skip(self))]
    pub async fn queue_for_settlement(
        &self,
        bank_id: BankId,
        transaction_id: &TransactionId,
        amount: Decimal,
    ) -> Result<()> {
        let bank = self.active_bank(bank_id).await?;
        let currency = self.ledger.currency().clone();
        let amount = currency.quantize(amount);
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "settlement amount must be positive, got {}",
                amount
            )));
        }

        let transaction = self.ledger.get_transaction(transaction_id).await?;
        if transaction.status != TransactionStatus::Completed {
            return Err(LedgerError::transition(transaction.status, "SETTLEMENT_QUEUE"));
        }

        let item = PendingSettlement {
            transaction_id: transaction_id.clone(),
            amount,
            currency,
            queued_at: Utc::now(),
        };
        self.store.enqueue(bank.id, &item).await?;

        info!(bank_id = %bank.id, amount = %amount, "Queued for settlement");
        Ok(())
    }

    /// Transfer funds into a bank's settlement account and queue the transfer.
    #[instrument(skip(self))]
    pub async fn route_to_bank(
        &self,
        from: AccountId,
        bank_id: BankId,
        amount: Decimal,
        idempotency_key: Option<String>,
    ) -> Result<PostedTransaction> {
        let bank = self.active_bank(bank_id).await?;
        let mut request = TransferRequest::new(from, bank.settlement_account, amount)
            .with_description(format!("Settlement via {}", bank.name));
        request.idempotency_key = idempotency_key;

        let posted = self.ledger.transfer(request).await?;
        if !posted.replayed {
            self.queue_for_settlement(bank.id, &posted.transaction.id, posted.transaction.amount)
                .await?;
        }
        Ok(posted)
    }

    /// Cut a batch from every queued item for a bank, in FIFO order.
    ///
    /// Returns `Ok(None)` when nothing is queued, or when the queued total is
    /// below the bank's threshold and `force` is false.
    #[instrument(skip(self))]
    pub async fn build_batch(
        &self,
        bank_id: BankId,
        method: SettlementMethod,
        force: bool,
    ) -> Result<Option<SettlementBatch>> {
        let bank = self.active_bank(bank_id).await?;
        if !bank.supports(method) {
            return Err(LedgerError::Configuration(format!(
                "bank {} does not support {} settlement",
                bank.bank_code, method
            )));
        }

        let cut = |items: &[PendingSettlement]| -> Result<Option<SettlementBatch>> {
            let Some(first) = items.first() else {
                return Ok(None);
            };
            let total = queued_total(items)?;
            if total < bank.settlement_threshold && !force {
                return Ok(None);
            }
            let transactions = items.iter().map(|p| p.transaction_id.clone()).collect();
            SettlementBatch::new(&bank, total, first.currency.clone(), method, transactions)
                .map(Some)
        };

        let Some(batch) = self.store.cut_batch(bank.id, &cut).await? else {
            return Ok(None);
        };
        info!(
            batch_id = %batch.batch_id,
            bank_id = %bank.id,
            items = batch.transactions.len(),
            total = %batch.total_amount,
            fee = %batch.fee_amount,
            method = %method,
            "Settlement batch created"
        );
        Ok(Some(batch))
    }

    /// Create a batch for an explicit total with no queued items attached.
    #[instrument(skip(self))]
    pub async fn create_batch(
        &self,
        bank_id: BankId,
        total_amount: Decimal,
        method: SettlementMethod,
    ) -> Result<SettlementBatch> {
        let bank = self.active_bank(bank_id).await?;
        let batch = SettlementBatch::new(
            &bank,
            total_amount,
            self.ledger.currency().clone(),
            method,
            Vec::new(),
        )?;
        self.store.insert_batch(&batch).await?;
        info!(
            batch_id = %batch.batch_id,
            bank = %bank.name,
            total = %batch.total_amount,
            "Manual settlement batch created"
        );
        Ok(batch)
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<SettlementBatch> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::BatchNotFound(batch_id.to_string()))
    }

    async fn update_batch<F>(&self, batch_id: &str, apply: F) -> Result<SettlementBatch>
    where
        F: FnOnce(&mut SettlementBatch) -> Result<()>,
    {
        let current = self.get_batch(batch_id).await?;
        let mut updated = current.clone();
        apply(&mut updated)?;
        if !self.store.update_batch(&updated, current.status).await? {
            let now = self.get_batch(batch_id).await?;
            return Err(LedgerError::transition(now.status, updated.status));
        }
        Ok(updated)
    }

    /// Mark a batch as submitted to its rail.
    #[instrument(skip(self))]
    pub async fn start_batch(&self, batch_id: &str) -> Result<SettlementBatch> {
        let batch = self.update_batch(batch_id, |b| b.start()).await?;
        info!(batch_id, "Settlement batch processing");
        Ok(batch)
    }

    /// Mark a batch as completed by the external rail.
    #[instrument(skip(self))]
    pub async fn complete_batch(
        &self,
        batch_id: &str,
        external_reference: &str,
    ) -> Result<SettlementBatch> {
        let current = self.get_batch(batch_id).await?;
        let bank = self.get_bank(current.bank_id).await?;

        let batch = self
            .update_batch(batch_id, |b| {
                b.validate(bank.settlement_fee_percentage)?;
                b.complete(external_reference)
            })
            .await?;
        info!(batch_id, external_reference, "Completed settlement batch");
        Ok(batch)
    }

    #[instrument(skip(self))]
    pub async fn fail_batch(&self, batch_id: &str, reason: &str) -> Result<SettlementBatch> {
        let batch = self.update_batch(batch_id, |b| b.fail(reason)).await?;
        warn!(batch_id, reason, "Settlement batch failed");
        Ok(batch)
    }

    /// Build batches for every active bank that supports `method`.
    ///
    /// A failure for one bank is logged and does not stop the sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self, method: SettlementMethod) -> Result<Vec<SettlementBatch>> {
        let bank_ids: Vec<BankId> = self
            .store
            .list_banks()
            .await?
            .into_iter()
            .filter(|b| b.is_active && b.supports(method))
            .map(|b| b.id)
            .collect();

        let mut created = Vec::new();
        for bank_id in bank_ids {
            match self.build_batch(bank_id, method, false).await {
                Ok(Some(batch)) => created.push(batch),
                Ok(None) => {}
                Err(e) => warn!(bank_id = %bank_id, error = %e, "Settlement sweep failed for bank"),
            }
        }
        if !created.is_empty() {
            info!(batches = created.len(), "Settlement sweep created batches");
        }
        Ok(created)
    }

    /// Sum of queued, not yet batched amounts for a bank.
    pub async fn pending_total(&self, bank_id: BankId) -> Result<Decimal> {
        self.get_bank(bank_id).await?;
        queued_total(&self.store.pending(bank_id).await?)
    }

    /// Queued items for a bank, oldest first.
    pub async fn pending_items(&self, bank_id: BankId) -> Result<Vec<PendingSettlement>> {
        self.store.pending(bank_id).await
    }

    /// Batches for a bank, oldest first.
    pub async fn batches_for_bank(&self, bank_id: BankId) -> Result<Vec<SettlementBatch>> {
        self.store.batches_for_bank(bank_id).await
    }

    /// Batches currently in `status`.
    pub async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<SettlementBatch>> {
        self.store.batches_with_status(status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use closedloop_common::{Currency, Money, Transaction, TransactionType};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        service: SettlementService,
        operator: UserId,
        customer: AccountId,
        bank: CorrespondentBank,
    }

    async fn fixture(threshold: Decimal) -> Fixture {
        let ledger = Arc::new(LedgerEngine::in_memory());
        let customer = ledger
            .open_account(UserId::new(), AccountType::Business, dec!(100000))
            .await
            .unwrap();
        let operator = UserId::new();
        let service = SettlementService::in_memory(ledger, operator);
        let bank = service
            .register_bank(
                NewCorrespondentBank::new("Lagos Clearing", "LAGC")
                    .with_routing_number("021000021")
                    .with_swift_code("LAGCNGLA")
                    .with_threshold(threshold),
            )
            .await
            .unwrap();
        Fixture {
            service,
            operator,
            customer: customer.id,
            bank,
        }
    }

    #[tokio::test]
    async fn test_register_bank_opens_institution_account() {
        let f = fixture(dec!(10000)).await;
        let account = f.service.ledger().get_account(f.bank.settlement_account).await.unwrap();
        assert_eq!(account.account_type, AccountType::Institution);
        assert_eq!(account.balance, dec!(0));
        assert_eq!(account.owner, f.operator);
        assert!(f.bank.supports_ach && f.bank.supports_swift && !f.bank.supports_wire);

        let duplicate = f
            .service
            .register_bank(NewCorrespondentBank::new("Other", "lagc"))
            .await;
        assert!(matches!(duplicate, Err(LedgerError::DuplicateBankCode(_))));
        let found = f.service.find_bank_by_code("lagc").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(f.bank.id));
        assert_eq!(f.service.list_banks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_registration_opens_no_account() {
        let f = fixture(dec!(10000)).await;
        let before = f.service.ledger().accounts_for_owner(f.operator).await.unwrap().len();

        let bad_routing = f
            .service
            .register_bank(NewCorrespondentBank::new("Bad", "BAD").with_routing_number("123456789"))
            .await;
        assert!(matches!(bad_routing, Err(LedgerError::InvalidRoutingNumber(_))));

        let bad_fee = f
            .service
            .register_bank(NewCorrespondentBank::new("Greedy", "GRDY").with_fee_percentage(dec!(150)))
            .await;
        assert!(matches!(bad_fee, Err(LedgerError::InvalidAmount(_))));

        let duplicate = f
            .service
            .register_bank(NewCorrespondentBank::new("Copy", "LAGC"))
            .await;
        assert!(matches!(duplicate, Err(LedgerError::DuplicateBankCode(_))));

        let after = f.service.ledger().accounts_for_owner(f.operator).await.unwrap().len();
        assert_eq!(before, after);
        assert!(f.service.find_bank_by_code("BAD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_builds_nothing() {
        let f = fixture(dec!(10000)).await;
        f.service
            .route_to_bank(f.customer, f.bank.id, dec!(4000), None)
            .await
            .unwrap();

        assert_eq!(f.service.pending_total(f.bank.id).await.unwrap(), dec!(4000));
        let built = f.service.build_batch(f.bank.id, SettlementMethod::Ach, false).await;
        assert!(built.unwrap().is_none());
        assert_eq!(f.service.pending_items(f.bank.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_cuts_fifo_batch() {
        let f = fixture(dec!(10000)).await;
        let mut ids = Vec::new();
        for amount in [dec!(4000), dec!(3500), dec!(2500)] {
            let posted = f
                .service
                .route_to_bank(f.customer, f.bank.id, amount, None)
                .await
                .unwrap();
            ids.push(posted.transaction.id);
        }

        let batch = f
            .service
            .build_batch(f.bank.id, SettlementMethod::Ach, false)
            .await
            .unwrap()
            .expect("threshold reached");
        assert_eq!(batch.transactions, ids);
        assert_eq!(batch.total_amount, dec!(10000));
        assert_eq!(batch.fee_amount, dec!(50));
        assert_eq!(batch.net_amount, dec!(9950));
        assert_eq!(batch.status, BatchStatus::Pending);

        assert_eq!(f.service.pending_total(f.bank.id).await.unwrap(), dec!(0));
        let again = f.service.build_batch(f.bank.id, SettlementMethod::Ach, true).await;
        assert!(again.unwrap().is_none());
        assert_eq!(
            f.service.ledger().balance(f.bank.settlement_account).await.unwrap(),
            dec!(10000)
        );
    }

    #[tokio::test]
    async fn test_force_ignores_threshold() {
        let f = fixture(dec!(10000)).await;
        f.service
            .route_to_bank(f.customer, f.bank.id, dec!(12.5), None)
            .await
            .unwrap();
        let batch = f
            .service
            .build_batch(f.bank.id, SettlementMethod::Swift, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.total_amount, dec!(12.5));
        assert_eq!(batch.method, SettlementMethod::Swift);
    }

    #[tokio::test]
    async fn test_unsupported_method_rejected() {
        let f = fixture(dec!(0)).await;
        assert!(matches!(
            f.service.build_batch(f.bank.id, SettlementMethod::Wire, true).await,
            Err(LedgerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_rejects_duplicates_and_bad_amounts() {
        let f = fixture(dec!(10000)).await;
        let posted = f
            .service
            .route_to_bank(f.customer, f.bank.id, dec!(10), None)
            .await
            .unwrap();

        let again = f
            .service
            .queue_for_settlement(f.bank.id, &posted.transaction.id, dec!(10))
            .await;
        assert!(matches!(again, Err(LedgerError::DuplicateRequest(_))));

        let zero = f
            .service
            .queue_for_settlement(f.bank.id, &posted.transaction.id, dec!(0))
            .await;
        assert!(matches!(zero, Err(LedgerError::InvalidAmount(_))));

        let unknown = f
            .service
            .queue_for_settlement(f.bank.id, &TransactionId::generate(), dec!(5))
            .await;
        assert!(matches!(unknown, Err(LedgerError::TransactionNotFound(_))));

        let no_bank = f
            .service
            .queue_for_settlement(BankId::new(), &posted.transaction.id, dec!(5))
            .await;
        assert!(matches!(no_bank, Err(LedgerError::BankNotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_requires_completed_transaction() {
        let f = fixture(dec!(10000)).await;
        let incoming = Transaction::new(
            UserId::new(),
            Money::new(dec!(75), Currency::nvct()),
            TransactionType::SwiftTransfer,
            Some("awaiting confirmation".into()),
        );
        let recorded = f.service.ledger().record_transaction(incoming).await.unwrap();
        assert_eq!(recorded.transaction.status, TransactionStatus::Pending);

        let err = assert_err!(
            f.service
                .queue_for_settlement(f.bank.id, &recorded.transaction.id, dec!(75))
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert!(f.service.pending_items(f.bank.id).await.unwrap().is_empty());

        f.service
            .ledger()
            .update_transaction_status(&recorded.transaction.id, TransactionStatus::Completed)
            .await
            .unwrap();
        assert_ok!(
            f.service
                .queue_for_settlement(f.bank.id, &recorded.transaction.id, dec!(75))
                .await
        );
    }

    #[tokio::test]
    async fn test_inactive_bank_accepts_no_settlement_work() {
        let f = fixture(dec!(10000)).await;
        let posted = f
            .service
            .route_to_bank(f.customer, f.bank.id, dec!(10), None)
            .await
            .unwrap();
        let balance_before = f.service.ledger().balance(f.customer).await.unwrap();

        f.service.set_bank_active(f.bank.id, false).await.unwrap();

        let other = f
            .service
            .ledger()
            .transfer(TransferRequest::new(f.customer, f.bank.settlement_account, dec!(20)))
            .await
            .unwrap();
        let queued = f
            .service
            .queue_for_settlement(f.bank.id, &other.transaction.id, dec!(20))
            .await;
        assert!(matches!(queued, Err(LedgerError::Configuration(_))));

        let routed = f
            .service
            .route_to_bank(f.customer, f.bank.id, dec!(30), None)
            .await;
        assert!(matches!(routed, Err(LedgerError::Configuration(_))));
        assert_eq!(
            f.service.ledger().balance(f.customer).await.unwrap(),
            balance_before - dec!(20)
        );

        let items = f.service.pending_items(f.bank.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].transaction_id, posted.transaction.id);
    }

    #[tokio::test]
    async fn test_oversized_queue_fails_without_panicking() {
        let f = fixture(dec!(0)).await;
        for _ in 0..2 {
            let posted = f
                .service
                .ledger()
                .transfer(TransferRequest::new(f.customer, f.bank.settlement_account, dec!(1)))
                .await
                .unwrap();
            f.service
                .queue_for_settlement(f.bank.id, &posted.transaction.id, Decimal::MAX - dec!(1))
                .await
                .unwrap();
        }

        assert!(matches!(
            f.service.pending_total(f.bank.id).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            f.service.build_batch(f.bank.id, SettlementMethod::Ach, true).await,
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(f.service.pending_items(f.bank.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replayed_route_is_not_queued_twice() {
        let f = fixture(dec!(10000)).await;
        let key = Some("inv-9".to_string());
        let first = f
            .service
            .route_to_bank(f.customer, f.bank.id, dec!(25), key.clone())
            .await
            .unwrap();
        let second = f
            .service
            .route_to_bank(f.customer, f.bank.id, dec!(25), key)
            .await
            .unwrap();
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(f.service.pending_items(f.bank.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let f = fixture(dec!(10000)).await;
        let batch = f
            .service
            .create_batch(f.bank.id, dec!(2000), SettlementMethod::Ach)
            .await
            .unwrap();
        assert_eq!(batch.fee_amount, dec!(10));
        assert!(batch.transactions.is_empty());

        assert!(f.service.complete_batch(&batch.batch_id, "ACH-77").await.is_err());
        assert_ok!(f.service.start_batch(&batch.batch_id).await);
        let done = f.service.complete_batch(&batch.batch_id, "ACH-77").await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.external_reference.as_deref(), Some("ACH-77"));
        assert!(f.service.fail_batch(&batch.batch_id, "late").await.is_err());

        assert_eq!(f.service.batches_for_bank(f.bank.id).await.unwrap().len(), 1);
        let completed = f.service.batches_with_status(BatchStatus::Completed).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert!(matches!(
            f.service.get_batch("SETTLE-0000000000000000").await,
            Err(LedgerError::BatchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_skips_inactive_banks() {
        let f = fixture(dec!(100)).await;
        f.service
            .route_to_bank(f.customer, f.bank.id, dec!(150), None)
            .await
            .unwrap();

        f.service.set_bank_active(f.bank.id, false).await.unwrap();
        assert!(f.service.sweep(SettlementMethod::Ach).await.unwrap().is_empty());

        f.service.set_bank_active(f.bank.id, true).await.unwrap();
        let created = f.service.sweep(SettlementMethod::Ach).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].total_amount, dec!(150));
        assert!(f.service.sweep(SettlementMethod::Ach).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_a_new_service_on_the_same_store() {
        let f = fixture(dec!(10000)).await;
        f.service
            .route_to_bank(f.customer, f.bank.id, dec!(40), None)
            .await
            .unwrap();

        let restarted = SettlementService::new(
            Arc::clone(f.service.ledger()),
            f.operator,
            Arc::clone(f.service.store()),
        );
        assert_eq!(restarted.get_bank(f.bank.id).await.unwrap().bank_code, "LAGC");
        assert_eq!(restarted.pending_total(f.bank.id).await.unwrap(), dec!(40));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds_batch_each_item_once() {
        let f = fixture(dec!(0)).await;
        for _ in 0..20 {
            f.service
                .route_to_bank(f.customer, f.bank.id, dec!(5), None)
                .await
                .unwrap();
        }

        let service = Arc::new(f.service);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                let bank_id = f.bank.id;
                tokio::spawn(async move {
                    service.build_batch(bank_id, SettlementMethod::Ach, true).await
                })
            })
            .collect();

        let batches: Vec<SettlementBatch> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].transactions.len(), 20);
        assert_eq!(batches[0].total_amount, dec!(100));
    }
}
