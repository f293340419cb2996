//! Core ledger engine implementation.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use closedloop_common::{
    AccountId, Counterparty, Currency, LedgerError, Money, Result, Transaction, TransactionId,
    TransactionStatus, TransactionType, UserId,
};

use crate::account::{AccountType, StablecoinAccount};
use crate::journal::{JournalBatch, JournalLine, LedgerEntry};
use crate::store::{self, LedgerStore, PostedTransaction};

/// Request to move funds between two ledger accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Decimal,
    pub description: Option<String>,
    /// Repeating a key returns the transaction recorded for it the first time.
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Decimal) -> Self {
        Self {
            from,
            to,
            amount,
            description: None,
            idempotency_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// One line of an account statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub entry: LedgerEntry,
    pub transaction: Transaction,
}

/// The ledger engine manages double-entry bookkeeping for stablecoin accounts.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    /// Currency of newly opened accounts.
    currency: Currency,
}

impl LedgerEngine {
    /// Create a new ledger engine on top of `store`.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            currency: Currency::nvct(),
        }
    }

    /// Engine backed by the in-memory store.
    pub fn in_memory() -> Self {
        Self::new(store::memory())
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Currency new accounts are opened in.
    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// Round to the currency's precision and require a strictly positive result.
    fn positive_amount(currency: &Currency, amount: Decimal) -> Result<Decimal> {
        let amount = currency.quantize(amount);
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        Ok(amount)
    }

    /// Load an account or fail with `AccountNotFound`.
    pub async fn get_account(&self, id: AccountId) -> Result<StablecoinAccount> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    async fn active_account(&self, id: AccountId) -> Result<StablecoinAccount> {
        let account = self.get_account(id).await?;
        if !account.can_transact() {
            return Err(LedgerError::AccountInactive(id));
        }
        Ok(account)
    }

    /// Open a new account. A positive initial balance is booked as a deposit.
    #[instrument(skip(self))]
    pub async fn open_account(
        &self,
        owner: UserId,
        account_type: AccountType,
        initial_balance: Decimal,
    ) -> Result<StablecoinAccount> {
        let initial_balance = self.currency.quantize(initial_balance);
        if initial_balance < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "initial balance cannot be negative, got {}",
                initial_balance
            )));
        }

        let account = StablecoinAccount::new(owner, account_type, self.currency.clone());
        self.store.insert_account(&account).await?;

        info!(
            account = %account.account_number,
            owner = %owner,
            account_type = account_type.as_str(),
            "Opened stablecoin account"
        );

        if initial_balance > Decimal::ZERO {
            self.deposit(account.id, initial_balance, Some("Initial deposit".to_string()))
                .await?;
            return self.get_account(account.id).await;
        }
        Ok(account)
    }

    /// Credit an account from outside the closed loop.
    #[instrument(skip(self))]
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<PostedTransaction> {
        let account = self.active_account(account_id).await?;
        let amount = Self::positive_amount(&account.currency, amount)?;

        let description =
            description.unwrap_or_else(|| format!("Deposit to {}", account.account_number));
        let transaction = Transaction::new(
            account.owner,
            Money::new(amount, account.currency.clone()),
            TransactionType::Deposit,
            Some(description.clone()),
        )
        .with_status(TransactionStatus::Completed)
        .with_counterparty(Counterparty::ledger_account(account.account_number.as_str()));

        let line =
            JournalLine::credit(account.id, amount, account.currency.clone()).with_description(description);
        let posted = self.store.apply_deposit(transaction, line).await?;

        info!(
            account = %account.account_number,
            amount = %amount,
            transaction_id = %posted.transaction.id,
            "Deposit recorded"
        );
        Ok(posted)
    }

    /// Debit an account to outside the closed loop.
    #[instrument(skip(self))]
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Decimal,
        description: Option<String>,
    ) -> Result<PostedTransaction> {
        let account = self.active_account(account_id).await?;
        let amount = Self::positive_amount(&account.currency, amount)?;
        if !account.can_cover(amount) {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: account.balance,
            });
        }

        let description =
            description.unwrap_or_else(|| format!("Withdrawal from {}", account.account_number));
        let transaction = Transaction::new(
            account.owner,
            Money::new(amount, account.currency.clone()),
            TransactionType::Withdrawal,
            Some(description.clone()),
        )
        .with_status(TransactionStatus::Completed);

        let line =
            JournalLine::debit(account.id, amount, account.currency.clone()).with_description(description);
        let posted = self.store.apply_withdrawal(transaction, line).await?;

        info!(
            account = %account.account_number,
            amount = %amount,
            transaction_id = %posted.transaction.id,
            "Withdrawal recorded"
        );
        Ok(posted)
    }

    /// Return the transaction already recorded for `key`, with its entries.
    async fn replay(&self, key: &str) -> Result<Option<PostedTransaction>> {
        let Some(transaction) = self.store.find_transaction_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        let entries = self.store.entries_for_transaction(&transaction.id).await?;
        info!(
            idempotency_key = key,
            transaction_id = %transaction.id,
            "Replaying transfer for repeated idempotency key"
        );
        Ok(Some(PostedTransaction {
            transaction,
            entries,
            replayed: true,
        }))
    }

    /// Move funds between two accounts.
    ///
    /// Writes one completed `StablecoinTransfer` transaction and exactly two
    /// entries, a debit on the source and a credit on the destination. The
    /// debit is re-checked against the balance at write time, so concurrent
    /// transfers can never overdraw the source.
    #[instrument(skip(self, request), fields(from = %request.from, to = %request.to, amount = %request.amount))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<PostedTransaction> {
        if let Some(key) = &request.idempotency_key {
            if let Some(posted) = self.replay(key).await? {
                return Ok(posted);
            }
        }

        if request.from == request.to {
            return Err(LedgerError::SameAccount(request.from));
        }

        let source = self.active_account(request.from).await?;
        let destination = self.active_account(request.to).await?;
        if source.currency != destination.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: source.currency.clone(),
                actual: destination.currency.clone(),
            });
        }

        let amount = Self::positive_amount(&source.currency, request.amount)?;
        if !source.can_cover(amount) {
            warn!(
                account = %source.account_number,
                amount = %amount,
                available = %source.balance,
                "Transfer rejected: insufficient funds"
            );
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: source.balance,
            });
        }

        let debit_description = format!("Transfer to {}", destination.account_number);
        let credit_description = format!("Transfer from {}", source.account_number);

        let transaction = Transaction::new(
            source.owner,
            Money::new(amount, source.currency.clone()),
            TransactionType::StablecoinTransfer,
            Some(
                request
                    .description
                    .clone()
                    .unwrap_or_else(|| debit_description.clone()),
            ),
        )
        .with_status(TransactionStatus::Completed)
        .with_counterparty(Counterparty::ledger_account(destination.account_number.as_str()))
        .with_idempotency_key(request.idempotency_key.clone());

        let mut batch = JournalBatch::new();
        batch.add_line(
            JournalLine::debit(source.id, amount, source.currency.clone())
                .with_description(debit_description),
        );
        batch.add_line(
            JournalLine::credit(destination.id, amount, destination.currency.clone())
                .with_description(credit_description),
        );
        if !batch.is_balanced() {
            return Err(LedgerError::UnbalancedJournal(transaction.id.to_string()));
        }

        let posted = match self.store.apply_transfer(transaction, batch).await {
            Ok(posted) => posted,
            Err(LedgerError::DuplicateRequest(key))
                if request.idempotency_key.as_deref() == Some(key.as_str()) =>
            {
                // Lost a race with a transfer carrying the same key.
                let existing = self.replay(&key).await?;
                return existing.ok_or(LedgerError::DuplicateRequest(key));
            }
            Err(e) => {
                if matches!(e, LedgerError::InsufficientFunds { .. }) {
                    warn!(
                        account = %source.account_number,
                        amount = %amount,
                        "Transfer rejected at write time: insufficient funds"
                    );
                }
                return Err(e);
            }
        };

        info!(
            transaction_id = %posted.transaction.id,
            from = %source.account_number,
            to = %destination.account_number,
            amount = %amount,
            currency = %source.currency,
            "Completed stablecoin transfer"
        );
        Ok(posted)
    }

    /// Accounts held by `owner`, oldest first.
    pub async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<StablecoinAccount>> {
        self.store.accounts_for_owner(owner).await
    }

    /// Current balance of an account.
    pub async fn balance(&self, account_id: AccountId) -> Result<Decimal> {
        Ok(self.get_account(account_id).await?.balance)
    }

    /// Entries for an account paired with their transactions, newest first.
    pub async fn account_history(
        &self,
        account_id: AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryItem>> {
        self.get_account(account_id).await?;
        let entries = self
            .store
            .entries_for_account(account_id, limit, offset)
            .await?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(transaction) = self.store.get_transaction(&entry.transaction_id).await? {
                items.push(HistoryItem { entry, transaction });
            }
        }
        Ok(items)
    }

    /// Record an externally originated transaction without moving balances.
    ///
    /// A repeated idempotency key returns the transaction recorded first.
    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.id))]
    pub async fn record_transaction(&self, transaction: Transaction) -> Result<PostedTransaction> {
        if let Some(key) = &transaction.idempotency_key {
            if let Some(posted) = self.replay(key).await? {
                return Ok(posted);
            }
        }
        let key = transaction.idempotency_key.clone();
        match self.store.record_transaction(transaction).await {
            Ok(posted) => {
                info!(
                    transaction_id = %posted.transaction.id,
                    status = posted.transaction.status.as_str(),
                    "Recorded external transaction"
                );
                Ok(posted)
            }
            Err(LedgerError::DuplicateRequest(dup)) if key.as_deref() == Some(dup.as_str()) => {
                let existing = self.replay(&dup).await?;
                existing.ok_or(LedgerError::DuplicateRequest(dup))
            }
            Err(e) => Err(e),
        }
    }

    /// Move a transaction to `status`.
    ///
    /// A final status can only be repeated, never changed.
    #[instrument(skip(self))]
    pub async fn update_transaction_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let current = self.get_transaction(id).await?;
        if current.status == status {
            return Ok(current);
        }
        if current.status.is_final() {
            return Err(LedgerError::transition(current.status, status));
        }
        let updated = self.store.update_transaction_status(id, status).await?;
        info!(
            transaction_id = %id,
            from = current.status.as_str(),
            to = status.as_str(),
            "Transaction status updated"
        );
        Ok(updated)
    }

    pub async fn get_transaction(&self, id: &TransactionId) -> Result<Transaction> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))
    }

    /// Entries recorded for one transaction.
    pub async fn transaction_entries(&self, id: &TransactionId) -> Result<Vec<LedgerEntry>> {
        self.store.entries_for_transaction(id).await
    }

    /// Verify ledger integrity: every transfer's debits equal its credits.
    ///
    /// Returns the ids of unbalanced transactions; empty means the ledger is sound.
    #[instrument(skip(self))]
    pub async fn verify_integrity(&self) -> Result<Vec<TransactionId>> {
        let totals = self.store.totals_by_transaction().await?;
        let checked = totals
            .iter()
            .filter(|t| t.transaction_type.is_ledger_transfer())
            .count();

        let unbalanced: Vec<TransactionId> = totals
            .into_iter()
            .filter(|t| t.transaction_type.is_ledger_transfer() && !t.is_balanced())
            .map(|t| t.transaction_id)
            .collect();

        if unbalanced.is_empty() {
            info!(transfers = checked, "Ledger integrity verified");
        } else {
            warn!(
                transfers = checked,
                unbalanced = unbalanced.len(),
                "Ledger integrity check found unbalanced transfers"
            );
        }
        Ok(unbalanced)
    }

    #[instrument(skip(self))]
    pub async fn deactivate_account(&self, account_id: AccountId) -> Result<StablecoinAccount> {
        let account = self.store.set_account_active(account_id, false).await?;
        info!(account = %account.account_number, "Account deactivated");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn activate_account(&self, account_id: AccountId) -> Result<StablecoinAccount> {
        let account = self.store.set_account_active(account_id, true).await?;
        info!(account = %account.account_number, "Account activated");
        Ok(account)
    }
}

impl Default for LedgerEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::EntryType;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    async fn funded(engine: &LedgerEngine, balance: Decimal) -> StablecoinAccount {
        engine
            .open_account(UserId::new(), AccountType::Individual, balance)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_account_books_initial_deposit() {
        let engine = LedgerEngine::in_memory();
        let account = funded(&engine, dec!(250)).await;

        assert_eq!(account.balance, dec!(250));
        let history = engine.account_history(account.id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry.entry_type, EntryType::Credit);
        assert_eq!(history[0].transaction.transaction_type, TransactionType::Deposit);

        let empty = funded(&engine, dec!(0)).await;
        assert!(engine.account_history(empty.id, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accounts_for_owner() {
        let engine = LedgerEngine::in_memory();
        let owner = UserId::new();
        let first = engine
            .open_account(owner, AccountType::Individual, dec!(1))
            .await
            .unwrap();
        let second = engine
            .open_account(owner, AccountType::Business, dec!(0))
            .await
            .unwrap();
        funded(&engine, dec!(5)).await;

        let ids: Vec<_> = engine
            .accounts_for_owner(owner)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&second.id));
        assert!(engine.accounts_for_owner(UserId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_account_rejects_negative_balance() {
        let engine = LedgerEngine::in_memory();
        let result = engine
            .open_account(UserId::new(), AccountType::Business, dec!(-1))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_transfer_writes_two_balanced_entries() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(5)).await;

        let posted = assert_ok!(
            engine
                .transfer(TransferRequest::new(a.id, b.id, dec!(30.25)).with_description("rent"))
                .await
        );

        let tx = &posted.transaction;
        assert_eq!(tx.transaction_type, TransactionType::StablecoinTransfer);
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.amount, dec!(30.25));
        assert_eq!(tx.user_id, a.owner);
        assert_eq!(tx.description.as_deref(), Some("rent"));
        assert_eq!(
            tx.counterparty.as_ref().map(|c| c.name.clone()),
            Some(format!("Account: {}", b.account_number))
        );

        let entries = engine.transaction_entries(&tx.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        let debit = entries.iter().find(|e| e.entry_type == EntryType::Debit).unwrap();
        let credit = entries.iter().find(|e| e.entry_type == EntryType::Credit).unwrap();
        assert_eq!(debit.account_id, a.id);
        assert_eq!(debit.amount, dec!(30.25));
        assert_eq!(debit.balance_after, dec!(69.75));
        assert_eq!(credit.account_id, b.id);
        assert_eq!(credit.amount, dec!(30.25));
        assert_eq!(credit.balance_after, dec!(35.25));

        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(69.75));
        assert_eq!(engine.balance(b.id).await.unwrap(), dec!(35.25));
        assert!(engine.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_past_decimal_range_is_rejected() {
        let engine = LedgerEngine::in_memory();
        let account = funded(&engine, Decimal::MAX - dec!(10)).await;

        let result = engine.deposit(account.id, dec!(20), None).await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        assert_eq!(engine.balance(account.id).await.unwrap(), Decimal::MAX - dec!(10));
        assert!(engine.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_transaction_moves_no_balances() {
        let engine = LedgerEngine::in_memory();
        let account = funded(&engine, dec!(50)).await;

        let incoming = Transaction::new(
            account.owner,
            Money::new(dec!(900), Currency::nvct()),
            TransactionType::SwiftTransfer,
            Some("incoming wire".into()),
        )
        .with_idempotency_key(Some("swift:REF-1".into()));
        let posted = engine.record_transaction(incoming.clone()).await.unwrap();
        assert!(!posted.replayed);
        assert!(posted.entries.is_empty());
        assert_eq!(posted.transaction.status, TransactionStatus::Pending);
        assert_eq!(engine.balance(account.id).await.unwrap(), dec!(50));

        let mut again = incoming;
        again.id = TransactionId::generate();
        let replayed = engine.record_transaction(again).await.unwrap();
        assert!(replayed.replayed);
        assert_eq!(replayed.transaction.id, posted.transaction.id);
    }

    #[tokio::test]
    async fn test_status_updates_stop_at_final_states() {
        let engine = LedgerEngine::in_memory();
        let tx = Transaction::new(
            UserId::new(),
            Money::new(dec!(10), Currency::nvct()),
            TransactionType::SwiftTransfer,
            None,
        );
        let id = engine.record_transaction(tx).await.unwrap().transaction.id;

        let processing = engine
            .update_transaction_status(&id, TransactionStatus::Processing)
            .await
            .unwrap();
        assert_eq!(processing.status, TransactionStatus::Processing);

        let completed = assert_ok!(
            engine
                .update_transaction_status(&id, TransactionStatus::Completed)
                .await
        );
        assert_eq!(completed.status, TransactionStatus::Completed);
        assert_eq!(engine.get_transaction(&id).await.unwrap().status, TransactionStatus::Completed);

        assert_ok!(
            engine
                .update_transaction_status(&id, TransactionStatus::Completed)
                .await
        );
        let err = assert_err!(
            engine
                .update_transaction_status(&id, TransactionStatus::Failed)
                .await
        );
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let missing = engine
            .update_transaction_status(&TransactionId::generate(), TransactionStatus::Failed)
            .await;
        assert!(matches!(missing, Err(LedgerError::TransactionNotFound(_))));
    }

    #[tokio::test]
    async fn test_transfer_rounds_to_cents() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(10)).await;
        let b = funded(&engine, dec!(0)).await;

        let posted = engine
            .transfer(TransferRequest::new(a.id, b.id, dec!(1.005)))
            .await
            .unwrap();
        assert_eq!(posted.transaction.amount, dec!(1.00));

        let rounded_away = engine
            .transfer(TransferRequest::new(a.id, b.id, dec!(0.004)))
            .await;
        assert!(matches!(rounded_away, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_transfer_rejections_leave_balances_unchanged() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        let zero = assert_err!(engine.transfer(TransferRequest::new(a.id, b.id, dec!(0))).await);
        assert_eq!(zero.error_code(), "INVALID_AMOUNT");

        let negative = assert_err!(engine.transfer(TransferRequest::new(a.id, b.id, dec!(-5))).await);
        assert_eq!(negative.error_code(), "INVALID_AMOUNT");

        let too_much =
            assert_err!(engine.transfer(TransferRequest::new(a.id, b.id, dec!(100.01))).await);
        assert!(matches!(
            too_much,
            LedgerError::InsufficientFunds { required, available }
                if required == dec!(100.01) && available == dec!(100)
        ));

        let same = assert_err!(engine.transfer(TransferRequest::new(a.id, a.id, dec!(1))).await);
        assert!(matches!(same, LedgerError::SameAccount(_)));

        let missing =
            assert_err!(engine.transfer(TransferRequest::new(a.id, AccountId::new(), dec!(1))).await);
        assert!(matches!(missing, LedgerError::AccountNotFound(_)));

        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(100));
        assert_eq!(engine.balance(b.id).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_inactive_accounts_reject_movements() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        engine.deactivate_account(b.id).await.unwrap();
        let result = engine.transfer(TransferRequest::new(a.id, b.id, dec!(10))).await;
        assert!(matches!(result, Err(LedgerError::AccountInactive(id)) if id == b.id));
        assert!(engine.deposit(b.id, dec!(1), None).await.is_err());

        engine.deactivate_account(a.id).await.unwrap();
        assert!(matches!(
            engine.withdraw(a.id, dec!(1), None).await,
            Err(LedgerError::AccountInactive(_))
        ));

        engine.activate_account(a.id).await.unwrap();
        engine.activate_account(b.id).await.unwrap();
        assert_ok!(engine.transfer(TransferRequest::new(a.id, b.id, dec!(10))).await);
    }

    #[tokio::test]
    async fn test_currency_mismatch() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let usd = StablecoinAccount::new(UserId::new(), AccountType::Partner, Currency::usd());
        engine.store().insert_account(&usd).await.unwrap();

        let result = engine.transfer(TransferRequest::new(a.id, usd.id, dec!(10))).await;
        assert!(matches!(result, Err(LedgerError::CurrencyMismatch { .. })));
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_withdraw_and_deposit() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(50)).await;

        let posted = engine.withdraw(a.id, dec!(20), None).await.unwrap();
        assert_eq!(posted.transaction.transaction_type, TransactionType::Withdrawal);
        assert_eq!(posted.entries[0].balance_after, dec!(30));

        assert!(matches!(
            engine.withdraw(a.id, dec!(31), None).await,
            Err(LedgerError::InsufficientFunds { .. })
        ));

        engine.deposit(a.id, dec!(0.5), Some("top up".into())).await.unwrap();
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(30.5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfers_cannot_overdraw() {
        let engine = Arc::new(LedgerEngine::in_memory());
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.transfer(TransferRequest::new(a.id, b.id, dec!(80))).await
                })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(insufficient, 1);
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(20));
        assert_eq!(engine.balance(b.id).await.unwrap(), dec!(80));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_transfers_never_go_negative() {
        let engine = Arc::new(LedgerEngine::in_memory());
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.transfer(TransferRequest::new(a.id, b.id, dec!(7))).await
                })
            })
            .collect();

        let successes = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|joined| matches!(joined, Ok(Ok(_))))
            .count();

        // 14 * 7 = 98
        assert_eq!(successes, 14);
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(2));
        assert!(engine.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_transfer_replays_first_result() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        let request = TransferRequest::new(a.id, b.id, dec!(40)).with_idempotency_key("order-17");
        let first = engine.transfer(request.clone()).await.unwrap();
        let second = engine.transfer(request).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.transaction.id, second.transaction.id);
        assert_eq!(second.entries.len(), 2);
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(60));
        assert_eq!(engine.balance(b.id).await.unwrap(), dec!(40));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_idempotent_transfers_move_funds_once() {
        let engine = Arc::new(LedgerEngine::in_memory());
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let request =
                    TransferRequest::new(a.id, b.id, dec!(10)).with_idempotency_key("payroll-1");
                tokio::spawn(async move { engine.transfer(request).await })
            })
            .collect();

        let ids: Vec<TransactionId> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().transaction.id)
            .collect();

        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(engine.balance(a.id).await.unwrap(), dec!(90));
    }

    #[tokio::test]
    async fn test_history_pagination_newest_first() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(100)).await;
        let b = funded(&engine, dec!(0)).await;

        for amount in [dec!(1), dec!(2), dec!(3)] {
            engine
                .transfer(TransferRequest::new(a.id, b.id, amount))
                .await
                .unwrap();
        }

        let page = engine.account_history(a.id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].entry.amount, dec!(3));
        assert_eq!(page[0].entry.balance_after, dec!(94));
        assert_eq!(page[1].entry.amount, dec!(2));

        let tail = engine.account_history(a.id, 10, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].transaction.transaction_type, TransactionType::Deposit);

        assert!(matches!(
            engine.account_history(AccountId::new(), 10, 0).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_number() {
        let engine = LedgerEngine::in_memory();
        let a = funded(&engine, dec!(1)).await;
        let found = engine
            .store()
            .find_account_by_number(&a.account_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_transfers_conserve_supply(
            ops in prop::collection::vec((0usize..3, 0usize..3, 1i64..20_000), 1..40)
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let engine = LedgerEngine::in_memory();
                let mut ids = Vec::new();
                for _ in 0..3 {
                    ids.push(funded(&engine, dec!(100)).await.id);
                }

                for (from, to, cents) in ops {
                    let amount = Decimal::new(cents, 2);
                    let before_from = engine.balance(ids[from]).await.unwrap();
                    let result = engine
                        .transfer(TransferRequest::new(ids[from], ids[to], amount))
                        .await;
                    match result {
                        Ok(posted) => {
                            assert_ne!(from, to);
                            assert!(amount <= before_from);
                            assert_eq!(posted.entries.len(), 2);
                        }
                        Err(LedgerError::SameAccount(_)) => assert_eq!(from, to),
                        Err(LedgerError::InsufficientFunds { .. }) => assert!(amount > before_from),
                        Err(other) => panic!("unexpected error: {}", other),
                    }
                }

                let mut total = Decimal::ZERO;
                for id in &ids {
                    let balance = engine.balance(*id).await.unwrap();
                    assert!(balance >= Decimal::ZERO);
                    total += balance;
                }
                assert_eq!(total, dec!(300));
                assert!(engine.verify_integrity().await.unwrap().is_empty());
            });
        }
    }
}
