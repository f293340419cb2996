//! Persistence seam for ledger state.
//!
//! Every mutating operation is atomic: either the transaction row, all of
//! its entries and every balance change are stored, or nothing is.

use std::sync::Arc;

use async_trait::async_trait;
use closedloop_common::{
    AccountId, AccountNumber, Result, Transaction, TransactionId, TransactionStatus,
    TransactionType, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::StablecoinAccount;
use crate::journal::{JournalBatch, JournalLine, LedgerEntry};
use crate::memory::MemoryLedgerStore;

/// A transaction together with the entries it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostedTransaction {
    pub transaction: Transaction,
    pub entries: Vec<LedgerEntry>,
    /// True when an earlier transaction was returned for a repeated idempotency key.
    pub replayed: bool,
}

impl PostedTransaction {
    pub fn new(transaction: Transaction, entries: Vec<LedgerEntry>) -> Self {
        Self {
            transaction,
            entries,
            replayed: false,
        }
    }
}

/// Debit and credit sums recorded for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTotals {
    pub transaction_id: TransactionId,
    pub transaction_type: TransactionType,
    pub debits: Decimal,
    pub credits: Decimal,
}

impl TransactionTotals {
    pub fn is_balanced(&self) -> bool {
        self.debits == self.credits
    }
}

/// Storage backend for accounts, transactions and ledger entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store a new account. Fails with `DuplicateRequest` if the account number is taken.
    async fn insert_account(&self, account: &StablecoinAccount) -> Result<()>;

    async fn get_account(&self, id: AccountId) -> Result<Option<StablecoinAccount>>;

    async fn find_account_by_number(
        &self,
        number: &AccountNumber,
    ) -> Result<Option<StablecoinAccount>>;

    /// Accounts held by one owner, oldest first.
    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<StablecoinAccount>>;

    /// Activate or deactivate an account, returning the updated record.
    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<StablecoinAccount>;

    /// Credit one account and record `transaction`.
    async fn apply_deposit(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction>;

    /// Debit one account and record `transaction`.
    ///
    /// The debit only applies if the balance covers it at the moment of the write.
    async fn apply_withdrawal(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction>;

    /// Apply every line of `batch` and record `transaction`, all or nothing.
    ///
    /// Fails with `DuplicateRequest` when the transaction's idempotency key was
    /// already used.
    async fn apply_transfer(
        &self,
        transaction: Transaction,
        batch: JournalBatch,
    ) -> Result<PostedTransaction>;

    /// Record a transaction that moves no balances, such as an incoming wire
    /// awaiting confirmation from the sending bank.
    ///
    /// Fails with `DuplicateRequest` when the idempotency key was already used.
    async fn record_transaction(&self, transaction: Transaction) -> Result<PostedTransaction>;

    /// Overwrite a transaction's status, returning the updated record.
    async fn update_transaction_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction>;

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>>;

    async fn find_transaction_by_idempotency_key(&self, key: &str)
        -> Result<Option<Transaction>>;

    /// Entries of one transaction in the order they were applied.
    async fn entries_for_transaction(&self, id: &TransactionId) -> Result<Vec<LedgerEntry>>;

    /// Entries touching one account, newest first.
    async fn entries_for_account(
        &self,
        id: AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Debit and credit sums per transaction, for integrity checks.
    async fn totals_by_transaction(&self) -> Result<Vec<TransactionTotals>>;
}

/// In-process store, used when no database is configured and in tests.
pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::new())
}
