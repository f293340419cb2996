//! In-memory ledger store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use closedloop_common::{
    AccountId, AccountNumber, LedgerError, Result, Transaction, TransactionId, TransactionStatus,
    UserId,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::account::StablecoinAccount;
use crate::journal::{EntryType, JournalBatch, JournalLine, LedgerEntry};
use crate::store::{LedgerStore, PostedTransaction, TransactionTotals};

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, StablecoinAccount>,
    numbers: HashMap<AccountNumber, AccountId>,
    transactions: HashMap<TransactionId, Transaction>,
    idempotency: HashMap<String, TransactionId>,
    /// Append-only, in application order.
    entries: Vec<LedgerEntry>,
}

/// Ledger store holding all state behind a single mutex.
///
/// Each mutating call validates and applies inside one critical section, so
/// two debits against the same account can never both observe the old balance.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn post(&self, transaction: Transaction, lines: &[JournalLine]) -> Result<PostedTransaction> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(key) = &transaction.idempotency_key {
            if state.idempotency.contains_key(key) {
                return Err(LedgerError::DuplicateRequest(key.clone()));
            }
        }
        if state.transactions.contains_key(&transaction.id) {
            return Err(LedgerError::DuplicateRequest(transaction.id.to_string()));
        }

        // Validate every line against running balances before touching anything.
        let mut running: HashMap<AccountId, Decimal> = HashMap::new();
        let mut balances_after = Vec::with_capacity(lines.len());
        for line in lines {
            let account = state
                .accounts
                .get(&line.account_id)
                .ok_or_else(|| LedgerError::AccountNotFound(line.account_id.to_string()))?;
            if !account.is_active {
                return Err(LedgerError::AccountInactive(account.id));
            }
            if account.currency != line.currency {
                return Err(LedgerError::CurrencyMismatch {
                    expected: account.currency.clone(),
                    actual: line.currency.clone(),
                });
            }

            let current = running
                .get(&line.account_id)
                .copied()
                .unwrap_or(account.balance);
            let next = match line.entry_type {
                EntryType::Debit => {
                    if current < line.amount {
                        return Err(LedgerError::InsufficientFunds {
                            required: line.amount,
                            available: current,
                        });
                    }
                    current - line.amount
                }
                EntryType::Credit => current.checked_add(line.amount).ok_or_else(|| {
                    LedgerError::InvalidAmount(format!(
                        "crediting {} to account {} would overflow its balance",
                        line.amount, line.account_id
                    ))
                })?,
            };
            running.insert(line.account_id, next);
            balances_after.push(next);
        }

        let now = Utc::now();
        let mut entries = Vec::with_capacity(lines.len());
        for (line, balance_after) in lines.iter().zip(balances_after) {
            if let Some(account) = state.accounts.get_mut(&line.account_id) {
                account.balance = balance_after;
                account.updated_at = now;
            }
            entries.push(LedgerEntry::from_line(&transaction.id, line, balance_after));
        }

        state.entries.extend(entries.iter().cloned());
        if let Some(key) = &transaction.idempotency_key {
            state.idempotency.insert(key.clone(), transaction.id.clone());
        }
        state
            .transactions
            .insert(transaction.id.clone(), transaction.clone());

        Ok(PostedTransaction::new(transaction, entries))
    }
}

fn expect_entry_type(line: &JournalLine, expected: EntryType) -> Result<()> {
    if line.entry_type != expected {
        return Err(LedgerError::Internal(format!(
            "expected a {} line, got {}",
            expected.as_str(),
            line.entry_type.as_str()
        )));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_account(&self, account: &StablecoinAccount) -> Result<()> {
        let mut state = self.state.lock();
        if state.numbers.contains_key(&account.account_number)
            || state.accounts.contains_key(&account.id)
        {
            return Err(LedgerError::DuplicateRequest(
                account.account_number.to_string(),
            ));
        }
        state
            .numbers
            .insert(account.account_number.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<StablecoinAccount>> {
        Ok(self.state.lock().accounts.get(&id).cloned())
    }

    async fn find_account_by_number(
        &self,
        number: &AccountNumber,
    ) -> Result<Option<StablecoinAccount>> {
        let state = self.state.lock();
        Ok(state
            .numbers
            .get(number)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn accounts_for_owner(&self, owner: UserId) -> Result<Vec<StablecoinAccount>> {
        let mut accounts: Vec<_> = self
            .state
            .lock()
            .accounts
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<StablecoinAccount> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
        account.is_active = active;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn apply_deposit(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction> {
        expect_entry_type(&line, EntryType::Credit)?;
        self.post(transaction, std::slice::from_ref(&line))
    }

    async fn apply_withdrawal(
        &self,
        transaction: Transaction,
        line: JournalLine,
    ) -> Result<PostedTransaction> {
        expect_entry_type(&line, EntryType::Debit)?;
        self.post(transaction, std::slice::from_ref(&line))
    }

    async fn apply_transfer(
        &self,
        transaction: Transaction,
        batch: JournalBatch,
    ) -> Result<PostedTransaction> {
        if !batch.is_balanced() {
            return Err(LedgerError::UnbalancedJournal(transaction.id.to_string()));
        }
        self.post(transaction, &batch.lines)
    }

    async fn record_transaction(&self, transaction: Transaction) -> Result<PostedTransaction> {
        self.post(transaction, &[])
    }

    async fn update_transaction_status(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut state = self.state.lock();
        let transaction = state
            .transactions
            .get_mut(id)
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?;
        transaction.status = status;
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        Ok(self.state.lock().transactions.get(id).cloned())
    }

    async fn find_transaction_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let state = self.state.lock();
        Ok(state
            .idempotency
            .get(key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn entries_for_transaction(&self, id: &TransactionId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| &e.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn entries_for_account(
        &self,
        id: AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn totals_by_transaction(&self) -> Result<Vec<TransactionTotals>> {
        let state = self.state.lock();
        let mut sums: BTreeMap<&TransactionId, (Decimal, Decimal)> = BTreeMap::new();
        for entry in &state.entries {
            let sum = sums
                .entry(&entry.transaction_id)
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            match entry.entry_type {
                EntryType::Debit => sum.0 += entry.amount,
                EntryType::Credit => sum.1 += entry.amount,
            }
        }

        let mut totals = Vec::with_capacity(sums.len());
        for (id, (debits, credits)) in sums {
            let transaction = state
                .transactions
                .get(id)
                .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))?;
            totals.push(TransactionTotals {
                transaction_id: id.clone(),
                transaction_type: transaction.transaction_type,
                debits,
                credits,
            });
        }
        Ok(totals)
    }
}
