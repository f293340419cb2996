//! Ledger entry types for double-entry bookkeeping.

use std::collections::HashMap;

use closedloop_common::{AccountId, Currency, EntryId, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Type of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// Funds leave the account.
    Debit,
    /// Funds arrive in the account.
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "DEBIT",
            EntryType::Credit => "CREDIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEBIT" => Some(EntryType::Debit),
            "CREDIT" => Some(EntryType::Credit),
            _ => None,
        }
    }
}

/// A single recorded balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Transaction this entry belongs to.
    pub transaction_id: TransactionId,
    /// Account affected.
    pub account_id: AccountId,
    pub entry_type: EntryType,
    /// Always positive.
    pub amount: Decimal,
    /// Account balance immediately after this entry was applied.
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Materialize a journal line once its resulting balance is known.
    pub fn from_line(transaction_id: &TransactionId, line: &JournalLine, balance_after: Decimal) -> Self {
        Self {
            id: EntryId::new(),
            transaction_id: transaction_id.clone(),
            account_id: line.account_id,
            entry_type: line.entry_type,
            amount: line.amount,
            balance_after,
            description: line.description.clone(),
            created_at: Utc::now(),
        }
    }

    /// Signed effect on the account balance.
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            EntryType::Debit => -self.amount,
            EntryType::Credit => self.amount,
        }
    }
}

/// A pending entry, not yet applied to any balance.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalLine {
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: Decimal,
    /// Currency the line is denominated in; must match the account.
    pub currency: Currency,
    pub description: Option<String>,
}

impl JournalLine {
    /// Create a debit line.
    pub fn debit(account_id: AccountId, amount: Decimal, currency: Currency) -> Self {
        Self {
            account_id,
            entry_type: EntryType::Debit,
            amount,
            currency,
            description: None,
        }
    }

    /// Create a credit line.
    pub fn credit(account_id: AccountId, amount: Decimal, currency: Currency) -> Self {
        Self {
            account_id,
            entry_type: EntryType::Credit,
            amount,
            currency,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A set of journal lines that must be committed together.
#[derive(Debug, Clone, Default)]
pub struct JournalBatch {
    /// Lines in application order.
    pub lines: Vec<JournalLine>,
}

impl JournalBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a line to the batch.
    pub fn add_line(&mut self, line: JournalLine) {
        self.lines.push(line);
    }

    /// Verify the batch is balanced (debits == credits per currency).
    pub fn is_balanced(&self) -> bool {
        let mut balances: HashMap<&str, Decimal> = HashMap::new();

        for line in &self.lines {
            let amount = match line.entry_type {
                EntryType::Debit => line.amount,
                EntryType::Credit => -line.amount,
            };
            *balances.entry(line.currency.code()).or_insert(Decimal::ZERO) += amount;
        }

        balances.values().all(|balance| balance.is_zero())
    }

    /// Get total debits.
    pub fn total_debits(&self) -> Decimal {
        self.total(EntryType::Debit)
    }

    /// Get total credits.
    pub fn total_credits(&self) -> Decimal {
        self.total(EntryType::Credit)
    }

    fn total(&self, entry_type: EntryType) -> Decimal {
        self.lines
            .iter()
            .filter(|l| l.entry_type == entry_type)
            .map(|l| l.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_batch() {
        let mut batch = JournalBatch::new();
        batch.add_line(JournalLine::debit(AccountId::new(), Decimal::from(1000), Currency::nvct()));
        batch.add_line(JournalLine::credit(AccountId::new(), Decimal::from(1000), Currency::nvct()));

        assert!(batch.is_balanced());
        assert_eq!(batch.total_debits(), Decimal::from(1000));
        assert_eq!(batch.total_credits(), Decimal::from(1000));
    }

    #[test]
    fn test_unbalanced_batch() {
        let mut batch = JournalBatch::new();
        batch.add_line(JournalLine::debit(AccountId::new(), Decimal::from(1000), Currency::nvct()));
        assert!(!batch.is_balanced());
    }

    #[test]
    fn test_balance_is_per_currency() {
        let mut batch = JournalBatch::new();
        batch.add_line(JournalLine::debit(AccountId::new(), Decimal::from(5), Currency::nvct()));
        batch.add_line(JournalLine::credit(AccountId::new(), Decimal::from(5), Currency::usd()));
        assert!(!batch.is_balanced());
    }

    #[test]
    fn test_signed_amount() {
        let tx = TransactionId::generate();
        let line = JournalLine::debit(AccountId::new(), Decimal::from(7), Currency::nvct());
        let entry = LedgerEntry::from_line(&tx, &line, Decimal::from(3));
        assert_eq!(entry.signed_amount(), Decimal::from(-7));
        assert_eq!(entry.balance_after, Decimal::from(3));
        assert_eq!(entry.transaction_id, tx);
    }
}
