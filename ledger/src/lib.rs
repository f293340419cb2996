//! Closed-loop Ledger Engine
//!
//! Double-entry ledger for stablecoin accounts. Every transfer writes one
//! transaction and a balanced pair of debit and credit entries, atomically.

pub mod account;
pub mod engine;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod store;

pub use account::{AccountType, StablecoinAccount};
pub use engine::{HistoryItem, LedgerEngine, TransferRequest};
pub use journal::{EntryType, JournalBatch, JournalLine, LedgerEntry};
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, PostedTransaction, TransactionTotals};
