//! Error types for ledger and settlement operations.

use crate::{AccountId, BankId, Currency};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for ledger and settlement operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Amount is zero, negative or otherwise unusable.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Insufficient funds.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account exists but is deactivated.
    #[error("Account inactive: {0}")]
    AccountInactive(AccountId),

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Source and destination are the same account.
    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(AccountId),

    /// Duplicate request (idempotency key or reference already used).
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Correspondent bank not found: {0}")]
    BankNotFound(BankId),

    /// A correspondent bank with this bank code already exists.
    #[error("Bank code already registered: {0}")]
    DuplicateBankCode(String),

    #[error("Settlement batch not found: {0}")]
    BatchNotFound(String),

    /// Invalid state transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Settlement batch amounts disagree with the bank's fee schedule.
    #[error("Inconsistent batch {batch_id}: {reason}")]
    InconsistentBatch { batch_id: String, reason: String },

    #[error("Institution not found: {0}")]
    InstitutionNotFound(String),

    #[error("Invalid SWIFT code: {0}")]
    InvalidSwiftCode(String),

    /// ABA routing number failed the length or checksum test.
    #[error("Invalid routing number: {0}")]
    InvalidRoutingNumber(String),

    /// Double-entry invariant violated.
    #[error("Unbalanced journal for transaction {0}")]
    UnbalancedJournal(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }

    /// Get error code for API responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountInactive(_) => "ACCOUNT_INACTIVE",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::SameAccount(_) => "SAME_ACCOUNT",
            LedgerError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::BankNotFound(_) => "BANK_NOT_FOUND",
            LedgerError::DuplicateBankCode(_) => "DUPLICATE_BANK_CODE",
            LedgerError::BatchNotFound(_) => "BATCH_NOT_FOUND",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::InconsistentBatch { .. } => "INCONSISTENT_BATCH",
            LedgerError::InstitutionNotFound(_) => "INSTITUTION_NOT_FOUND",
            LedgerError::InvalidSwiftCode(_) => "INVALID_SWIFT_CODE",
            LedgerError::InvalidRoutingNumber(_) => "INVALID_ROUTING_NUMBER",
            LedgerError::UnbalancedJournal(_) => "UNBALANCED_JOURNAL",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Build an `InvalidTransition` from any two debuggable states.
    pub fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        LedgerError::InvalidTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = LedgerError::InsufficientFunds {
            required: Decimal::from(80),
            available: Decimal::from(20),
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert_eq!(err.to_string(), "Insufficient funds: required 80, available 20");
        assert!(!err.is_retryable());
        assert!(LedgerError::Database("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_transition_helper() {
        #[derive(Debug)]
        enum S {
            Pending,
            Completed,
        }
        let err = LedgerError::transition(S::Completed, S::Pending);
        assert_eq!(err.to_string(), "Invalid transition from Completed to Pending");
    }
}
