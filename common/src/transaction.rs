//! Generic transaction records shared by every money movement.

use crate::{Currency, Money, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
    Cancelled,
    Rejected,
    /// Accepted for execution at a future date.
    Scheduled,
}

impl TransactionStatus {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Refunded
                | TransactionStatus::Cancelled
                | TransactionStatus::Rejected
        )
    }

    /// Stable upper-case name, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Refunded => "REFUNDED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Scheduled => "SCHEDULED",
        }
    }

    /// Parse a stored status name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TransactionStatus::Pending,
            "PROCESSING" => TransactionStatus::Processing,
            "COMPLETED" => TransactionStatus::Completed,
            "FAILED" => TransactionStatus::Failed,
            "REFUNDED" => TransactionStatus::Refunded,
            "CANCELLED" => TransactionStatus::Cancelled,
            "REJECTED" => TransactionStatus::Rejected,
            "SCHEDULED" => TransactionStatus::Scheduled,
            _ => return None,
        };
        Some(status)
    }
}

/// Payment rail / purpose of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    Payment,
    Payout,
    Settlement,
    PaymentSettlement,
    /// MT760 standby letter of credit.
    SwiftLetterOfCredit,
    /// MT103 customer credit transfer.
    SwiftFundTransfer,
    /// MT202 institution transfer.
    SwiftInstitutionTransfer,
    /// MT799 free format.
    SwiftFreeFormat,
    SwiftTransfer,
    SwiftGpiPayment,
    SwiftGpiNotification,
    InternationalWire,
    RtgsTransfer,
    ServerToServer,
    OffLedgerTransfer,
    TokenExchange,
    EdiPayment,
    EdiAchTransfer,
    EdiWireTransfer,
    PosPayment,
    TreasuryTransfer,
    TreasuryInvestment,
    TreasuryLoan,
    TreasuryDebtRepayment,
    SalaryPayment,
    BillPayment,
    ContractPayment,
    BulkPayroll,
    StablecoinTransfer,
    P2pLedgerTransfer,
    CorrespondentSettlement,
    CryptoPayment,
    CryptoTransfer,
    CryptoExchange,
}

impl TransactionType {
    /// Whether this transaction moves funds between two closed-loop ledger accounts.
    pub fn is_ledger_transfer(&self) -> bool {
        matches!(
            self,
            TransactionType::StablecoinTransfer | TransactionType::P2pLedgerTransfer
        )
    }

    /// Whether this transaction travels over a SWIFT rail.
    pub fn is_swift(&self) -> bool {
        matches!(
            self,
            TransactionType::SwiftLetterOfCredit
                | TransactionType::SwiftFundTransfer
                | TransactionType::SwiftInstitutionTransfer
                | TransactionType::SwiftFreeFormat
                | TransactionType::SwiftTransfer
                | TransactionType::SwiftGpiPayment
                | TransactionType::SwiftGpiNotification
        )
    }
}

/// The other side of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    /// Party name.
    pub name: String,
    /// Account number or IBAN at the receiving institution.
    pub account: Option<String>,
    /// Receiving institution name.
    pub institution: Option<String>,
    /// Receiving institution BIC.
    pub bank_swift: Option<String>,
    pub address: Option<String>,
    pub country: Option<String>,
}

impl Counterparty {
    /// Counterparty identified only by a ledger account number.
    pub fn ledger_account(account_number: impl Into<String>) -> Self {
        let account_number = account_number.into();
        Self {
            name: format!("Account: {}", account_number),
            account: Some(account_number),
            ..Self::default()
        }
    }

    /// Counterparty at another institution.
    pub fn at_institution(
        name: impl Into<String>,
        account: Option<String>,
        bank_swift: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            account,
            bank_swift,
            ..Self::default()
        }
    }
}

/// A generic money movement record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Public transaction reference.
    pub id: TransactionId,
    /// User that initiated the movement.
    pub user_id: UserId,
    /// Amount moved.
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub description: Option<String>,
    pub counterparty: Option<Counterparty>,
    /// Reference assigned by an external system (gateway, SWIFT, telex).
    pub external_id: Option<String>,
    /// Caller-supplied key for duplicate detection.
    pub idempotency_key: Option<String>,
    /// Free-form integration metadata.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a pending transaction.
    pub fn new(
        user_id: UserId,
        amount: Money,
        transaction_type: TransactionType,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(),
            user_id,
            amount: amount.value,
            currency: amount.currency,
            transaction_type,
            status: TransactionStatus::Pending,
            description,
            counterparty: None,
            external_id: None,
            idempotency_key: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_counterparty(mut self, counterparty: Counterparty) -> Self {
        self.counterparty = Some(counterparty);
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The amount as `Money`.
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency.clone())
    }

    /// Update the status, refusing to leave a final state.
    pub fn set_status(&mut self, status: TransactionStatus) -> bool {
        if self.status.is_final() && self.status != status {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_names() {
        assert_eq!(TransactionStatus::parse("completed"), Some(TransactionStatus::Completed));
        assert_eq!(TransactionStatus::Completed.as_str(), "COMPLETED");
        assert_eq!(TransactionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_final_states() {
        assert!(TransactionStatus::Completed.is_final());
        assert!(TransactionStatus::Rejected.is_final());
        assert!(!TransactionStatus::Pending.is_final());
        assert!(!TransactionStatus::Scheduled.is_final());
    }

    #[test]
    fn test_final_status_is_sticky() {
        let mut tx = Transaction::new(
            UserId::new(),
            Money::new(Decimal::from(10), Currency::nvct()),
            TransactionType::Payment,
            None,
        );
        assert!(tx.set_status(TransactionStatus::Completed));
        assert!(!tx.set_status(TransactionStatus::Failed));
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[test]
    fn test_type_serializes_screaming() {
        let json = serde_json::to_string(&TransactionType::StablecoinTransfer).unwrap();
        assert_eq!(json, "\"STABLECOIN_TRANSFER\"");
    }

    #[test]
    fn test_ledger_counterparty() {
        let cp = Counterparty::ledger_account("NVCT-0123456789AB");
        assert_eq!(cp.name, "Account: NVCT-0123456789AB");
        assert_eq!(cp.account.as_deref(), Some("NVCT-0123456789AB"));
    }
}
