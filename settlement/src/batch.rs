//! Settlement batches submitted to correspondent banks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use closedloop_common::{random_hex, BankId, Currency, LedgerError, Result, TransactionId};

use crate::bank::{CorrespondentBank, SettlementMethod};

/// Settlement batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Created, not yet handed to the external rail.
    Pending,
    /// Submitted to the external rail.
    Processing,
    /// Confirmed by the external rail.
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    /// Parse a stored status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(BatchStatus::Pending),
            "PROCESSING" => Some(BatchStatus::Processing),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[BatchStatus] {
        match self {
            BatchStatus::Pending => &[BatchStatus::Processing, BatchStatus::Failed],
            BatchStatus::Processing => &[BatchStatus::Completed, BatchStatus::Failed],
            BatchStatus::Completed | BatchStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// A grouped set of closed-loop transfers settled with one correspondent bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementBatch {
    /// `SETTLE-` followed by 16 upper-case hex characters.
    pub batch_id: String,
    pub bank_id: BankId,
    pub total_amount: Decimal,
    pub fee_amount: Decimal,
    /// `total_amount - fee_amount`.
    pub net_amount: Decimal,
    pub currency: Currency,
    pub status: BatchStatus,
    pub method: SettlementMethod,
    /// Reference assigned by the external rail on completion.
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    /// Transactions settled by this batch. Empty for manually created batches.
    pub transactions: Vec<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SettlementBatch {
    pub const ID_PREFIX: &'static str = "SETTLE-";

    /// Generate a fresh batch id.
    pub fn generate_id() -> String {
        format!("{}{}", Self::ID_PREFIX, random_hex(8, true))
    }

    /// Fee for `total` under a percentage fee schedule, rounded to the currency.
    pub fn fee_for(total: Decimal, fee_percentage: Decimal, currency: &Currency) -> Result<Decimal> {
        total
            .checked_mul(fee_percentage)
            .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
            .map(|fee| currency.quantize(fee))
            .ok_or_else(|| {
                LedgerError::InvalidAmount(format!(
                    "fee of {}% on {} is out of range",
                    fee_percentage, total
                ))
            })
    }

    /// Create a pending batch for `bank`, computing fee and net amounts once.
    pub fn new(
        bank: &CorrespondentBank,
        total_amount: Decimal,
        currency: Currency,
        method: SettlementMethod,
        transactions: Vec<TransactionId>,
    ) -> Result<Self> {
        let total_amount = currency.quantize(total_amount);
        if total_amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "settlement total must be positive, got {}",
                total_amount
            )));
        }

        let fee_amount = Self::fee_for(total_amount, bank.settlement_fee_percentage, &currency)?;
        let now = Utc::now();
        Ok(Self {
            batch_id: Self::generate_id(),
            bank_id: bank.id,
            total_amount,
            fee_amount,
            net_amount: total_amount - fee_amount,
            currency,
            status: BatchStatus::Pending,
            method,
            external_reference: None,
            failure_reason: None,
            transactions,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Re-check the amounts against the bank's fee schedule.
    pub fn validate(&self, fee_percentage: Decimal) -> Result<()> {
        let inconsistent = |reason: String| LedgerError::InconsistentBatch {
            batch_id: self.batch_id.clone(),
            reason,
        };

        if self.total_amount <= Decimal::ZERO {
            return Err(inconsistent(format!("non-positive total {}", self.total_amount)));
        }
        let expected_fee = Self::fee_for(self.total_amount, fee_percentage, &self.currency)?;
        if self.fee_amount != expected_fee {
            return Err(inconsistent(format!(
                "fee {} does not match expected {}",
                self.fee_amount, expected_fee
            )));
        }
        if self.net_amount != self.total_amount - self.fee_amount {
            return Err(inconsistent(format!(
                "net {} is not total {} minus fee {}",
                self.net_amount, self.total_amount, self.fee_amount
            )));
        }
        if self.net_amount < Decimal::ZERO {
            return Err(inconsistent(format!("negative net {}", self.net_amount)));
        }
        Ok(())
    }

    fn transition(&mut self, next: BatchStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::transition(self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Hand the batch to the external rail.
    pub fn start(&mut self) -> Result<()> {
        self.transition(BatchStatus::Processing)
    }

    /// Record confirmation from the external rail.
    pub fn complete(&mut self, external_reference: &str) -> Result<()> {
        let external_reference = external_reference.trim();
        if external_reference.is_empty() {
            return Err(LedgerError::InconsistentBatch {
                batch_id: self.batch_id.clone(),
                reason: "completion requires an external reference".into(),
            });
        }
        self.transition(BatchStatus::Completed)?;
        self.external_reference = Some(external_reference.to_string());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.transition(BatchStatus::Failed)?;
        self.failure_reason = Some(reason.to_string());
        Ok(())
    }
}
