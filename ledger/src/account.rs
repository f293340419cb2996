//! Stablecoin account definitions.

use closedloop_common::{AccountId, AccountNumber, Currency, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of account holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Individual,
    Business,
    /// Settlement account of a correspondent bank or other institution.
    Institution,
    Partner,
}

impl AccountType {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Individual => "INDIVIDUAL",
            AccountType::Business => "BUSINESS",
            AccountType::Institution => "INSTITUTION",
            AccountType::Partner => "PARTNER",
        }
    }

    /// Parse a stored name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INDIVIDUAL" => Some(AccountType::Individual),
            "BUSINESS" => Some(AccountType::Business),
            "INSTITUTION" => Some(AccountType::Institution),
            "PARTNER" => Some(AccountType::Partner),
            _ => None,
        }
    }
}

/// A closed-loop stablecoin account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StablecoinAccount {
    /// Unique account identifier.
    pub id: AccountId,
    /// Human-facing account number, unique across the ledger.
    pub account_number: AccountNumber,
    /// Owning user.
    pub owner: UserId,
    /// Current balance. Never negative.
    pub balance: Decimal,
    /// Account currency.
    pub currency: Currency,
    pub account_type: AccountType,
    /// Inactive accounts can neither send nor receive.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StablecoinAccount {
    /// Create a new, empty, active account with a fresh account number.
    pub fn new(owner: UserId, account_type: AccountType, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            account_number: AccountNumber::generate(),
            owner,
            balance: Decimal::ZERO,
            currency,
            account_type,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can transact.
    pub fn can_transact(&self) -> bool {
        self.is_active
    }

    /// Check whether `amount` can be debited.
    pub fn can_cover(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_defaults() {
        let account = StablecoinAccount::new(UserId::new(), AccountType::Business, Currency::nvct());
        assert!(account.is_active);
        assert_eq!(account.balance, Decimal::ZERO);
        assert!(account.account_number.is_well_formed());
        assert!(account.can_cover(Decimal::ZERO));
        assert!(!account.can_cover(Decimal::ONE));
    }

    #[test]
    fn test_account_type_names() {
        assert_eq!(AccountType::parse("institution"), Some(AccountType::Institution));
        assert_eq!(AccountType::Partner.as_str(), "PARTNER");
        assert_eq!(AccountType::parse("VAULT"), None);
    }
}
