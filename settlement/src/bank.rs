//! Correspondent banks participating in the closed loop.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use closedloop_common::{AccountId, BankId, LedgerError, Result, SwiftCode};

use crate::institution::check_routing_number;

/// Rail a settlement batch is paid out over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementMethod {
    Ach,
    Swift,
    Wire,
}

impl SettlementMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementMethod::Ach => "ACH",
            SettlementMethod::Swift => "SWIFT",
            SettlementMethod::Wire => "WIRE",
        }
    }
}

impl fmt::Display for SettlementMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACH" => Ok(SettlementMethod::Ach),
            "SWIFT" => Ok(SettlementMethod::Swift),
            "WIRE" => Ok(SettlementMethod::Wire),
            other => Err(LedgerError::Configuration(format!(
                "unknown settlement method {:?}",
                other
            ))),
        }
    }
}

/// Registration request for a correspondent bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCorrespondentBank {
    pub name: String,
    /// Unique short code for the bank inside the platform.
    pub bank_code: String,
    pub swift_code: Option<String>,
    pub ach_routing_number: Option<String>,
    pub clearing_account_number: Option<String>,
    /// Defaults to `CorrespondentBank::DEFAULT_THRESHOLD`.
    pub settlement_threshold: Option<Decimal>,
    /// Defaults to `CorrespondentBank::DEFAULT_FEE_PERCENTAGE`.
    pub settlement_fee_percentage: Option<Decimal>,
    pub supports_wire: bool,
}

impl NewCorrespondentBank {
    pub fn new(name: impl Into<String>, bank_code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bank_code: bank_code.into(),
            swift_code: None,
            ach_routing_number: None,
            clearing_account_number: None,
            settlement_threshold: None,
            settlement_fee_percentage: None,
            supports_wire: false,
        }
    }

    pub fn with_swift_code(mut self, code: impl Into<String>) -> Self {
        self.swift_code = Some(code.into());
        self
    }

    pub fn with_routing_number(mut self, routing_number: impl Into<String>) -> Self {
        self.ach_routing_number = Some(routing_number.into());
        self
    }

    pub fn with_clearing_account(mut self, account: impl Into<String>) -> Self {
        self.clearing_account_number = Some(account.into());
        self
    }

    pub fn with_threshold(mut self, threshold: Decimal) -> Self {
        self.settlement_threshold = Some(threshold);
        self
    }

    pub fn with_fee_percentage(mut self, percentage: Decimal) -> Self {
        self.settlement_fee_percentage = Some(percentage);
        self
    }

    pub fn with_wire(mut self) -> Self {
        self.supports_wire = true;
        self
    }
}

/// A correspondent bank with its settlement account and fee schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrespondentBank {
    pub id: BankId,
    pub name: String,
    pub bank_code: String,
    pub swift_code: Option<SwiftCode>,
    pub ach_routing_number: Option<String>,
    /// Account number at the bank's own clearing system.
    pub clearing_account_number: Option<String>,
    /// Institution account on the ledger holding the bank's closed-loop funds.
    pub settlement_account: AccountId,
    /// Pending volume at which a batch is cut automatically.
    pub settlement_threshold: Decimal,
    /// Fee charged on each batch, as a percentage (0.5 means 0.5%).
    pub settlement_fee_percentage: Decimal,
    pub supports_ach: bool,
    pub supports_swift: bool,
    pub supports_wire: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CorrespondentBank {
    pub const DEFAULT_THRESHOLD: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);
    pub const DEFAULT_FEE_PERCENTAGE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

    /// Validate a registration request and build the bank around its settlement account.
    pub fn from_request(request: NewCorrespondentBank, settlement_account: AccountId) -> Result<Self> {
        let bank_code = request.bank_code.trim().to_ascii_uppercase();
        if bank_code.is_empty() {
            return Err(LedgerError::Configuration("bank code is required".into()));
        }

        let swift_code = request
            .swift_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(SwiftCode::parse)
            .transpose()?;
        let ach_routing_number = check_routing_number(request.ach_routing_number.as_deref())?;

        let settlement_threshold = request
            .settlement_threshold
            .unwrap_or(Self::DEFAULT_THRESHOLD);
        if settlement_threshold < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "settlement threshold cannot be negative, got {}",
                settlement_threshold
            )));
        }

        let settlement_fee_percentage = request
            .settlement_fee_percentage
            .unwrap_or(Self::DEFAULT_FEE_PERCENTAGE);
        if settlement_fee_percentage < Decimal::ZERO || settlement_fee_percentage > Decimal::ONE_HUNDRED {
            return Err(LedgerError::InvalidAmount(format!(
                "fee percentage must be between 0 and 100, got {}",
                settlement_fee_percentage
            )));
        }

        let now = Utc::now();
        Ok(Self {
            id: BankId::new(),
            name: request.name,
            bank_code,
            supports_ach: ach_routing_number.is_some(),
            supports_swift: swift_code.is_some(),
            swift_code,
            ach_routing_number,
            clearing_account_number: request.clearing_account_number,
            settlement_account,
            settlement_threshold,
            settlement_fee_percentage,
            supports_wire: request.supports_wire,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the bank can receive a batch over `method`.
    pub fn supports(&self, method: SettlementMethod) -> bool {
        match method {
            SettlementMethod::Ach => self.supports_ach,
            SettlementMethod::Swift => self.supports_swift,
            SettlementMethod::Wire => self.supports_wire,
        }
    }

    /// Methods the bank supports, in preference order.
    pub fn supported_methods(&self) -> Vec<SettlementMethod> {
        [SettlementMethod::Ach, SettlementMethod::Swift, SettlementMethod::Wire]
            .into_iter()
            .filter(|m| self.supports(*m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        assert_eq!(CorrespondentBank::DEFAULT_THRESHOLD, dec!(10000));
        assert_eq!(CorrespondentBank::DEFAULT_FEE_PERCENTAGE, dec!(0.5));

        let bank = CorrespondentBank::from_request(
            NewCorrespondentBank::new("First Lagos", "flag"),
            AccountId::new(),
        )
        .unwrap();
        assert_eq!(bank.bank_code, "FLAG");
        assert_eq!(bank.settlement_threshold, dec!(10000));
        assert_eq!(bank.settlement_fee_percentage, dec!(0.5));
        assert!(bank.supported_methods().is_empty());
    }

    #[test]
    fn test_capabilities_follow_identifiers() {
        let bank = CorrespondentBank::from_request(
            NewCorrespondentBank::new("Chase", "CHASE")
                .with_swift_code("chasus33")
                .with_routing_number("021000021")
                .with_wire(),
            AccountId::new(),
        )
        .unwrap();
        assert!(bank.supports_ach);
        assert!(bank.supports_swift);
        assert_eq!(
            bank.supported_methods(),
            vec![SettlementMethod::Ach, SettlementMethod::Swift, SettlementMethod::Wire]
        );
        assert_eq!(bank.swift_code.map(|c| c.to_string()), Some("CHASUS33".to_string()));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let account = AccountId::new();
        assert!(CorrespondentBank::from_request(NewCorrespondentBank::new("X", " "), account).is_err());
        assert!(CorrespondentBank::from_request(
            NewCorrespondentBank::new("X", "X").with_swift_code("BAD"),
            account
        )
        .is_err());
        assert!(CorrespondentBank::from_request(
            NewCorrespondentBank::new("X", "X").with_routing_number("021000022"),
            account
        )
        .is_err());
        assert!(CorrespondentBank::from_request(
            NewCorrespondentBank::new("X", "X").with_fee_percentage(dec!(101)),
            account
        )
        .is_err());
        assert!(CorrespondentBank::from_request(
            NewCorrespondentBank::new("X", "X").with_threshold(dec!(-1)),
            account
        )
        .is_err());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("swift".parse::<SettlementMethod>().unwrap(), SettlementMethod::Swift);
        assert_eq!(SettlementMethod::Wire.to_string(), "WIRE");
        assert!("carrier-pigeon".parse::<SettlementMethod>().is_err());
        assert_eq!(serde_json::to_string(&SettlementMethod::Ach).unwrap(), "\"ACH\"");
    }
}
