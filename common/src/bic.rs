//! ISO 9362 business identifier codes (SWIFT/BIC).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::LedgerError;

/// A validated, upper-cased BIC of 8 or 11 characters.
///
/// Layout: 4 letters (institution), 2 letters (country), 2 alphanumerics
/// (location), optional 3 alphanumerics (branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SwiftCode(String);

impl SwiftCode {
    /// Branch code designating the primary office.
    pub const PRIMARY_BRANCH: &'static str = "XXX";

    /// Validate and normalize a BIC.
    pub fn parse(code: &str) -> Result<Self, LedgerError> {
        let code = code.trim().to_ascii_uppercase();
        let bytes = code.as_bytes();
        let shape_ok = matches!(bytes.len(), 8 | 11)
            && bytes[..6].iter().all(u8::is_ascii_uppercase)
            && bytes[6..].iter().all(u8::is_ascii_alphanumeric);
        if !shape_ok {
            return Err(LedgerError::InvalidSwiftCode(code));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Institution (bank) code, characters 1-4.
    pub fn institution_code(&self) -> &str {
        &self.0[..4]
    }

    /// ISO 3166 country code, characters 5-6.
    pub fn country_code(&self) -> &str {
        &self.0[4..6]
    }

    /// Location code, characters 7-8.
    pub fn location_code(&self) -> &str {
        &self.0[6..8]
    }

    /// Branch code, if the 11-character form was given.
    pub fn branch_code(&self) -> Option<&str> {
        self.0.get(8..11)
    }

    /// Canonical lookup key: an 8-character code and its `XXX` form share one key.
    pub fn lookup_key(&self) -> &str {
        match self.branch_code() {
            None | Some(Self::PRIMARY_BRANCH) => &self.0[..8],
            Some(_) => &self.0,
        }
    }

    /// Whether two codes name the same office.
    pub fn same_office(&self, other: &SwiftCode) -> bool {
        self.lookup_key() == other.lookup_key()
    }

    /// 12-character logical terminal address used in MT headers:
    /// the 8-character code, terminal letter `X`, then the branch.
    pub fn logical_terminal(&self) -> String {
        format!(
            "{}X{}",
            &self.0[..8],
            self.branch_code().unwrap_or(Self::PRIMARY_BRANCH)
        )
    }

    /// Recover the BIC from a logical terminal address.
    pub fn from_logical_terminal(terminal: &str) -> Result<Self, LedgerError> {
        let terminal = terminal.trim();
        match (terminal.get(..8), terminal.get(9..12)) {
            (Some(head), Some(branch)) if terminal.len() == 12 => {
                Self::parse(&format!("{}{}", head, branch))
            }
            _ => Err(LedgerError::InvalidSwiftCode(terminal.to_string())),
        }
    }
}

impl fmt::Display for SwiftCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SwiftCode {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SwiftCode> for String {
    fn from(code: SwiftCode) -> Self {
        code.0
    }
}
