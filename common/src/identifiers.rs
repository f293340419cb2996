//! Identifier types for ledger and settlement entities.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a platform user (account owner).
    UserId
);
uuid_id!(
    /// Identifier of a stablecoin account row.
    AccountId
);
uuid_id!(
    /// Identifier of a financial institution.
    InstitutionId
);
uuid_id!(
    /// Identifier of a correspondent bank.
    BankId
);
uuid_id!(
    /// Identifier of a ledger entry.
    EntryId
);

/// Hex-encode `n` random bytes, upper-cased when requested.
pub fn random_hex(n: usize, upper: bool) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = hex::encode(bytes);
    if upper {
        encoded.to_uppercase()
    } else {
        encoded
    }
}

/// Public transaction reference shared by a transaction and its ledger entries.
///
/// 32 lowercase hex characters (16 random bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Length of a generated transaction id.
    pub const LEN: usize = 32;

    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        Self(random_hex(16, false))
    }

    /// Wrap an existing reference without validation (e.g. loaded from storage).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse and validate a transaction id.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == Self::LEN
            && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        valid.then(|| Self(s.to_string()))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-facing stablecoin account number, e.g. `NVCT-3F09A1C2B4D5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountNumber(String);

impl AccountNumber {
    /// Prefix used for every generated account number.
    pub const PREFIX: &'static str = "NVCT-";

    /// Generate a fresh account number.
    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, random_hex(6, true)))
    }

    /// Wrap an existing account number.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Check the number has the generated shape.
    pub fn is_well_formed(&self) -> bool {
        self.0
            .strip_prefix(Self::PREFIX)
            .map(|rest| {
                rest.len() == 12
                    && rest
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
            })
            .unwrap_or(false)
    }

    /// Get the number as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
