//! ClosedLoop Common Types
//!
//! Shared types for the closed-loop stablecoin ledger: identifiers, monetary
//! amounts, SWIFT codes, generic transaction records and the ledger error type.

pub mod bic;
pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod error;

pub use bic::*;
pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use error::*;
