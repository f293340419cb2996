//! Node error type.

use thiserror::Error;

use closedloop_common::LedgerError;
use closedloop_protocol::{EdiError, SwiftParseError, TelexError};

use crate::state::NodeState;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Telex(#[from] TelexError),

    #[error(transparent)]
    Edi(#[from] EdiError),

    #[error("SWIFT message rejected: {0}")]
    Swift(#[from] SwiftParseError),

    #[error("Node is not accepting requests (state: {0:?})")]
    NotAccepting(NodeState),
}

pub type Result<T> = std::result::Result<T, NodeError>;
