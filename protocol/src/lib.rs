//! ClosedLoop Protocol Integrations
//!
//! Message formats and external-network edges of the closed loop: SWIFT MT
//! generation and parsing, KTT telex messaging, EDI payment orders, and
//! payment gateway status and webhook handling.

pub mod edi;
pub mod gateway;
pub mod swift;
pub mod telex;

pub use edi::{
    AckEntry, AckReport, AckStatus, Acknowledgment, EdiConfig, EdiError, EdiFormat, EdiPartner, EdiReceipt,
    EdiService, EdiStatus, EdiTransaction, EdiTransactionType, EdiTransport, NewEdiTransaction,
    NullEdiTransport, PartyInfo,
};
pub use gateway::{map_gateway_status, GatewayKind, WebhookVerifier, STRIPE_TOLERANCE_SECS};
pub use swift::{parse_message, parse_messages, Charges, Mt103, Mt202, ParsedSwiftMessage, SwiftParseError};
pub use telex::{
    IncomingTelex, NullTransport, OutgoingTelex, ReceiveOutcome, RequestHeaders, TelexConfig,
    TelexError, TelexMessage, TelexMessageType, TelexPriority, TelexService, TelexStatus,
    TelexTransport, TransportReceipt,
};
