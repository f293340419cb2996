//! KTT telex messaging.
//!
//! Outgoing messages are recorded as drafts, handed to a [`TelexTransport`],
//! and marked sent or failed by the outcome. Incoming webhook messages are
//! validated, deduplicated by message id and dispatched by message type.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, instrument, warn};

use closedloop_common::{SwiftCode, Transaction, TransactionId, TransactionStatus};
use closedloop_crypto::{hmac_sha256_hex, nonce_hex, verify_hmac_sha256_hex, CryptoError};

/// Telex errors.
#[derive(Debug, Error)]
pub enum TelexError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown telex message type: {0}")]
    UnknownMessageType(String),

    #[error("Duplicate telex message: {0}")]
    Duplicate(String),

    #[error("Telex message not found: {0}")]
    NotFound(String),

    #[error("Unknown telex priority: {0}")]
    UnknownPriority(String),

    #[error("Telex transport error: {0}")]
    Transport(String),

    #[error("Request signing failed: {0}")]
    Signing(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, TelexError>;

/// KTT telex message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelexMessageType {
    /// Funds transfer.
    #[serde(rename = "FT")]
    FundsTransfer,
    /// Funds transfer confirmation.
    #[serde(rename = "FTC")]
    FundsTransferConfirmation,
    #[serde(rename = "PO")]
    PaymentOrder,
    #[serde(rename = "PC")]
    PaymentConfirmation,
    #[serde(rename = "BI")]
    BalanceInquiry,
    #[serde(rename = "BR")]
    BalanceResponse,
    #[serde(rename = "GM")]
    GeneralMessage,
}

impl TelexMessageType {
    pub fn code(&self) -> &'static str {
        match self {
            TelexMessageType::FundsTransfer => "FT",
            TelexMessageType::FundsTransferConfirmation => "FTC",
            TelexMessageType::PaymentOrder => "PO",
            TelexMessageType::PaymentConfirmation => "PC",
            TelexMessageType::BalanceInquiry => "BI",
            TelexMessageType::BalanceResponse => "BR",
            TelexMessageType::GeneralMessage => "GM",
        }
    }
}

impl fmt::Display for TelexMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TelexMessageType {
    type Err = TelexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FT" => Ok(TelexMessageType::FundsTransfer),
            "FTC" => Ok(TelexMessageType::FundsTransferConfirmation),
            "PO" => Ok(TelexMessageType::PaymentOrder),
            "PC" => Ok(TelexMessageType::PaymentConfirmation),
            "BI" => Ok(TelexMessageType::BalanceInquiry),
            "BR" => Ok(TelexMessageType::BalanceResponse),
            "GM" => Ok(TelexMessageType::GeneralMessage),
            other => Err(TelexError::UnknownMessageType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelexStatus {
    Draft,
    Sent,
    Received,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelexPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl FromStr for TelexPriority {
    type Err = TelexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(TelexPriority::High),
            "NORMAL" => Ok(TelexPriority::Normal),
            "LOW" => Ok(TelexPriority::Low),
            other => Err(TelexError::UnknownPriority(other.to_string())),
        }
    }
}

/// Telex network credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct TelexConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    /// Secret for verifying incoming webhook signatures.
    pub webhook_secret: String,
}

impl fmt::Debug for TelexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelexConfig")
            .field("api_key_set", &!self.api_key.is_empty())
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for TelexConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: "https://api.ktt-telex.example.com/v1".to_string(),
            webhook_secret: String::new(),
        }
    }
}

impl TelexConfig {
    /// Read `KTT_TELEX_API_KEY`, `KTT_TELEX_API_SECRET`, `KTT_TELEX_BASE_URL`
    /// and `KTT_TELEX_WEBHOOK_SECRET`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            api_key: var("KTT_TELEX_API_KEY").unwrap_or(defaults.api_key),
            api_secret: var("KTT_TELEX_API_SECRET").unwrap_or(defaults.api_secret),
            base_url: var("KTT_TELEX_BASE_URL").unwrap_or(defaults.base_url),
            webhook_secret: var("KTT_TELEX_WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
        }
    }

    /// Whether credentials for the live network are present.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Authentication headers for one API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub api_key: String,
    pub timestamp: i64,
    pub nonce: String,
    /// HMAC-SHA256 of `timestamp.nonce.body`, absent without an API secret.
    pub signature: Option<String>,
}

impl RequestHeaders {
    pub fn sign(config: &TelexConfig, body: &[u8]) -> Result<Self> {
        let timestamp = Utc::now().timestamp();
        let nonce = nonce_hex(8);
        let signature = if config.api_secret.is_empty() {
            None
        } else {
            let mut payload = format!("{}.{}.", timestamp, nonce).into_bytes();
            payload.extend_from_slice(body);
            Some(hmac_sha256_hex(config.api_secret.as_bytes(), &payload)?)
        };
        Ok(Self {
            api_key: config.api_key.clone(),
            timestamp,
            nonce,
            signature,
        })
    }

    /// Header name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-KTT-API-Key", self.api_key.clone()),
            ("X-KTT-Timestamp", self.timestamp.to_string()),
            ("X-KTT-Nonce", self.nonce.clone()),
            ("Content-Type", "application/json".to_string()),
        ];
        if let Some(signature) = &self.signature {
            pairs.push(("X-KTT-Signature", signature.clone()));
        }
        pairs
    }
}

/// A stored telex message, outgoing or incoming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelexMessage {
    /// `KTT-` + UUID for outgoing messages; the sender's id for incoming ones.
    pub message_id: String,
    pub sender_reference: String,
    /// `None` for incoming messages addressed to this platform.
    pub recipient_bic: Option<SwiftCode>,
    pub sender_bic: Option<String>,
    pub message_type: TelexMessageType,
    pub content: Value,
    pub status: TelexStatus,
    pub priority: TelexPriority,
    pub transaction_id: Option<TransactionId>,
    pub failure_reason: Option<String>,
    /// Acknowledged by a simulated transport rather than the live network.
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TelexMessage {
    fn mark_processed(&mut self) {
        self.status = TelexStatus::Processed;
        self.processed_at = Some(Utc::now());
    }
}

/// A message to send.
#[derive(Debug, Clone)]
pub struct OutgoingTelex {
    pub sender_reference: String,
    pub recipient_bic: SwiftCode,
    pub message_type: TelexMessageType,
    pub content: Value,
    pub transaction_id: Option<TransactionId>,
    pub priority: TelexPriority,
}

impl OutgoingTelex {
    pub fn new(
        sender_reference: impl Into<String>,
        recipient_bic: SwiftCode,
        message_type: TelexMessageType,
        content: Value,
    ) -> Self {
        Self {
            sender_reference: sender_reference.into(),
            recipient_bic,
            message_type,
            content,
            transaction_id: None,
            priority: TelexPriority::Normal,
        }
    }

    pub fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_priority(mut self, priority: TelexPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Webhook payload for an incoming message. Every field is checked on receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingTelex {
    pub message_id: Option<String>,
    pub sender_reference: Option<String>,
    pub sender_bic: Option<String>,
    pub message_type: Option<String>,
    pub content: Option<Value>,
    pub priority: Option<String>,
}

/// Acknowledgment from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    pub accepted_at: DateTime<Utc>,
    /// The network was not contacted.
    pub simulated: bool,
}

/// Delivery channel to the telex network.
#[async_trait]
pub trait TelexTransport: Send + Sync {
    async fn deliver(
        &self,
        message_id: &str,
        message: &OutgoingTelex,
        headers: &RequestHeaders,
    ) -> Result<TransportReceipt>;
}

/// Transport that accepts every message without contacting the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl TelexTransport for NullTransport {
    async fn deliver(
        &self,
        _message_id: &str,
        _message: &OutgoingTelex,
        _headers: &RequestHeaders,
    ) -> Result<TransportReceipt> {
        Ok(TransportReceipt {
            accepted_at: Utc::now(),
            simulated: true,
        })
    }
}

/// What happened to an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// Funds transfer accepted and marked processed.
    Processed(TelexMessage),
    /// A transfer confirmation. The caller applies the reported status to the
    /// transaction identified by `reference`, then calls `mark_processed`.
    Confirmation {
        message: TelexMessage,
        reference: String,
        reported_status: Option<TransactionStatus>,
    },
    /// Stored as received with no further action.
    Stored(TelexMessage),
}

impl ReceiveOutcome {
    pub fn message(&self) -> &TelexMessage {
        match self {
            ReceiveOutcome::Processed(message) | ReceiveOutcome::Stored(message) => message,
            ReceiveOutcome::Confirmation { message, .. } => message,
        }
    }
}

/// Telex service with an explicit configuration and transport.
pub struct TelexService {
    config: TelexConfig,
    transport: Arc<dyn TelexTransport>,
    messages: DashMap<String, TelexMessage>,
}

impl TelexService {
    pub fn new(config: TelexConfig, transport: Arc<dyn TelexTransport>) -> Self {
        Self {
            config,
            transport,
            messages: DashMap::new(),
        }
    }

    /// Service with the null transport, for development and tests.
    pub fn simulated(config: TelexConfig) -> Self {
        Self::new(config, Arc::new(NullTransport))
    }

    pub fn config(&self) -> &TelexConfig {
        &self.config
    }

    /// Send a message. The stored record ends `Sent`, or `Failed` when the
    /// transport refuses it.
    #[instrument(skip(self, request), fields(
        recipient = %request.recipient_bic,
        message_type = %request.message_type
    ))]
    pub async fn send(&self, request: OutgoingTelex) -> Result<TelexMessage> {
        let message_id = format!("KTT-{}", uuid::Uuid::new_v4());
        let record = TelexMessage {
            message_id: message_id.clone(),
            sender_reference: request.sender_reference.clone(),
            recipient_bic: Some(request.recipient_bic.clone()),
            sender_bic: None,
            message_type: request.message_type,
            content: request.content.clone(),
            status: TelexStatus::Draft,
            priority: request.priority,
            transaction_id: request.transaction_id.clone(),
            failure_reason: None,
            simulated: false,
            created_at: Utc::now(),
            sent_at: None,
            received_at: None,
            processed_at: None,
        };
        self.messages.insert(message_id.clone(), record);

        let body = serde_json::to_vec(&json!({
            "message_id": message_id,
            "sender_reference": request.sender_reference,
            "recipient_bic": request.recipient_bic.as_str(),
            "message_type": request.message_type.code(),
            "content": request.content,
            "priority": request.priority,
        }))
        .map_err(|e| TelexError::Transport(e.to_string()))?;
        let headers = RequestHeaders::sign(&self.config, &body)?;
        let outcome = self.transport.deliver(&message_id, &request, &headers).await;

        let mut stored = self
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| TelexError::NotFound(message_id.clone()))?;
        match outcome {
            Ok(receipt) => {
                stored.status = TelexStatus::Sent;
                stored.sent_at = Some(receipt.accepted_at);
                stored.simulated = receipt.simulated;
                if receipt.simulated {
                    warn!(message_id = %message_id, "Telex acknowledgment is simulated; delivery not verified");
                } else {
                    info!(message_id = %message_id, "Telex message sent");
                }
                Ok(stored.clone())
            }
            Err(e) => {
                stored.status = TelexStatus::Failed;
                stored.failure_reason = Some(e.to_string());
                warn!(message_id = %message_id, error = %e, "Telex delivery failed");
                Err(e)
            }
        }
    }

    /// Accept an incoming webhook message.
    #[instrument(skip(self, incoming), fields(message_id = ?incoming.message_id))]
    pub fn receive(&self, incoming: IncomingTelex) -> Result<ReceiveOutcome> {
        let message_id = incoming.message_id.ok_or(TelexError::MissingField("message_id"))?;
        let sender_reference = incoming
            .sender_reference
            .ok_or(TelexError::MissingField("sender_reference"))?;
        let sender_bic = incoming.sender_bic.ok_or(TelexError::MissingField("sender_bic"))?;
        let message_type: TelexMessageType = incoming
            .message_type
            .ok_or(TelexError::MissingField("message_type"))?
            .parse()?;
        let content = incoming
            .content
            .filter(|c| !c.is_null())
            .ok_or(TelexError::MissingField("content"))?;
        let priority = incoming
            .priority
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        let now = Utc::now();
        let mut message = TelexMessage {
            message_id: message_id.clone(),
            sender_reference,
            recipient_bic: None,
            sender_bic: Some(sender_bic),
            message_type,
            content,
            status: TelexStatus::Received,
            priority,
            transaction_id: None,
            failure_reason: None,
            simulated: false,
            created_at: now,
            sent_at: None,
            received_at: Some(now),
            processed_at: None,
        };

        let outcome = match message_type {
            TelexMessageType::FundsTransfer => {
                message.mark_processed();
                ReceiveOutcome::Processed(message)
            }
            TelexMessageType::FundsTransferConfirmation => {
                let field = |name: &str| {
                    message
                        .content
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                let reported_status = match field("status").as_deref() {
                    Some("COMPLETED") => Some(TransactionStatus::Completed),
                    Some("FAILED") => Some(TransactionStatus::Failed),
                    _ => None,
                };
                match field("reference") {
                    Some(reference) => ReceiveOutcome::Confirmation {
                        message,
                        reference,
                        reported_status,
                    },
                    None => {
                        warn!("Funds transfer confirmation without a reference");
                        ReceiveOutcome::Stored(message)
                    }
                }
            }
            _ => ReceiveOutcome::Stored(message),
        };

        match self.messages.entry(message_id.clone()) {
            Entry::Occupied(_) => {
                warn!(message_id = %message_id, "Duplicate telex message received");
                return Err(TelexError::Duplicate(message_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(outcome.message().clone());
            }
        }
        info!(message_id = %message_id, message_type = %message_type, "Stored incoming telex message");
        Ok(outcome)
    }

    /// Mark a received message processed, linking the transaction it settled.
    pub fn mark_processed(
        &self,
        message_id: &str,
        transaction_id: Option<TransactionId>,
    ) -> Result<TelexMessage> {
        let mut message = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| TelexError::NotFound(message_id.to_string()))?;
        if transaction_id.is_some() {
            message.transaction_id = transaction_id;
        }
        message.mark_processed();
        Ok(message.clone())
    }

    pub fn status(&self, message_id: &str) -> Result<TelexMessage> {
        self.messages
            .get(message_id)
            .map(|m| m.clone())
            .ok_or_else(|| TelexError::NotFound(message_id.to_string()))
    }

    /// Messages linked to a transaction, oldest first.
    pub fn messages_for_transaction(&self, transaction_id: &TransactionId) -> Vec<TelexMessage> {
        let mut messages: Vec<_> = self
            .messages
            .iter()
            .filter(|m| m.transaction_id.as_ref() == Some(transaction_id))
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    /// Verify an incoming webhook body against its signature header.
    pub fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(self.config.webhook_secret.as_bytes(), payload, signature)
    }

    /// Send an `FT` message for a transaction, with high priority.
    pub async fn funds_transfer_message(
        &self,
        tx: &Transaction,
        recipient_bic: &SwiftCode,
    ) -> Result<TelexMessage> {
        let reference = format!("FT-{}", tx.id);
        let now = Utc::now();
        let counterparty = tx.counterparty.as_ref();
        let content = json!({
            "reference": reference,
            "transaction_id": tx.id,
            "amount": tx.amount,
            "currency": tx.currency,
            "recipient_name": counterparty.map(|c| c.name.as_str()),
            "recipient_account": counterparty.and_then(|c| c.account.as_deref()),
            "value_date": now.format("%Y-%m-%d").to_string(),
            "details": tx.description,
            "timestamp": now.to_rfc3339(),
        });
        self.send(
            OutgoingTelex::new(
                reference,
                recipient_bic.clone(),
                TelexMessageType::FundsTransfer,
                content,
            )
            .with_transaction(tx.id.clone())
            .with_priority(TelexPriority::High),
        )
        .await
    }

    /// Send a `PC` message reporting a transaction's status.
    pub async fn payment_confirmation_message(
        &self,
        tx: &Transaction,
        recipient_bic: &SwiftCode,
    ) -> Result<TelexMessage> {
        let reference = format!("PC-{}", tx.id);
        let now = Utc::now();
        let content = json!({
            "reference": reference,
            "transaction_id": tx.id,
            "original_reference": tx.external_id,
            "status": tx.status.as_str(),
            "amount": tx.amount,
            "currency": tx.currency,
            "settlement_date": now.format("%Y-%m-%d").to_string(),
            "settlement_time": now.format("%H:%M:%S").to_string(),
            "recipient_name": tx.counterparty.as_ref().map(|c| c.name.as_str()),
            "timestamp": now.to_rfc3339(),
        });
        self.send(
            OutgoingTelex::new(
                reference,
                recipient_bic.clone(),
                TelexMessageType::PaymentConfirmation,
                content,
            )
            .with_transaction(tx.id.clone()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use closedloop_common::{Counterparty, Currency, Money, TransactionType, UserId};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    struct RefusingTransport;

    #[async_trait]
    impl TelexTransport for RefusingTransport {
        async fn deliver(
            &self,
            _message_id: &str,
            _message: &OutgoingTelex,
            _headers: &RequestHeaders,
        ) -> Result<TransportReceipt> {
            Err(TelexError::Transport("connection refused".into()))
        }
    }

    fn bic() -> SwiftCode {
        SwiftCode::parse("DEUTDEFF").unwrap()
    }

    fn transaction() -> Transaction {
        Transaction::new(
            UserId::new(),
            Money::new(dec!(2500), Currency::usd()),
            TransactionType::SwiftFundTransfer,
            Some("Invoice 12".into()),
        )
        .with_counterparty(Counterparty::at_institution("Jane Roe", Some("DE0012".into()), None))
    }

    fn incoming(id: &str, message_type: &str, content: Value) -> IncomingTelex {
        IncomingTelex {
            message_id: Some(id.into()),
            sender_reference: Some("REF-1".into()),
            sender_bic: Some("DEUTDEFF".into()),
            message_type: Some(message_type.into()),
            content: Some(content),
            priority: None,
        }
    }

    #[tokio::test]
    async fn test_send_marks_sent_and_simulated() {
        let service = TelexService::simulated(TelexConfig::default());
        let sent = service
            .send(OutgoingTelex::new("REF-9", bic(), TelexMessageType::GeneralMessage, json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(sent.message_id.starts_with("KTT-"));
        assert_eq!(sent.status, TelexStatus::Sent);
        assert!(sent.simulated);
        assert!(sent.sent_at.is_some());
        assert_eq!(service.status(&sent.message_id).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_transport_failure_is_recorded() {
        let service = TelexService::new(TelexConfig::default(), Arc::new(RefusingTransport));
        let tx = transaction();
        let err = assert_err!(service.funds_transfer_message(&tx, &bic()).await);
        assert!(matches!(err, TelexError::Transport(_)));

        let stored = service.messages_for_transaction(&tx.id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, TelexStatus::Failed);
        assert_eq!(stored[0].failure_reason.as_deref(), Some("Telex transport error: connection refused"));
    }

    #[tokio::test]
    async fn test_funds_transfer_content() {
        let service = TelexService::simulated(TelexConfig::default());
        let tx = transaction();
        let sent = service.funds_transfer_message(&tx, &bic()).await.unwrap();
        assert_eq!(sent.sender_reference, format!("FT-{}", tx.id));
        assert_eq!(sent.priority, TelexPriority::High);
        assert_eq!(sent.message_type, TelexMessageType::FundsTransfer);
        assert_eq!(sent.content["recipient_name"], "Jane Roe");
        assert_eq!(sent.content["amount"], "2500");

        let confirmation = service.payment_confirmation_message(&tx, &bic()).await.unwrap();
        assert_eq!(confirmation.priority, TelexPriority::Normal);
        assert_eq!(confirmation.content["status"], "PENDING");
        assert_eq!(service.messages_for_transaction(&tx.id).len(), 2);
    }

    #[test]
    fn test_receive_funds_transfer() {
        let service = TelexService::simulated(TelexConfig::default());
        let outcome = assert_ok!(service.receive(incoming("IN-1", "FT", json!({"amount": "10"}))));
        match outcome {
            ReceiveOutcome::Processed(message) => {
                assert_eq!(message.status, TelexStatus::Processed);
                assert!(message.processed_at.is_some());
                assert_eq!(message.recipient_bic, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_receive_confirmation_reports_status() {
        let service = TelexService::simulated(TelexConfig::default());
        let outcome = service
            .receive(incoming("IN-2", "ftc", json!({"reference": "FT-abc", "status": "COMPLETED"})))
            .unwrap();
        let ReceiveOutcome::Confirmation { message, reference, reported_status } = outcome else {
            panic!("expected a confirmation");
        };
        assert_eq!(reference, "FT-abc");
        assert_eq!(reported_status, Some(TransactionStatus::Completed));
        assert_eq!(message.status, TelexStatus::Received);

        let tx_id = TransactionId::generate();
        let processed = service.mark_processed("IN-2", Some(tx_id.clone())).unwrap();
        assert_eq!(processed.status, TelexStatus::Processed);
        assert_eq!(processed.transaction_id, Some(tx_id));
    }

    #[test]
    fn test_receive_rejects_bad_input() {
        let service = TelexService::simulated(TelexConfig::default());
        let mut missing = incoming("IN-3", "GM", json!({"text": "x"}));
        missing.sender_bic = None;
        assert!(matches!(service.receive(missing), Err(TelexError::MissingField("sender_bic"))));

        assert!(matches!(
            service.receive(incoming("IN-4", "ZZ", json!({}))),
            Err(TelexError::UnknownMessageType(_))
        ));

        let stored = service.receive(incoming("IN-5", "GM", json!({"text": "x"}))).unwrap();
        assert!(matches!(stored, ReceiveOutcome::Stored(_)));
        assert!(matches!(
            service.receive(incoming("IN-5", "GM", json!({"text": "x"}))),
            Err(TelexError::Duplicate(_))
        ));
        assert!(matches!(service.status("IN-404"), Err(TelexError::NotFound(_))));
    }

    #[test]
    fn test_request_signature() {
        let config = TelexConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..TelexConfig::default()
        };
        let headers = RequestHeaders::sign(&config, b"{}").unwrap();
        let payload = format!("{}.{}.{{}}", headers.timestamp, headers.nonce);
        let signature = headers.signature.clone().unwrap();
        assert!(verify_hmac_sha256_hex(b"secret", payload.as_bytes(), &signature));
        assert!(headers.to_pairs().iter().any(|(name, _)| *name == "X-KTT-Signature"));

        let unsigned = RequestHeaders::sign(&TelexConfig::default(), b"{}").unwrap();
        assert_eq!(unsigned.signature, None);
    }

    #[test]
    fn test_webhook_verification() {
        let config = TelexConfig {
            webhook_secret: "whsec".into(),
            ..TelexConfig::default()
        };
        let service = TelexService::simulated(config);
        let signature = hmac_sha256_hex(b"whsec", b"payload").unwrap();
        assert!(service.verify_webhook(b"payload", &signature));
        assert!(!service.verify_webhook(b"tampered", &signature));

        let unconfigured = TelexService::simulated(TelexConfig::default());
        assert!(!unconfigured.verify_webhook(b"payload", &signature));
    }
}
