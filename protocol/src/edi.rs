//! EDI payment exchange with trading partners.
//!
//! Payment orders are rendered as X12 820, EDIFACT PAYORD or a JSON document
//! depending on the partner's format, handed to an [`EdiTransport`] and
//! matched against the partner's acknowledgments (X12 997, EDIFACT CONTRL)
//! by interchange control number.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use closedloop_common::{Currency, Transaction, TransactionId, TransactionType};

#[derive(Debug, Error)]
pub enum EdiError {
    #[error("EDI partner not found: {0}")]
    PartnerNotFound(String),

    #[error("EDI partner inactive: {0}")]
    PartnerInactive(String),

    #[error("EDI transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("{transaction_type} cannot be sent to a {format} partner")]
    UnsupportedTransactionType {
        transaction_type: EdiTransactionType,
        format: EdiFormat,
    },

    #[error("Unknown EDI format: {0}")]
    UnknownFormat(String),

    #[error("Invalid EDI amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Malformed acknowledgment: {0}")]
    MalformedAcknowledgment(String),

    #[error("Partner file error: {0}")]
    PartnerFile(String),

    #[error("EDI transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, EdiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EdiFormat {
    X12,
    Edifact,
    /// JSON documents.
    Custom,
}

impl EdiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdiFormat::X12 => "X12",
            EdiFormat::Edifact => "EDIFACT",
            EdiFormat::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for EdiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdiFormat {
    type Err = EdiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X12" => Ok(EdiFormat::X12),
            "EDIFACT" => Ok(EdiFormat::Edifact),
            "CUSTOM" => Ok(EdiFormat::Custom),
            other => Err(EdiError::UnknownFormat(other.to_string())),
        }
    }
}

/// Kind of payment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdiTransactionType {
    /// X12 820 payment order, X12 partners only.
    #[serde(rename = "820")]
    X12Payment,
    /// EDIFACT PAYORD, EDIFACT partners only.
    #[serde(rename = "PAYORD")]
    EdifactPayment,
    #[serde(rename = "ACH")]
    Ach,
    #[serde(rename = "WIRE")]
    Wire,
    /// Generic payment in whatever format the partner speaks.
    #[serde(rename = "CUST_PAYMENT")]
    CustomPayment,
}

impl EdiTransactionType {
    pub fn code(&self) -> &'static str {
        match self {
            EdiTransactionType::X12Payment => "820",
            EdiTransactionType::EdifactPayment => "PAYORD",
            EdiTransactionType::Ach => "ACH",
            EdiTransactionType::Wire => "WIRE",
            EdiTransactionType::CustomPayment => "CUST_PAYMENT",
        }
    }

    /// Whether a partner using `format` can receive this type.
    pub fn fits(&self, format: EdiFormat) -> bool {
        match self {
            EdiTransactionType::X12Payment => format == EdiFormat::X12,
            EdiTransactionType::EdifactPayment => format == EdiFormat::Edifact,
            _ => true,
        }
    }

    /// X12 BPR04 payment method code.
    fn x12_payment_method(&self) -> &'static str {
        match self {
            EdiTransactionType::Wire => "FWT",
            _ => "ACH",
        }
    }

    /// Default type for a ledger transaction sent to a partner.
    pub fn for_ledger(transaction_type: TransactionType, format: EdiFormat) -> Self {
        match transaction_type {
            TransactionType::EdiAchTransfer => EdiTransactionType::Ach,
            TransactionType::EdiWireTransfer => EdiTransactionType::Wire,
            TransactionType::EdiPayment => EdiTransactionType::CustomPayment,
            _ => match format {
                EdiFormat::X12 => EdiTransactionType::X12Payment,
                EdiFormat::Edifact => EdiTransactionType::EdifactPayment,
                EdiFormat::Custom => EdiTransactionType::CustomPayment,
            },
        }
    }
}

impl fmt::Display for EdiTransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A trading partner. File transfer credentials live with the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdiPartner {
    pub partner_id: String,
    pub name: String,
    pub routing_number: Option<String>,
    pub account_number: Option<String>,
    #[serde(rename = "edi_format")]
    pub format: EdiFormat,
    #[serde(default = "default_connection_type")]
    pub connection_type: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_connection_type() -> String {
    "SFTP".to_string()
}

fn default_active() -> bool {
    true
}

impl EdiPartner {
    pub fn new(partner_id: impl Into<String>, name: impl Into<String>, format: EdiFormat) -> Self {
        Self {
            partner_id: partner_id.into(),
            name: name.into(),
            routing_number: None,
            account_number: None,
            format,
            connection_type: default_connection_type(),
            is_active: true,
        }
    }

    pub fn with_account(mut self, routing_number: impl Into<String>, account: impl Into<String>) -> Self {
        self.routing_number = Some(routing_number.into());
        self.account_number = Some(account.into());
        self
    }
}

/// Originator or beneficiary details carried in a payment order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyInfo {
    pub name: String,
    pub id: Option<String>,
    pub bank_id: Option<String>,
    pub routing_number: Option<String>,
    pub account_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdiStatus {
    Pending,
    Sent,
    Failed,
    Acknowledged,
    Rejected,
}

/// A payment order to be exchanged with a partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdiTransaction {
    pub transaction_id: String,
    pub partner_id: String,
    pub transaction_type: EdiTransactionType,
    pub format: EdiFormat,
    pub amount: Decimal,
    pub currency: Currency,
    pub originator: PartyInfo,
    pub beneficiary: PartyInfo,
    pub reference_number: String,
    pub description: Option<String>,
    /// Ledger transaction the order was built from.
    pub source_transaction: Option<TransactionId>,
    /// Interchange control number, echoed by acknowledgments.
    pub control_number: u32,
    /// Rendered document.
    pub message: String,
    pub status: EdiStatus,
    pub failure_reason: Option<String>,
    pub acknowledgment: Option<AckStatus>,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl EdiTransaction {
    /// Interchange control number as it appears on the wire.
    pub fn control_reference(&self) -> String {
        format!("{:09}", self.control_number)
    }

    pub fn file_name(&self) -> String {
        format!("{}.edi", self.transaction_id)
    }
}

/// Input for a new payment order.
#[derive(Debug, Clone)]
pub struct NewEdiTransaction {
    pub partner_id: String,
    pub transaction_type: EdiTransactionType,
    pub amount: Decimal,
    pub currency: Currency,
    pub beneficiary: PartyInfo,
    /// Defaults to the service's configured originator.
    pub originator: Option<PartyInfo>,
    /// Defaults to the generated transaction id.
    pub reference_number: Option<String>,
    pub description: Option<String>,
    pub source_transaction: Option<TransactionId>,
}

impl NewEdiTransaction {
    pub fn new(
        partner_id: impl Into<String>,
        transaction_type: EdiTransactionType,
        amount: Decimal,
        currency: Currency,
        beneficiary: PartyInfo,
    ) -> Self {
        Self {
            partner_id: partner_id.into(),
            transaction_type,
            amount,
            currency,
            beneficiary,
            originator: None,
            reference_number: None,
            description: None,
            source_transaction: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_number = Some(reference.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// EDI settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdiConfig {
    /// Our interchange sender id.
    pub sender_id: String,
    pub originator: PartyInfo,
    /// JSON array of partners loaded at startup.
    pub partners_file: Option<PathBuf>,
}

impl Default for EdiConfig {
    fn default() -> Self {
        Self {
            sender_id: "CLOSEDLOOP".to_string(),
            originator: PartyInfo {
                name: "ClosedLoop Ledger".to_string(),
                id: Some("CL001".to_string()),
                bank_id: Some("CLBANK001".to_string()),
                routing_number: None,
                account_number: None,
            },
            partners_file: None,
        }
    }
}

impl EdiConfig {
    /// Read `EDI_SENDER_ID`, `EDI_ORIGINATOR_NAME`, `EDI_ORIGINATOR_ROUTING`,
    /// `EDI_ORIGINATOR_ACCOUNT` and `EDI_PARTNERS_FILE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(sender) = var("EDI_SENDER_ID") {
            config.sender_id = sender;
        }
        if let Some(name) = var("EDI_ORIGINATOR_NAME") {
            config.originator.name = name;
        }
        config.originator.routing_number = var("EDI_ORIGINATOR_ROUTING");
        config.originator.account_number = var("EDI_ORIGINATOR_ACCOUNT");
        config.partners_file = var("EDI_PARTNERS_FILE").map(PathBuf::from);
        config
    }
}

/// One acknowledged interchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    AcceptedWithErrors,
    PartiallyAccepted,
    Rejected,
    /// A status code we do not know.
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEntry {
    /// Control number of the acknowledged interchange or transaction set.
    pub reference: String,
    pub status: AckStatus,
}

/// A parsed acknowledgment document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub format: EdiFormat,
    pub entries: Vec<AckEntry>,
    pub errors: Vec<String>,
}

impl Acknowledgment {
    /// At least one entry, none rejected, no reported errors.
    pub fn is_success(&self) -> bool {
        !self.entries.is_empty()
            && self.errors.is_empty()
            && self.entries.iter().all(|e| e.status != AckStatus::Rejected)
    }
}

/// What applying an acknowledgment changed.
#[derive(Debug, Clone, PartialEq)]
pub struct AckReport {
    pub acknowledgment: Acknowledgment,
    /// Orders moved to `Acknowledged` or `Rejected`.
    pub updated: Vec<EdiTransaction>,
}

/// Receipt from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdiReceipt {
    pub accepted_at: DateTime<Utc>,
    pub simulated: bool,
}

/// File delivery channel to partners.
#[async_trait]
pub trait EdiTransport: Send + Sync {
    async fn deliver(&self, partner: &EdiPartner, file_name: &str, document: &str) -> Result<EdiReceipt>;
}

/// Transport that accepts every file without contacting the partner.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEdiTransport;

#[async_trait]
impl EdiTransport for NullEdiTransport {
    async fn deliver(&self, _partner: &EdiPartner, _file_name: &str, _document: &str) -> Result<EdiReceipt> {
        Ok(EdiReceipt {
            accepted_at: Utc::now(),
            simulated: true,
        })
    }
}

fn x12_element(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '*' | '~' | '>' | '\r' | '\n') { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn edifact_element(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        match c {
            '?' | '+' | ':' | '\'' => {
                out.push('?');
                out.push(c);
            }
            '\r' | '\n' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

/// Amount with exactly the currency's decimal places.
fn amount_text(tx: &EdiTransaction) -> String {
    let mut amount = tx.currency.quantize(tx.amount);
    amount.rescale(tx.currency.decimal_places());
    amount.to_string()
}

/// Render an X12 820 payment order interchange.
pub fn render_x12_820(tx: &EdiTransaction, sender_id: &str, now: DateTime<Utc>) -> String {
    let control = tx.control_reference();
    let (org, ben) = (&tx.originator, &tx.beneficiary);
    let sender = x12_element(sender_id);
    let receiver = x12_element(&tx.partner_id);

    let body = vec![
        format!("ST*820*{}", control),
        format!(
            "BPR*C*{}*C*{}*CCD*01*{}*DA*{}*01*{}*DA*{}*{}",
            amount_text(tx),
            tx.transaction_type.x12_payment_method(),
            x12_element(opt(&org.routing_number)),
            x12_element(opt(&org.account_number)),
            x12_element(opt(&ben.routing_number)),
            x12_element(opt(&ben.account_number)),
            now.format("%Y%m%d"),
        ),
        format!("TRN*1*{}*{}", x12_element(&tx.reference_number), sender),
        format!("CUR*PR*{}", x12_element(tx.currency.code())),
        format!("N1*PR*{}*91*{}", x12_element(&org.name), x12_element(opt(&org.id))),
        format!("N1*PE*{}*91*{}", x12_element(&ben.name), x12_element(opt(&ben.id))),
        format!("RMR*IV*{}**{}", x12_element(&tx.reference_number), amount_text(tx)),
    ];
    // SE01 counts ST through SE.
    let se = format!("SE*{}*{}", body.len() + 1, control);

    let mut segments = Vec::with_capacity(body.len() + 5);
    segments.push(format!(
        "ISA*00*{:10}*00*{:10}*ZZ*{:<15}*ZZ*{:<15}*{}*{}*U*00401*{}*0*P*>",
        "",
        "",
        sender,
        receiver,
        now.format("%y%m%d"),
        now.format("%H%M"),
        control
    ));
    segments.push(format!(
        "GS*RA*{}*{}*{}*{}*{}*X*004010",
        sender,
        receiver,
        now.format("%Y%m%d"),
        now.format("%H%M"),
        tx.control_number
    ));
    segments.extend(body);
    segments.push(se);
    segments.push(format!("GE*1*{}", tx.control_number));
    segments.push(format!("IEA*1*{}", control));

    segments.iter().map(|s| format!("{}~\n", s)).collect()
}

/// Render an EDIFACT PAYORD interchange.
pub fn render_edifact_payord(tx: &EdiTransaction, sender_id: &str, now: DateTime<Utc>) -> String {
    let control = tx.control_reference();
    let (org, ben) = (&tx.originator, &tx.beneficiary);
    let date = now.format("%y%m%d");
    let time = now.format("%H%M");

    let message = vec![
        "UNH+1+PAYORD:D:96A:UN".to_string(),
        format!("BGM+450+{}+9", edifact_element(&tx.reference_number)),
        format!("DTM+137:{}:102", now.format("%Y%m%d")),
        format!(
            "FII+OR+{}:{}:25",
            edifact_element(opt(&org.account_number)),
            edifact_element(opt(&org.bank_id))
        ),
        format!("NAD+OY++{}", edifact_element(&org.name)),
        format!(
            "FII+BF+{}:{}:25",
            edifact_element(opt(&ben.account_number)),
            edifact_element(opt(&ben.bank_id))
        ),
        format!("NAD+BE++{}", edifact_element(&ben.name)),
        format!("MOA+9:{}:{}", amount_text(tx), edifact_element(tx.currency.code())),
        format!(
            "FTX+PMD+++{}",
            edifact_element(tx.description.as_deref().unwrap_or("Payment"))
        ),
    ];
    // UNT counts UNH through UNT.
    let unt = format!("UNT+{}+1", message.len() + 1);

    let mut segments = Vec::with_capacity(message.len() + 3);
    segments.push(format!(
        "UNB+UNOA:2+{}+{}+{}:{}+{}",
        edifact_element(sender_id),
        edifact_element(&tx.partner_id),
        date,
        time,
        control
    ));
    segments.extend(message);
    segments.push(unt);
    segments.push(format!("UNZ+1+{}", control));

    segments.iter().map(|s| format!("{}'\n", s)).collect()
}

/// Render a JSON payment document for partners without a standard format.
pub fn render_custom(tx: &EdiTransaction) -> Result<String> {
    serde_json::to_string_pretty(&json!({
        "transaction_id": tx.transaction_id,
        "reference_number": tx.reference_number,
        "control_number": tx.control_reference(),
        "transaction_type": tx.transaction_type.code(),
        "amount": amount_text(tx),
        "currency": tx.currency.code(),
        "originator": tx.originator,
        "beneficiary": tx.beneficiary,
        "description": tx.description,
        "created_at": tx.created_at,
    }))
    .map_err(|e| EdiError::Transport(e.to_string()))
}

fn segments(content: &str, terminator: char) -> impl Iterator<Item = &str> {
    content
        .split(move |c: char| c == terminator || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parse an X12 997 functional acknowledgment.
pub fn parse_x12_997(content: &str) -> Result<Acknowledgment> {
    let mut saw_header = false;
    let mut entries: Vec<AckEntry> = Vec::new();
    let mut errors = Vec::new();

    for segment in segments(content, '~') {
        let parts: Vec<&str> = segment.split('*').collect();
        match parts[0] {
            "ST" if parts.get(1) == Some(&"997") => saw_header = true,
            "AK2" => match parts.get(2) {
                Some(control) => entries.push(AckEntry {
                    reference: control.to_string(),
                    status: AckStatus::Unrecognized(String::new()),
                }),
                None => errors.push(format!("AK2 without a control number: {}", segment)),
            },
            "AK5" => {
                let status = match parts.get(1).copied() {
                    Some("A") => AckStatus::Accepted,
                    Some("E") => AckStatus::AcceptedWithErrors,
                    Some("P") => AckStatus::PartiallyAccepted,
                    Some("R") => AckStatus::Rejected,
                    other => AckStatus::Unrecognized(other.unwrap_or_default().to_string()),
                };
                match entries.last_mut() {
                    Some(entry) => entry.status = status,
                    None => errors.push("AK5 before any AK2".to_string()),
                }
            }
            _ => {}
        }
    }

    if !saw_header {
        return Err(EdiError::MalformedAcknowledgment("no ST*997 segment".to_string()));
    }
    if entries.is_empty() {
        errors.push("no transaction set responses".to_string());
    }
    Ok(Acknowledgment {
        format: EdiFormat::X12,
        entries,
        errors,
    })
}

/// Parse an EDIFACT CONTRL message. Each `UCI` segment acknowledges one
/// interchange; its fourth element is the action code.
pub fn parse_edifact_contrl(content: &str) -> Result<Acknowledgment> {
    let mut saw_header = false;
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for segment in segments(content, '\'') {
        let parts: Vec<&str> = segment.split('+').collect();
        match parts[0] {
            "UNH" if parts.get(2).is_some_and(|t| t.starts_with("CONTRL")) => saw_header = true,
            "UCI" => {
                let (Some(reference), Some(action)) = (parts.get(1), parts.get(4)) else {
                    errors.push(format!("short UCI segment: {}", segment));
                    continue;
                };
                let status = match *action {
                    "7" => AckStatus::Accepted,
                    "4" => AckStatus::Rejected,
                    other => AckStatus::Unrecognized(other.to_string()),
                };
                entries.push(AckEntry {
                    reference: reference.to_string(),
                    status,
                });
            }
            _ => {}
        }
    }

    if !saw_header {
        return Err(EdiError::MalformedAcknowledgment("no CONTRL message header".to_string()));
    }
    if entries.is_empty() {
        errors.push("no interchange responses".to_string());
    }
    Ok(Acknowledgment {
        format: EdiFormat::Edifact,
        entries,
        errors,
    })
}

#[derive(Deserialize)]
struct CustomAck {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    transactions: Vec<AckEntry>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Parse a JSON acknowledgment, or a plain-text one mentioning SUCCESS or
/// FAILURE.
pub fn parse_custom_ack(content: &str) -> Acknowledgment {
    if let Ok(ack) = serde_json::from_str::<CustomAck>(content) {
        let mut errors = ack.errors;
        if !ack.success && errors.is_empty() {
            errors.push("partner reported failure".to_string());
        }
        return Acknowledgment {
            format: EdiFormat::Custom,
            entries: ack.transactions,
            errors,
        };
    }

    let upper = content.to_ascii_uppercase();
    let (entries, errors) = if upper.contains("FAILURE") || upper.contains("ERROR") {
        (Vec::new(), vec!["failure indicated in response".to_string()])
    } else if upper.contains("SUCCESS") {
        let entry = AckEntry {
            reference: String::new(),
            status: AckStatus::Accepted,
        };
        (vec![entry], Vec::new())
    } else {
        (Vec::new(), vec!["could not determine the outcome".to_string()])
    };
    Acknowledgment {
        format: EdiFormat::Custom,
        entries,
        errors,
    }
}

/// EDI service with an explicit configuration and transport.
pub struct EdiService {
    config: EdiConfig,
    transport: Arc<dyn EdiTransport>,
    partners: DashMap<String, EdiPartner>,
    transactions: DashMap<String, EdiTransaction>,
    next_control: AtomicU32,
}

impl EdiService {
    pub fn new(config: EdiConfig, transport: Arc<dyn EdiTransport>) -> Self {
        Self {
            config,
            transport,
            partners: DashMap::new(),
            transactions: DashMap::new(),
            next_control: AtomicU32::new(1),
        }
    }

    /// Service with the null transport, for development and tests.
    pub fn simulated(config: EdiConfig) -> Self {
        Self::new(config, Arc::new(NullEdiTransport))
    }

    pub fn config(&self) -> &EdiConfig {
        &self.config
    }

    /// Add or replace a partner.
    pub fn add_partner(&self, partner: EdiPartner) {
        info!(partner_id = %partner.partner_id, format = %partner.format, "EDI partner registered");
        self.partners.insert(partner.partner_id.clone(), partner);
    }

    pub fn get_partner(&self, partner_id: &str) -> Result<EdiPartner> {
        self.partners
            .get(partner_id)
            .map(|p| p.clone())
            .ok_or_else(|| EdiError::PartnerNotFound(partner_id.to_string()))
    }

    /// Partners sorted by id.
    pub fn list_partners(&self) -> Vec<EdiPartner> {
        let mut partners: Vec<_> = self.partners.iter().map(|p| p.clone()).collect();
        partners.sort_by(|a, b| a.partner_id.cmp(&b.partner_id));
        partners
    }

    pub fn remove_partner(&self, partner_id: &str) -> bool {
        self.partners.remove(partner_id).is_some()
    }

    /// Load partners from a JSON array file, replacing entries with the same id.
    pub fn load_partners(&self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EdiError::PartnerFile(format!("{}: {}", path.display(), e)))?;
        let partners: Vec<EdiPartner> = serde_json::from_str(&text)
            .map_err(|e| EdiError::PartnerFile(format!("{}: {}", path.display(), e)))?;
        let count = partners.len();
        for partner in partners {
            self.partners.insert(partner.partner_id.clone(), partner);
        }
        info!(count, path = %path.display(), "Loaded EDI partners");
        Ok(count)
    }

    fn active_partner(&self, partner_id: &str) -> Result<EdiPartner> {
        let partner = self.get_partner(partner_id)?;
        if !partner.is_active {
            return Err(EdiError::PartnerInactive(partner.partner_id));
        }
        Ok(partner)
    }

    /// Build and store a payment order for an active partner, rendering it in
    /// the partner's format.
    #[instrument(skip(self, request), fields(partner_id = %request.partner_id, transaction_type = %request.transaction_type))]
    pub fn create_transaction(&self, request: NewEdiTransaction) -> Result<EdiTransaction> {
        let partner = self.active_partner(&request.partner_id)?;
        if !request.transaction_type.fits(partner.format) {
            return Err(EdiError::UnsupportedTransactionType {
                transaction_type: request.transaction_type,
                format: partner.format,
            });
        }
        if request.amount <= Decimal::ZERO {
            return Err(EdiError::InvalidAmount(request.amount));
        }

        let transaction_id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let mut tx = EdiTransaction {
            reference_number: request
                .reference_number
                .unwrap_or_else(|| transaction_id.clone()),
            transaction_id,
            partner_id: partner.partner_id.clone(),
            transaction_type: request.transaction_type,
            format: partner.format,
            amount: request.amount,
            currency: request.currency,
            originator: request
                .originator
                .unwrap_or_else(|| self.config.originator.clone()),
            beneficiary: request.beneficiary,
            description: request.description,
            source_transaction: request.source_transaction,
            control_number: self.next_control.fetch_add(1, Ordering::Relaxed) % 1_000_000_000,
            message: String::new(),
            status: EdiStatus::Pending,
            failure_reason: None,
            acknowledgment: None,
            simulated: false,
            created_at: now,
            sent_at: None,
        };
        tx.message = match partner.format {
            EdiFormat::X12 => render_x12_820(&tx, &self.config.sender_id, now),
            EdiFormat::Edifact => render_edifact_payord(&tx, &self.config.sender_id, now),
            EdiFormat::Custom => render_custom(&tx)?,
        };

        self.transactions.insert(tx.transaction_id.clone(), tx.clone());
        info!(edi_transaction_id = %tx.transaction_id, control = tx.control_number, "EDI payment order created");
        Ok(tx)
    }

    /// Payment order for a ledger transaction. The beneficiary comes from the
    /// transaction's counterparty, falling back to the partner's own account.
    pub fn from_ledger_transaction(&self, tx: &Transaction, partner_id: &str) -> Result<EdiTransaction> {
        let partner = self.active_partner(partner_id)?;
        let counterparty = tx.counterparty.clone().unwrap_or_default();
        let beneficiary = PartyInfo {
            name: Some(counterparty.name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| partner.name.clone()),
            id: None,
            bank_id: counterparty
                .bank_swift
                .or_else(|| Some(partner.partner_id.clone())),
            routing_number: partner.routing_number.clone(),
            account_number: counterparty.account.or_else(|| partner.account_number.clone()),
        };

        let mut request = NewEdiTransaction::new(
            partner_id,
            EdiTransactionType::for_ledger(tx.transaction_type, partner.format),
            tx.amount,
            tx.currency.clone(),
            beneficiary,
        )
        .with_reference(tx.id.as_str());
        request.description = tx.description.clone();
        request.source_transaction = Some(tx.id.clone());
        self.create_transaction(request)
    }

    /// Deliver a stored order. The record ends `Sent`, or `Failed` when the
    /// transport refuses it.
    #[instrument(skip(self))]
    pub async fn send(&self, transaction_id: &str) -> Result<EdiTransaction> {
        let tx = self.get_transaction(transaction_id)?;
        let partner = self.active_partner(&tx.partner_id)?;
        let outcome = self
            .transport
            .deliver(&partner, &tx.file_name(), &tx.message)
            .await;

        let mut stored = self
            .transactions
            .get_mut(transaction_id)
            .ok_or_else(|| EdiError::TransactionNotFound(transaction_id.to_string()))?;
        match outcome {
            Ok(receipt) => {
                stored.status = EdiStatus::Sent;
                stored.sent_at = Some(receipt.accepted_at);
                stored.simulated = receipt.simulated;
                if receipt.simulated {
                    warn!(edi_transaction_id = %transaction_id, "EDI delivery is simulated; partner not contacted");
                } else {
                    info!(edi_transaction_id = %transaction_id, partner = %partner.name, "EDI file delivered");
                }
                Ok(stored.clone())
            }
            Err(e) => {
                stored.status = EdiStatus::Failed;
                stored.failure_reason = Some(e.to_string());
                warn!(edi_transaction_id = %transaction_id, error = %e, "EDI delivery failed");
                Err(e)
            }
        }
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<EdiTransaction> {
        self.transactions
            .get(transaction_id)
            .map(|t| t.clone())
            .ok_or_else(|| EdiError::TransactionNotFound(transaction_id.to_string()))
    }

    /// Orders sent to a partner, oldest first.
    pub fn transactions_for_partner(&self, partner_id: &str) -> Vec<EdiTransaction> {
        let mut txs: Vec<_> = self
            .transactions
            .iter()
            .filter(|t| t.partner_id == partner_id)
            .map(|t| t.clone())
            .collect();
        txs.sort_by_key(|t| (t.created_at, t.control_number));
        txs
    }

    /// Parse an acknowledgment in the partner's format and apply each entry
    /// to the sent order with the matching control number.
    #[instrument(skip(self, content))]
    pub fn process_acknowledgment(&self, partner_id: &str, content: &str) -> Result<AckReport> {
        let partner = self.get_partner(partner_id)?;
        let ack = match partner.format {
            EdiFormat::X12 => parse_x12_997(content)?,
            EdiFormat::Edifact => parse_edifact_contrl(content)?,
            EdiFormat::Custom => parse_custom_ack(content),
        };

        let mut updated = Vec::new();
        for entry in &ack.entries {
            let Ok(control) = entry.reference.trim().parse::<u32>() else {
                continue;
            };
            let matched = self.transactions.iter_mut().find(|t| {
                t.partner_id == partner.partner_id
                    && t.control_number == control
                    && t.status == EdiStatus::Sent
            });
            let Some(mut tx) = matched else {
                warn!(reference = %entry.reference, "Acknowledgment for an unknown interchange");
                continue;
            };
            tx.status = match entry.status {
                AckStatus::Rejected => EdiStatus::Rejected,
                _ => EdiStatus::Acknowledged,
            };
            tx.acknowledgment = Some(entry.status.clone());
            updated.push(tx.clone());
        }

        if ack.is_success() {
            info!(entries = ack.entries.len(), "EDI acknowledgment accepted");
        } else {
            warn!(errors = ?ack.errors, "EDI acknowledgment reports problems");
        }
        Ok(AckReport {
            acknowledgment: ack,
            updated,
        })
    }
}
