//! SWIFT MT103/MT202 message generation and parsing.
//!
//! Messages use the FIN block layout (`{1:}` basic header, `{2:}` application
//! header, optional `{3:}` user header carrying the gpi UETR, `{4:}` text
//! block) with a pragmatic subset of fields. Field content is not validated
//! against the full ISO 15022 grammar.

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use closedloop_common::{
    Counterparty, Currency, Money, SwiftCode, Transaction, TransactionType, UserId,
};
use closedloop_crypto::sha256_hex;

pub const MT103: &str = "103";
pub const MT202: &str = "202";

/// Maximum characters per line of free text.
pub const LINE_WIDTH: usize = 35;

/// Maximum lines in a name-and-address or remittance field.
pub const MAX_LINES: usize = 4;

const CRLF: &str = "\r\n";

/// Errors from parsing a SWIFT message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwiftParseError {
    #[error("Missing block {{{0}:}}")]
    MissingBlock(u8),

    #[error("Malformed header: {0}")]
    InvalidHeader(String),

    #[error("Invalid BIC in header: {0}")]
    InvalidBic(String),

    #[error("Text block is not terminated by -}}")]
    UnterminatedTextBlock,

    #[error("Missing field :{0}:")]
    MissingField(&'static str),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// The message type does not carry a payment.
    #[error("MT{0} is not a payment message")]
    NotAPayment(String),
}

/// Details of charges (field 71A).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Charges {
    /// Ordering customer pays all charges.
    Our,
    /// Charges are shared.
    #[default]
    Sha,
    /// Beneficiary pays all charges.
    Ben,
}

impl Charges {
    pub fn as_str(&self) -> &'static str {
        match self {
            Charges::Our => "OUR",
            Charges::Sha => "SHA",
            Charges::Ben => "BEN",
        }
    }
}

/// A fresh gpi unique end-to-end transaction reference.
pub fn new_uetr() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Upper-case free text, split into at most `max_lines` lines of `LINE_WIDTH` characters.
fn text_lines(value: &str, max_lines: usize) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(max_lines)
        .map(|line| line.to_uppercase().chars().take(LINE_WIDTH).collect())
        .collect()
}

fn single_line(value: &str) -> String {
    text_lines(value, 1).into_iter().next().unwrap_or_default()
}

/// `:32A:` content, `YYMMDD` + currency + amount with a comma decimal separator.
fn value_date_amount(date: NaiveDate, amount: &Money) -> String {
    format!("{}{}{}", date.format("%y%m%d"), amount.currency, swift_amount(amount))
}

fn swift_amount(amount: &Money) -> String {
    let places = amount.currency.decimal_places();
    let mut value = amount.currency.quantize(amount.value);
    value.rescale(places);
    let text = value.to_string().replace('.', ",");
    if places == 0 {
        format!("{},", text)
    } else {
        text
    }
}

struct Field {
    tag: &'static str,
    lines: Vec<String>,
}

impl Field {
    fn new(tag: &'static str, lines: Vec<String>) -> Self {
        Self { tag, lines }
    }

    fn line(tag: &'static str, value: impl Into<String>) -> Self {
        Self::new(tag, vec![value.into()])
    }
}

fn render(
    message_type: &str,
    sender: &SwiftCode,
    receiver: &SwiftCode,
    uetr: Option<&str>,
    fields: &[Field],
) -> String {
    let mut out = format!(
        "{{1:F01{}0000000000}}{{2:I{}{}N}}",
        sender.logical_terminal(),
        message_type,
        receiver.logical_terminal()
    );
    if let Some(uetr) = uetr {
        out.push_str(&format!("{{3:{{121:{}}}}}", uetr));
    }
    out.push_str("{4:");
    for field in fields.iter().filter(|f| !f.lines.is_empty()) {
        out.push_str(CRLF);
        out.push(':');
        out.push_str(field.tag);
        out.push(':');
        out.push_str(&field.lines.join(CRLF));
    }
    out.push_str(CRLF);
    out.push_str("-}");
    out
}

/// MT103 single customer credit transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mt103 {
    pub sender: SwiftCode,
    pub receiver: SwiftCode,
    /// Sender's reference (`:20:`).
    pub reference: String,
    pub value_date: NaiveDate,
    pub amount: Money,
    /// Ordering customer name and address (`:50K:`).
    pub ordering_customer: String,
    pub ordering_account: Option<String>,
    /// Account with institution (`:57A:`). Defaults to the receiver.
    pub account_with_institution: Option<SwiftCode>,
    pub beneficiary_name: String,
    pub beneficiary_account: String,
    /// Remittance information (`:70:`).
    pub remittance_info: Option<String>,
    pub charges: Charges,
    pub uetr: Option<String>,
}

impl Mt103 {
    /// Build an MT103 for an outgoing transaction paid to its counterparty.
    pub fn from_transaction(
        tx: &Transaction,
        sender: SwiftCode,
        receiver: SwiftCode,
        ordering_customer: impl Into<String>,
    ) -> Result<Self, SwiftParseError> {
        let counterparty = tx
            .counterparty
            .as_ref()
            .ok_or(SwiftParseError::MissingField("59"))?;
        let beneficiary_account = counterparty
            .account
            .clone()
            .ok_or(SwiftParseError::MissingField("59"))?;
        let account_with_institution = counterparty
            .bank_swift
            .as_deref()
            .map(|code| SwiftCode::parse(code).map_err(|_| SwiftParseError::InvalidBic(code.into())))
            .transpose()?;

        Ok(Self {
            sender,
            receiver,
            reference: tx.id.to_string(),
            value_date: tx.created_at.date_naive(),
            amount: tx.money(),
            ordering_customer: ordering_customer.into(),
            ordering_account: None,
            account_with_institution,
            beneficiary_name: counterparty.name.clone(),
            beneficiary_account,
            remittance_info: tx.description.clone(),
            charges: Charges::default(),
            uetr: Some(new_uetr()),
        })
    }

    /// Render the FIN text of the message.
    pub fn render(&self) -> String {
        let mut ordering = Vec::new();
        if let Some(account) = &self.ordering_account {
            ordering.push(format!("/{}", single_line(account)));
        }
        ordering.extend(text_lines(&self.ordering_customer, MAX_LINES - ordering.len()));

        let mut beneficiary = vec![format!("/{}", single_line(&self.beneficiary_account))];
        beneficiary.extend(text_lines(&self.beneficiary_name, MAX_LINES - 1));

        let account_with = self.account_with_institution.as_ref().unwrap_or(&self.receiver);
        let fields = [
            Field::line("20", single_line(&self.reference)),
            Field::line("23B", "CRED"),
            Field::line("32A", value_date_amount(self.value_date, &self.amount)),
            Field::new("50K", ordering),
            Field::line("52A", self.sender.as_str()),
            Field::line("57A", account_with.as_str()),
            Field::new("59", beneficiary),
            Field::new(
                "70",
                self.remittance_info
                    .as_deref()
                    .map(|info| text_lines(info, MAX_LINES))
                    .unwrap_or_default(),
            ),
            Field::line("71A", self.charges.as_str()),
        ];
        render(MT103, &self.sender, &self.receiver, self.uetr.as_deref(), &fields)
    }
}

/// MT202 general financial institution transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mt202 {
    pub sender: SwiftCode,
    pub receiver: SwiftCode,
    pub reference: String,
    /// Related reference (`:21:`), usually the underlying MT103 reference.
    pub related_reference: String,
    pub value_date: NaiveDate,
    pub amount: Money,
    pub account_with_institution: Option<SwiftCode>,
    pub beneficiary_institution: SwiftCode,
    pub uetr: Option<String>,
}

impl Mt202 {
    pub fn render(&self) -> String {
        let account_with = self.account_with_institution.as_ref().unwrap_or(&self.receiver);
        let fields = [
            Field::line("20", single_line(&self.reference)),
            Field::line("21", single_line(&self.related_reference)),
            Field::line("32A", value_date_amount(self.value_date, &self.amount)),
            Field::line("52A", self.sender.as_str()),
            Field::line("57A", account_with.as_str()),
            Field::line("58A", self.beneficiary_institution.as_str()),
        ];
        render(MT202, &self.sender, &self.receiver, self.uetr.as_deref(), &fields)
    }
}

/// The fields extracted from one incoming SWIFT message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSwiftMessage {
    /// Three-digit MT number, e.g. `103`.
    pub message_type: String,
    pub sender: SwiftCode,
    pub receiver: SwiftCode,
    pub reference: String,
    pub related_reference: Option<String>,
    pub value_date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub beneficiary_name: Option<String>,
    pub beneficiary_account: Option<String>,
    pub receiving_institution: Option<String>,
    pub uetr: Option<String>,
    pub raw: String,
}

impl ParsedSwiftMessage {
    pub fn is_payment(&self) -> bool {
        matches!(self.message_type.as_str(), MT103 | MT202)
    }

    /// Idempotency key for importing this message: the UETR when present,
    /// otherwise a digest of the raw text.
    pub fn import_key(&self) -> String {
        match &self.uetr {
            Some(uetr) => format!("swift:{}", uetr),
            None => format!("swift:{}", sha256_hex(self.raw.trim().as_bytes())),
        }
    }

    /// Build a pending transaction record for an incoming payment.
    pub fn to_transaction(&self, user_id: UserId) -> Result<Transaction, SwiftParseError> {
        if !self.is_payment() {
            return Err(SwiftParseError::NotAPayment(self.message_type.clone()));
        }
        let amount = self.amount.clone().ok_or(SwiftParseError::MissingField("32A"))?;
        let transaction_type = if self.raw.contains("IBAN") {
            TransactionType::InternationalWire
        } else {
            TransactionType::SwiftTransfer
        };

        let mut tx = Transaction::new(
            user_id,
            amount,
            transaction_type,
            Some(format!("SWIFT MT{} {}", self.message_type, self.reference)),
        )
        .with_idempotency_key(Some(self.import_key()))
        .with_metadata(json!({
            "swift_message_type": self.message_type,
            "sender_bic": self.sender.as_str(),
            "receiver_bic": self.receiver.as_str(),
            "related_reference": self.related_reference,
            "value_date": self.value_date,
            "uetr": self.uetr,
        }));
        tx.external_id = Some(self.reference.clone());

        if self.beneficiary_name.is_some() || self.beneficiary_account.is_some() {
            tx = tx.with_counterparty(Counterparty::at_institution(
                self.beneficiary_name.clone().unwrap_or_default(),
                self.beneficiary_account.clone(),
                self.receiving_institution.clone(),
            ));
        }
        Ok(tx)
    }
}

/// Content of a `{n:...}` block, up to its first closing brace.
fn block<'a>(raw: &'a str, open: &str) -> Option<&'a str> {
    let start = raw.find(open)? + open.len();
    let rest = &raw[start..];
    rest.find('}').map(|end| &rest[..end])
}

fn terminal_code(terminal: Option<&str>, header: &str) -> Result<SwiftCode, SwiftParseError> {
    let terminal = terminal.ok_or_else(|| SwiftParseError::InvalidHeader(header.to_string()))?;
    SwiftCode::from_logical_terminal(terminal)
        .map_err(|_| SwiftParseError::InvalidBic(terminal.to_string()))
}

/// Split `:TAG:value` where TAG is two digits and an optional option letter.
fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(':')?;
    let end = rest.find(':')?;
    let tag = &rest[..end];
    let valid = matches!(tag.len(), 2 | 3)
        && tag.as_bytes()[..2].iter().all(u8::is_ascii_digit)
        && tag.as_bytes()[2..].iter().all(u8::is_ascii_uppercase);
    valid.then(|| (tag, &rest[end + 1..]))
}

fn parse_fields(text: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if let Some((tag, value)) = split_tag(line) {
            fields.push((tag.to_string(), value.trim().to_string()));
        } else if let Some((_, value)) = fields.last_mut() {
            if !line.trim().is_empty() {
                value.push('\n');
                value.push_str(line.trim());
            }
        }
    }
    fields
}

fn field<'a>(fields: &'a [(String, String)], tag: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(t, _)| t == tag)
        .map(|(_, value)| value.as_str())
}

fn first_line(value: &str) -> Option<String> {
    value
        .lines()
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

fn parse_amount(text: &str) -> Result<Decimal, SwiftParseError> {
    let normalized = text.trim().replace(',', ".");
    Decimal::from_str(normalized.trim_end_matches('.'))
        .map_err(|_| SwiftParseError::InvalidAmount(text.to_string()))
}

/// Split `CCYamount` into currency and amount.
fn currency_amount(text: &str) -> Result<Money, SwiftParseError> {
    let split = text
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| SwiftParseError::InvalidAmount(text.to_string()))?;
    let (code, amount) = text.split_at(split);
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SwiftParseError::InvalidAmount(text.to_string()));
    }
    Ok(Money::new(parse_amount(amount)?, Currency::new(code)))
}

fn parse_value_date(text: &str) -> Result<NaiveDate, SwiftParseError> {
    let invalid = || SwiftParseError::InvalidDate(text.to_string());
    let digits = text.as_bytes().get(..6).ok_or_else(invalid)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let number = |at: usize| u32::from(digits[at] - b'0') * 10 + u32::from(digits[at + 1] - b'0');
    let (year, month, day) = (number(0), number(2), number(4));
    NaiveDate::from_ymd_opt(2000 + year as i32, month, day).ok_or_else(invalid)
}

/// Beneficiary name and `/account` from field 59.
fn beneficiary(value: &str) -> (Option<String>, Option<String>) {
    let mut lines = value.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some(first) if first.starts_with('/') => {
            let account = Some(first.trim_start_matches('/').to_string()).filter(|a| !a.is_empty());
            (lines.next().map(str::to_string), account)
        }
        Some(first) => (Some(first.to_string()), None),
        None => (None, None),
    }
}

/// Parse a single message starting at its `{1:` block.
pub fn parse_message(raw: &str) -> Result<ParsedSwiftMessage, SwiftParseError> {
    let basic = block(raw, "{1:").ok_or(SwiftParseError::MissingBlock(1))?;
    let own_code = terminal_code(basic.get(3..15), basic)?;

    let application = block(raw, "{2:").ok_or(SwiftParseError::MissingBlock(2))?;
    let message_type = application
        .get(1..4)
        .filter(|t| t.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| SwiftParseError::InvalidHeader(application.to_string()))?
        .to_string();
    let (sender, receiver) = match application.chars().next() {
        // I + type + receiver terminal
        Some('I') => (own_code, terminal_code(application.get(4..16), application)?),
        // O + type + input time + input date + sender terminal
        Some('O') => (terminal_code(application.get(14..26), application)?, own_code),
        _ => return Err(SwiftParseError::InvalidHeader(application.to_string())),
    };

    let text_start = raw.find("{4:").ok_or(SwiftParseError::MissingBlock(4))? + 3;
    let text = &raw[text_start..];
    let text = &text[..text.find("-}").ok_or(SwiftParseError::UnterminatedTextBlock)?];
    let fields = parse_fields(text);

    let reference = field(&fields, "20")
        .and_then(first_line)
        .ok_or(SwiftParseError::MissingField("20"))?;

    let (value_date, amount) = match (field(&fields, "32A"), field(&fields, "33B")) {
        (Some(value), _) => {
            let value = value.trim();
            let date = parse_value_date(value)?;
            (Some(date), Some(currency_amount(value.get(6..).unwrap_or_default())?))
        }
        (None, Some(value)) => (None, Some(currency_amount(value.trim())?)),
        (None, None) => (None, None),
    };

    let (beneficiary_name, beneficiary_account) = fields
        .iter()
        .find(|(tag, _)| tag.starts_with("59"))
        .map(|(_, value)| beneficiary(value))
        .unwrap_or((None, None));

    let parsed = ParsedSwiftMessage {
        message_type,
        sender,
        receiver,
        reference,
        related_reference: field(&fields, "21").and_then(first_line),
        value_date,
        amount,
        beneficiary_name,
        beneficiary_account,
        receiving_institution: field(&fields, "57A").and_then(first_line),
        uetr: block(raw, "{121:")
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string),
        raw: raw.to_string(),
    };
    debug!(
        message_type = %parsed.message_type,
        reference = %parsed.reference,
        sender = %parsed.sender,
        "Parsed SWIFT message"
    );
    Ok(parsed)
}

/// Parse every message in a file of concatenated SWIFT messages.
///
/// Each message yields its own result; one malformed message does not stop
/// the rest. Non-blank text before the first `{1:` is reported as a message
/// without a basic header.
pub fn parse_messages(content: &str) -> Vec<Result<ParsedSwiftMessage, SwiftParseError>> {
    let mut chunks = content.split("{1:");
    let mut results = Vec::new();

    if let Some(leading) = chunks.next() {
        if !leading.trim().is_empty() {
            results.push(Err(SwiftParseError::MissingBlock(1)));
        }
    }
    for chunk in chunks {
        let result = parse_message(&format!("{{1:{}", chunk));
        if let Err(e) = &result {
            warn!(error = %e, "Could not parse SWIFT message");
        }
        results.push(result);
    }
    results
}
