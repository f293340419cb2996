//! Payment gateway status mapping and webhook signature verification.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use closedloop_common::{LedgerError, TransactionStatus};
use closedloop_crypto::{hmac_sha256_hex, verify_hmac_sha256_hex, CryptoError};

/// External payment processors the platform reconciles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Stripe,
    #[serde(rename = "paypal")]
    PayPal,
    Flutterwave,
    Coinbase,
    /// The platform's own hosted gateway.
    NvcGlobal,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Stripe => "stripe",
            GatewayKind::PayPal => "paypal",
            GatewayKind::Flutterwave => "flutterwave",
            GatewayKind::Coinbase => "coinbase",
            GatewayKind::NvcGlobal => "nvc_global",
        }
    }

    /// Header carrying the webhook signature.
    pub fn signature_header(&self) -> &'static str {
        match self {
            GatewayKind::Stripe => "Stripe-Signature",
            GatewayKind::PayPal => "PayPal-Transmission-Sig",
            GatewayKind::Flutterwave => "verif-hash",
            GatewayKind::Coinbase => "X-CC-Webhook-Signature",
            GatewayKind::NvcGlobal => "X-NVC-Signature",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(GatewayKind::Stripe),
            "paypal" => Ok(GatewayKind::PayPal),
            "flutterwave" => Ok(GatewayKind::Flutterwave),
            "coinbase" => Ok(GatewayKind::Coinbase),
            "nvc_global" | "nvc" => Ok(GatewayKind::NvcGlobal),
            other => Err(LedgerError::Configuration(format!(
                "unknown payment gateway {:?}",
                other
            ))),
        }
    }
}

/// Largest accepted gap, in seconds, between a Stripe signature timestamp and now.
pub const STRIPE_TOLERANCE_SECS: i64 = 300;

/// Map a processor-reported payment status onto a transaction status.
///
/// Matching ignores case. `None` means the status is not part of the
/// gateway's vocabulary and the transaction should be left as it is.
pub fn map_gateway_status(kind: GatewayKind, status: &str) -> Option<TransactionStatus> {
    use TransactionStatus::*;

    let status = status.trim().to_ascii_lowercase();
    let mapped = match (kind, status.as_str()) {
        (GatewayKind::Stripe, "succeeded") => Completed,
        (GatewayKind::Stripe, "processing") => Processing,
        (
            GatewayKind::Stripe,
            "requires_payment_method" | "requires_confirmation" | "requires_action",
        ) => Pending,
        (GatewayKind::Stripe, "canceled") => Failed,

        (GatewayKind::PayPal, "created" | "pending") => Pending,
        (GatewayKind::PayPal, "approved") => Processing,
        (GatewayKind::PayPal, "completed") => Completed,
        (GatewayKind::PayPal, "canceled" | "failed") => Failed,

        (GatewayKind::Flutterwave, "successful") => Completed,
        (GatewayKind::Flutterwave, "failed") => Failed,
        (GatewayKind::Flutterwave, "cancelled") => Cancelled,

        (GatewayKind::Coinbase, "new" | "pending") => Pending,
        (GatewayKind::Coinbase, "completed" | "resolved") => Completed,
        (GatewayKind::Coinbase, "expired" | "canceled") => Failed,
        (GatewayKind::Coinbase, "unresolved" | "delayed") => Processing,

        (GatewayKind::NvcGlobal, "processing") => Processing,
        (GatewayKind::NvcGlobal, "completed") => Completed,
        (GatewayKind::NvcGlobal, "failed") => Failed,
        (GatewayKind::NvcGlobal, "refunded") => Refunded,

        _ => {
            warn!(gateway = %kind, status = %status, "Unrecognized gateway status");
            return None;
        }
    };
    Some(mapped)
}

/// Verifies HMAC-SHA256 webhook signatures for one gateway.
///
/// Stripe signs `timestamp.payload` and sends `t=<timestamp>,v1=<hex>`; the
/// timestamp must be within [`STRIPE_TOLERANCE_SECS`] of now. The other
/// gateways send the hex digest of the raw payload. Comparison is constant
/// time. An empty secret never verifies.
#[derive(Clone)]
pub struct WebhookVerifier {
    kind: GatewayKind,
    secret: Vec<u8>,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("kind", &self.kind)
            .field("secret_set", &!self.secret.is_empty())
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(kind: GatewayKind, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            secret: secret.into(),
        }
    }

    pub fn kind(&self) -> GatewayKind {
        self.kind
    }

    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        self.verify_at(payload, signature, Utc::now().timestamp())
    }

    /// Verify as if the current Unix time were `now`.
    pub fn verify_at(&self, payload: &[u8], signature: &str, now: i64) -> bool {
        let valid = match self.kind {
            GatewayKind::Stripe => self.verify_stripe(payload, signature, now),
            _ => verify_hmac_sha256_hex(&self.secret, payload, signature.trim()),
        };
        if !valid {
            warn!(gateway = %self.kind, "Webhook signature rejected");
        }
        valid
    }

    fn verify_stripe(&self, payload: &[u8], header: &str, now: i64) -> bool {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let Some(timestamp) = timestamp else {
            return false;
        };
        match timestamp.parse::<i64>() {
            Ok(t) if now.abs_diff(t) <= STRIPE_TOLERANCE_SECS.unsigned_abs() => {}
            _ => return false,
        }
        let signed = stripe_signed_payload(timestamp, payload);
        candidates
            .into_iter()
            .any(|candidate| verify_hmac_sha256_hex(&self.secret, &signed, candidate))
    }

    /// Produce the signature header value a gateway would send for `payload`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, CryptoError> {
        match self.kind {
            GatewayKind::Stripe => {
                let signed = stripe_signed_payload(&timestamp.to_string(), payload);
                Ok(format!("t={},v1={}", timestamp, hmac_sha256_hex(&self.secret, &signed)?))
            }
            _ => hmac_sha256_hex(&self.secret, payload),
        }
    }
}

fn stripe_signed_payload(timestamp: &str, payload: &[u8]) -> Vec<u8> {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    signed
}
