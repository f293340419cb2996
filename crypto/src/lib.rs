//! ClosedLoop Cryptographic Primitives
//!
//! Hashing and HMAC signatures for gateway webhooks and telex requests.

pub mod hash;
pub mod mac;

pub use hash::{sha256, sha256_hex};
pub use mac::{hmac_sha256_hex, nonce_hex, verify_hmac_sha256_hex};

/// Errors from keyed operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
