//! HMAC-SHA256 signing and verification.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &[u8]) -> Result<HmacSha256> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidKey("empty secret".to_string()));
    }
    HmacSha256::new_from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Sign `payload` with `secret`, returning the lowercase hex digest.
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = keyed(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA256 signature in constant time.
///
/// An empty secret or a malformed signature never verifies.
pub fn verify_hmac_sha256_hex(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = keyed(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Random nonce of `bytes` bytes, hex encoded.
pub fn nonce_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_vector() {
        let sig = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify() {
        let sig = hmac_sha256_hex(b"whsec", b"{\"id\":1}").unwrap();
        assert!(verify_hmac_sha256_hex(b"whsec", b"{\"id\":1}", &sig));
        assert!(verify_hmac_sha256_hex(b"whsec", b"{\"id\":1}", &sig.to_uppercase()));
        assert!(!verify_hmac_sha256_hex(b"whsec", b"{\"id\":2}", &sig));
        assert!(!verify_hmac_sha256_hex(b"other", b"{\"id\":1}", &sig));
        assert!(!verify_hmac_sha256_hex(b"whsec", b"{\"id\":1}", "zz-not-hex"));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(hmac_sha256_hex(b"", b"payload").is_err());
        assert!(!verify_hmac_sha256_hex(b"", b"payload", "00"));
    }

    #[test]
    fn test_nonce_length() {
        assert_eq!(nonce_hex(8).len(), 16);
        assert_ne!(nonce_hex(8), nonce_hex(8));
    }
}
