//! Return-URL signature generation and verification
//!
//! Signs `(invoice_number, timestamp)` pairs with HMAC-SHA256 so the
//! client-facing status page can prove the redirect parameters were issued
//! by us. The signer is pure and stateless: it does not enforce expiry,
//! the caller decides whether a timestamp is stale.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer for return-URL parameters.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Sign an invoice number and unix-seconds timestamp.
    ///
    /// Output is base64url without padding, so it is safe to embed in a
    /// query string without further escaping. Deterministic: the same
    /// inputs always produce the same signature.
    pub fn sign(&self, invoice_number: &str, timestamp: i64) -> String {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length; unreachable in practice.
            Err(_) => return String::new(),
        };
        mac.update(format!("{}:{}", invoice_number, timestamp).as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Verify a signature in constant time.
    ///
    /// Returns `false` (never an error) for malformed or mismatched input.
    pub fn verify(&self, invoice_number: &str, timestamp: i64, signature: &str) -> bool {
        let expected = self.sign(invoice_number, timestamp);
        if expected.is_empty() {
            return false;
        }
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}
