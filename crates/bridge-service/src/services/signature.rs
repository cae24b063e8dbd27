//! Webhook signature verification.
//!
//! WeMeet signs every callback with SHA-1 over the lexicographically sorted
//! concatenation of `{token, timestamp, nonce, data}`, hex encoded. For the
//! verification handshake `data` is the `check_str` query value; for event
//! callbacks it is the still-encrypted `data` body field.

use common::secret::{ExposeSecret, SecretString};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};

/// Verifies callback signatures against the configured webhook token.
#[derive(Clone)]
pub struct SignatureVerifier {
    token: SecretString,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }

    /// Compute the expected signature for the given request values.
    pub fn sign(&self, timestamp: &str, nonce: &str, data: &str) -> String {
        compute_signature(self.token.expose_secret(), timestamp, nonce, data)
    }

    /// Returns true iff `signature` matches the expected digest.
    pub fn verify(&self, timestamp: &str, nonce: &str, data: &str, signature: &str) -> bool {
        let expected = self.sign(timestamp, nonce, data);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }
}

/// SHA-1 hex digest of the sorted, separator-free concatenation.
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, data: &str) -> String {
    let mut parts = [token, timestamp, nonce, data];
    parts.sort_unstable();

    let canonical = parts.concat();
    hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, canonical.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
