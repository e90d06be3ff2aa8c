//! Token validation for the authorization handshake.
//!
//! Tokens are never stored raw: the validator keeps SHA-256 hashes of the
//! configured tokens and compares presented tokens in constant time. The
//! derived principal is a stable function of the token, so the same client
//! maps to the same `user_id` across reconnects.

use sha2::{Digest, Sha256};

/// Validates authorization tokens and derives stable user identities.
///
/// With an empty allowlist, any non-empty token is accepted (open mode for
/// local desktop deployments). With configured tokens, only exact matches
/// authenticate.
pub struct TokenValidator {
    allowed_hashes: Vec<String>,
}

impl TokenValidator {
    pub fn new(allowed_tokens: &[String]) -> Self {
        Self {
            allowed_hashes: allowed_tokens
                .iter()
                .filter(|token| !token.trim().is_empty())
                .map(|token| hash_token(token.trim()))
                .collect(),
        }
    }

    /// Accept any non-empty token.
    pub fn open() -> Self {
        Self {
            allowed_hashes: Vec::new(),
        }
    }

    /// Validate a presented token, returning the derived user id on success.
    pub fn validate(&self, token: &str) -> Option<String> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        if !self.allowed_hashes.is_empty() {
            let presented = hash_token(token);
            let matched = self
                .allowed_hashes
                .iter()
                .any(|stored| constant_time_eq(stored.as_bytes(), presented.as_bytes()));
            if !matched {
                return None;
            }
        }

        Some(principal_from_token(token))
    }
}

/// Compute the hex-encoded SHA-256 hash of a token string.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Hex-encode a byte slice (lowercase).
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Derive a stable principal identity from a raw token.
fn principal_from_token(token: &str) -> String {
    let digest = hash_token(token);
    format!("user-{}", &digest[..16])
}

/// Constant-time comparison of two byte slices.
///
/// Iterates over all bytes regardless of mismatches to prevent timing
/// side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
