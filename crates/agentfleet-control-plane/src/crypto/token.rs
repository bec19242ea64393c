//! Per-workspace callback tokens.
//!
//! Remote agents authenticate readiness and status callbacks with a bearer
//! token issued when the workspace is requested. We never store the plaintext
//! token - only its SHA-256 hash and expiry, on the workspace record.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A freshly issued token. `plaintext` goes to the agent, the rest is stored.
#[derive(Debug, Clone)]
pub struct CallbackToken {
    pub plaintext: String,

    /// SHA-256 hash of the token (hex encoded).
    pub token_hash: String,

    pub expires_at: DateTime<Utc>,
}

impl CallbackToken {
    /// Generate a token valid for `ttl`.
    pub fn issue(ttl: std::time::Duration) -> Self {
        // 256 bits of random data
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);

        let plaintext = URL_SAFE_NO_PAD.encode(token_bytes);
        let token_hash = hash_token(&plaintext);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(12));

        Self {
            plaintext,
            token_hash,
            expires_at: Utc::now() + ttl,
        }
    }
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a presented token against the stored hash and expiry.
pub fn verify_token(
    presented: &str,
    stored_hash: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let (Some(stored_hash), Some(expires_at)) = (stored_hash, expires_at) else {
        return false;
    };
    if now >= expires_at {
        return false;
    }
    let presented_hash = hash_token(presented);
    presented_hash.len() == stored_hash.len()
        && presented_hash
            .bytes()
            .zip(stored_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_issue_token() {
        let token = CallbackToken::issue(Duration::from_secs(3600));

        // 32 bytes base64 encoded
        assert_eq!(token.plaintext.len(), 43);
        // SHA-256 hex encoded
        assert_eq!(token.token_hash.len(), 64);
        assert_eq!(hash_token(&token.plaintext), token.token_hash);
        assert!(token.expires_at > Utc::now());
    }

    #[test]
    fn test_verify_token() {
        let token = CallbackToken::issue(Duration::from_secs(3600));
        let now = Utc::now();

        assert!(verify_token(
            &token.plaintext,
            Some(&token.token_hash),
            Some(token.expires_at),
            now
        ));
        assert!(!verify_token(
            "not-the-token",
            Some(&token.token_hash),
            Some(token.expires_at),
            now
        ));
        assert!(!verify_token(&token.plaintext, None, Some(token.expires_at), now));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = CallbackToken::issue(Duration::from_secs(60));
        let later = token.expires_at + chrono::Duration::seconds(1);

        assert!(!verify_token(
            &token.plaintext,
            Some(&token.token_hash),
            Some(token.expires_at),
            later
        ));
    }
}
