//! Admin tokens for the API.
//!
//! A token is `<issued_at>.<hex hmac>`, the HMAC-SHA256 of the issue
//! timestamp (unix seconds) under the configured secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac keys have no length limit"),
        }
    }

    pub fn issue(&self) -> String {
        self.issue_at(now_secs())
    }

    fn issue_at(&self, issued_at: u64) -> String {
        let mut mac = self.mac();
        mac.update(issued_at.to_string().as_bytes());
        format!("{}.{}", issued_at, hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, token: &str) -> Result<(), TokenError> {
        self.verify_at(token, now_secs())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<(), TokenError> {
        let (issued, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let issued_at: u64 = issued.parse().map_err(|_| TokenError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac();
        mac.update(issued.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        if now.saturating_sub(issued_at) > self.ttl.as_secs() {
            return Err(TokenError::Expired);
        }
        Ok(())
    }
}

const PASSWORD_KEY: &[u8] = b"docker-ci password check";

fn password_mac(password: &str) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(PASSWORD_KEY) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac keys have no length limit"),
    };
    mac.update(password.as_bytes());
    mac
}

/// Compares MACs of both passwords, so timing reveals neither length nor
/// matching prefix.
pub fn password_matches(expected: Option<&str>, given: &str) -> bool {
    let Some(expected) = expected.filter(|p| !p.is_empty()) else {
        return false;
    };
    let expected_tag = password_mac(expected).finalize().into_bytes();
    password_mac(given).verify_slice(&expected_tag).is_ok()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
