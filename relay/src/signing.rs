//! HMAC-SHA256 webhook signatures.
//!
//! Deliveries carry a header of the form `t=<unix seconds>,v1=<hex digest>`, where
//! the digest is HMAC-SHA256 keyed by the tenant's webhook secret over the string
//! `"{t}.{body}"`. Receivers recompute the digest over the raw request body and
//! compare in constant time.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Signature scheme carried in the header.
pub const SIGNATURE_SCHEME: &str = "v1";

const SECRET_LENGTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature header is missing a timestamp")]
    MissingTimestamp,
    #[error("Signature header has no v1 signature")]
    MissingSignature,
    #[error("Malformed signature header: {0}")]
    Malformed(String),
}

/// A parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Hex encoded `v1` digests. More than one may be present.
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `t=<ts>,v1=<hex>[,v1=<hex>...]`. Unknown keys are ignored, any part
    /// without a `=` makes the whole header malformed.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| SignatureError::Malformed(format!("expected key=value, got '{part}'")))?;
            match key {
                "t" => {
                    let ts = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed(format!("invalid timestamp '{value}'")))?;
                    timestamp = Some(ts);
                }
                SIGNATURE_SCHEME => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if signatures.is_empty() {
            return Err(SignatureError::MissingSignature);
        }
        Ok(Self { timestamp, signatures })
    }
}

impl std::fmt::Display for SignatureHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t={}", self.timestamp)?;
        for signature in &self.signatures {
            write!(f, ",{SIGNATURE_SCHEME}={signature}")?;
        }
        Ok(())
    }
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC takes keys of any length
        Err(_) => unreachable!("HMAC-SHA256 rejected a key"),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Sign `payload` at `timestamp`, returning the full header value.
pub fn sign(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let digest = mac_for(secret, timestamp, payload).finalize().into_bytes();
    SignatureHeader {
        timestamp,
        signatures: vec![hex::encode(digest)],
    }
    .to_string()
}

/// Sign `payload` with the current time.
pub fn sign_now(secret: &str, payload: &[u8]) -> String {
    sign(secret, payload, Utc::now().timestamp())
}

/// Verify a signature header against the raw body, using the current time for the
/// optional replay window.
pub fn verify(secret: &str, payload: &[u8], header: &str, max_age: Option<Duration>) -> bool {
    verify_at(secret, payload, header, max_age, Utc::now().timestamp())
}

/// Verify a signature header as of `now` (unix seconds).
///
/// Returns false for malformed headers, stale timestamps when `max_age` is set, and
/// digests that don't match.
pub fn verify_at(secret: &str, payload: &[u8], header: &str, max_age: Option<Duration>, now: i64) -> bool {
    let Ok(parsed) = SignatureHeader::parse(header) else {
        return false;
    };

    if let Some(max_age) = max_age {
        let age = now.saturating_sub(parsed.timestamp);
        if age > max_age.as_secs() as i64 {
            return false;
        }
    }

    parsed.signatures.iter().any(|candidate| {
        let Ok(candidate) = hex::decode(candidate) else {
            return false;
        };
        // verify_slice compares in constant time
        mac_for(secret, parsed.timestamp, payload).verify_slice(&candidate).is_ok()
    })
}

/// Generate a new webhook secret: `whsec_` followed by 32 alphanumeric characters.
pub fn generate_secret() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect();
    format!("{SECRET_PREFIX}{suffix}")
}
