//! Stripe webhook signature verification
//!
//! Header format: `t=<unix timestamp>,v1=<hex hmac>[,v1=...][,v0=...]`.
//! The signed payload is `"{t}."` followed by the exact raw request bytes, so
//! verification must run before the body is parsed or re-serialized.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;

use crate::events::ProviderEvent;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing Stripe-Signature header")]
    MissingHeader,
    #[error("malformed Stripe-Signature header")]
    MalformedHeader,
    #[error("no signature matches the payload")]
    Mismatch,
    #[error("timestamp outside tolerance ({age_secs}s old)")]
    Expired { age_secs: i64 },
    #[error("payload is not a valid event: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => {
                timestamp = Some(v.parse().map_err(|_| SignatureError::MalformedHeader)?);
            }
            // v0 is Stripe's test scheme and is never trusted
            (Some("v1"), Some(v)) => {
                if let Ok(bytes) = hex::decode(v) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Compute the `v1` signature for a payload. Exposed for tests and tooling.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Build a header value in Stripe's format for the given payload
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(compute_signature(secret, timestamp, payload))
    )
}

/// Verifies webhook payloads against the endpoint secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret_len", &self.secret.len())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ProviderEvent, SignatureError> {
        self.verify_at(payload, signature_header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: i64,
    ) -> Result<ProviderEvent, SignatureError> {
        let header = signature_header
            .filter(|h| !h.trim().is_empty())
            .ok_or(SignatureError::MissingHeader)?;
        let parsed = parse_header(header)?;

        let age_secs = now - parsed.timestamp;
        if age_secs.abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now = now,
                age_secs = age_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(SignatureError::Expired { age_secs });
        }

        let expected = compute_signature(&self.secret, parsed.timestamp, payload);
        let matched = parsed
            .signatures
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = parsed.signatures.len(),
                "Webhook signature mismatch"
            );
            return Err(SignatureError::Mismatch);
        }

        ProviderEvent::from_slice(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Verified webhook payload failed to parse");
            SignatureError::MalformedPayload(e.to_string())
        })
    }
}
