//! Inbound webhook verification
//!
//! Providers sign `"{timestamp}.{body}"` with HMAC-SHA256 using the source's shared
//! secret and send the hex digest (optionally prefixed with `sha256=`) together with
//! the unix timestamp. A delivery is accepted when the timestamp is inside the replay
//! window, the signature matches in constant time, and the same signature has not
//! been seen within the window.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::models::RawRecord;

type HmacSha256 = Hmac<Sha256>;

/// Signature header name
pub const SIGNATURE_HEADER: &str = "X-Tributary-Signature";

/// Timestamp header name
pub const TIMESTAMP_HEADER: &str = "X-Tributary-Timestamp";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WebhookError {
    #[error("missing signature")]
    MissingSignature,

    #[error("missing timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("timestamp is {age_secs}s away from now, outside the replay window")]
    Expired { age_secs: i64 },

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("delivery already processed")]
    Replayed,

    #[error("data source {0} does not accept webhooks")]
    NotWebhookSource(Uuid),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

fn mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Hex signature a provider would send for `body` at `timestamp`
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    hex::encode(mac(secret, timestamp, body).finalize().into_bytes())
}

/// Verifies deliveries and remembers accepted signatures for replay detection
pub struct WebhookVerifier {
    /// Accepted signatures per source with the time they were seen
    seen: Mutex<HashMap<(Uuid, String), DateTime<Utc>>>,
}

impl Default for WebhookVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookVerifier {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn verify(
        &self,
        source_id: Uuid,
        secret: &str,
        window_secs: u64,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let timestamp = timestamp.ok_or(WebhookError::MissingTimestamp)?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| WebhookError::InvalidTimestamp(timestamp.to_string()))?;
        let sent_at = DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| WebhookError::InvalidTimestamp(timestamp.to_string()))?;

        let window = Duration::seconds(window_secs as i64);
        let age = now - sent_at;
        if age.abs() > window {
            return Err(WebhookError::Expired {
                age_secs: age.num_seconds(),
            });
        }

        let provided = signature.trim();
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        let provided = hex::decode(provided).map_err(|_| WebhookError::InvalidSignature)?;
        let expected = mac(secret, ts, body).finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(WebhookError::InvalidSignature);
        }

        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.retain(|_, at| now - *at <= window);
        let key = (source_id, hex::encode(&provided));
        if seen.contains_key(&key) {
            return Err(WebhookError::Replayed);
        }
        seen.insert(key, now);
        Ok(())
    }
}

/// Records carried by a delivery: one object, an array, or `{"records": [...]}`
pub fn parse_payload(body: &[u8]) -> Result<Vec<RawRecord>, WebhookError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

    let items = match value {
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(WebhookError::MalformedPayload(
                    "'records' must be an array".to_string(),
                ))
            }
            None => vec![Value::Object(map)],
        },
        Value::Array(items) => items,
        _ => {
            return Err(WebhookError::MalformedPayload(
                "expected a JSON object or array".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(_) => Ok(RawRecord::new(item)),
            other => Err(WebhookError::MalformedPayload(format!(
                "expected record objects, found {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_0123456789abcdef";

    fn verify(
        verifier: &WebhookVerifier,
        source: Uuid,
        ts: i64,
        signature: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        verifier.verify(source, SECRET, 300, Some(&ts.to_string()), Some(signature), body, now)
    }

    #[test]
    fn test_valid_signature_accepted_once() {
        let verifier = WebhookVerifier::new();
        let now = Utc::now();
        let body = br#"{"id": 1}"#;
        let signature = sign(SECRET, now.timestamp(), body);
        let source = Uuid::new_v4();

        verify(&verifier, source, now.timestamp(), &signature, body, now).unwrap();
        assert_eq!(
            verify(&verifier, source, now.timestamp(), &signature, body, now),
            Err(WebhookError::Replayed)
        );
    }

    #[test]
    fn test_prefixed_signature() {
        let verifier = WebhookVerifier::new();
        let now = Utc::now();
        let body = b"[]";
        let signature = format!("sha256={}", sign(SECRET, now.timestamp(), body));
        verify(&verifier, Uuid::new_v4(), now.timestamp(), &signature, body, now).unwrap();
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = WebhookVerifier::new();
        let now = Utc::now();
        let signature = sign(SECRET, now.timestamp(), br#"{"amount": 1}"#);
        assert_eq!(
            verify(&verifier, Uuid::new_v4(), now.timestamp(), &signature, br#"{"amount": 9}"#, now),
            Err(WebhookError::InvalidSignature)
        );
        assert_eq!(
            verify(&verifier, Uuid::new_v4(), now.timestamp(), "zz-not-hex", b"{}", now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let verifier = WebhookVerifier::new();
        let now = Utc::now();
        let old = now.timestamp() - 301;
        let signature = sign(SECRET, old, b"{}");
        assert!(matches!(
            verify(&verifier, Uuid::new_v4(), old, &signature, b"{}", now),
            Err(WebhookError::Expired { .. })
        ));
    }

    #[test]
    fn test_missing_headers() {
        let verifier = WebhookVerifier::new();
        let now = Utc::now();
        assert_eq!(
            verifier.verify(Uuid::new_v4(), SECRET, 300, None, Some("ab"), b"{}", now),
            Err(WebhookError::MissingTimestamp)
        );
        assert_eq!(
            verifier.verify(Uuid::new_v4(), SECRET, 300, Some("1"), None, b"{}", now),
            Err(WebhookError::MissingSignature)
        );
        assert!(matches!(
            verifier.verify(Uuid::new_v4(), SECRET, 300, Some("soon"), Some("ab"), b"{}", now),
            Err(WebhookError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_parse_payload_shapes() {
        assert_eq!(parse_payload(br#"{"id": 1}"#).unwrap().len(), 1);
        assert_eq!(parse_payload(br#"[{"id": 1}, {"id": 2}]"#).unwrap().len(), 2);
        assert_eq!(parse_payload(br#"{"records": [{"id": 1}]}"#).unwrap().len(), 1);
        assert!(parse_payload(b"42").is_err());
        assert!(parse_payload(b"[1, 2]").is_err());
        assert!(parse_payload(b"not json").is_err());
    }
}
