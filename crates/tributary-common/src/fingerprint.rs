//! Content fingerprints for canonical records
//!
//! `serde_json` maps are ordered by key, so serializing a `Value` yields a stable byte
//! sequence and the fingerprint of a record does not depend on field insertion order.

use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 of raw bytes
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the fingerprint of a JSON value
pub fn fingerprint_json(value: &serde_json::Value) -> String {
    fingerprint_bytes(value.to_string().as_bytes())
}
