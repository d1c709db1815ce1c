//! Records as they travel from the provider to canonical storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A record exactly as the provider returned it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub data: Value,
    #[serde(default)]
    pub deleted: bool,
    /// Provider supplied confidence in `[0, 1]`
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            deleted: false,
            confidence: None,
            timestamp: None,
        }
    }

    pub fn tombstone(data: Value) -> Self {
        Self {
            deleted: true,
            ..Self::new(data)
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOrigin {
    Poll,
    Webhook,
}

/// One unit of ingestion work: a fetched page or a pushed webhook payload
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub source_id: Uuid,
    pub origin: IngestOrigin,
    pub sequence: u32,
    pub records: Vec<RawRecord>,
    pub received_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn page(source_id: Uuid, sequence: u32, records: Vec<RawRecord>) -> Self {
        Self {
            source_id,
            origin: IngestOrigin::Poll,
            sequence,
            records,
            received_at: Utc::now(),
        }
    }

    pub fn webhook(source_id: Uuid, records: Vec<RawRecord>) -> Self {
        Self {
            source_id,
            origin: IngestOrigin::Webhook,
            sequence: 0,
            records,
            received_at: Utc::now(),
        }
    }
}

/// A record after mapping, keyed by its logical identifier
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub logical_key: String,
    pub entity: String,
    pub fields: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub deleted: bool,
}

/// A canonical field value with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    pub source_id: Uuid,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted canonical record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub logical_key: String,
    pub entity: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Fingerprint of the field values only
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync_id: Uuid,
}

impl CanonicalRecord {
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|f| &f.value)
    }
}
