//! Field-level conflicts and the manual review queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_common::fingerprint::fingerprint_json;
use uuid::Uuid;

/// Namespace of review queue entry ids
const CONFLICT_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_52c4_93a0_4e0d_8f27_1c5e_a9d3_b840);

/// How a field-level disagreement is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    HighestConfidence,
    /// Keep the canonical value and queue the disagreement
    #[default]
    ManualReview,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::HighestConfidence => "highest_confidence",
            ConflictStrategy::ManualReview => "manual_review",
        }
    }
}

/// One side of a disagreement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCandidate {
    pub source_id: Uuid,
    pub value: Value,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Field-level disagreement discovered during merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub logical_key: String,
    pub entity: String,
    pub field: String,
    /// Existing canonical value first, incoming value last
    pub candidates: Vec<ConflictCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

/// Conflict audit log entry awaiting (or past) manual review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedConflict {
    pub id: Uuid,
    pub source_id: Uuid,
    pub sync_id: Uuid,
    #[serde(flatten)]
    pub conflict: Conflict,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Value>,
}

impl QueuedConflict {
    pub fn new(source_id: Uuid, sync_id: Uuid, conflict: Conflict) -> Self {
        Self {
            id: Self::identity(source_id, &conflict),
            source_id,
            sync_id,
            conflict,
            status: ConflictStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    /// Queue id of a disagreement
    ///
    /// The same incoming value for the same field of the same record from the same
    /// source always maps to one entry, so replayed pages never grow the queue.
    pub fn identity(source_id: Uuid, conflict: &Conflict) -> Uuid {
        let incoming = conflict
            .candidates
            .last()
            .map(|c| fingerprint_json(&c.value))
            .unwrap_or_default();
        let name = format!(
            "{source_id}|{}|{}|{}|{incoming}",
            conflict.entity, conflict.logical_key, conflict.field
        );
        Uuid::new_v5(&CONFLICT_NAMESPACE, name.as_bytes())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictFilter {
    #[serde(default)]
    pub source_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<ConflictStatus>,
}

impl ConflictFilter {
    pub fn matches(&self, conflict: &QueuedConflict) -> bool {
        self.source_id.is_none_or(|id| id == conflict.source_id)
            && self.status.is_none_or(|s| s == conflict.status)
    }
}

fn default_similarity_threshold() -> f64 {
    0.92
}

/// In-batch duplicate detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateDetection {
    /// Target fields compared between records of one batch
    pub matching_fields: Vec<String>,
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict(incoming: Value) -> Conflict {
        let candidate = |value: Value| ConflictCandidate {
            source_id: Uuid::nil(),
            value,
            confidence: 1.0,
            timestamp: Utc::now(),
        };
        Conflict {
            logical_key: "contact:ada@example.com".to_string(),
            entity: "contact".to_string(),
            field: "name".to_string(),
            candidates: vec![candidate(json!("Ada")), candidate(incoming)],
        }
    }

    #[test]
    fn test_identity_follows_the_incoming_value() {
        let source = Uuid::new_v4();
        let first = QueuedConflict::new(source, Uuid::new_v4(), conflict(json!("Ada Lovelace")));
        let replay = QueuedConflict::new(source, Uuid::new_v4(), conflict(json!("Ada Lovelace")));
        let other = QueuedConflict::new(source, Uuid::new_v4(), conflict(json!("Ada King")));

        assert_eq!(first.id, replay.id);
        assert_ne!(first.id, other.id);
        assert_ne!(
            first.id,
            QueuedConflict::new(Uuid::new_v4(), Uuid::new_v4(), conflict(json!("Ada Lovelace"))).id
        );
    }
}
