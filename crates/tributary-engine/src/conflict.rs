//! Conflict resolution and in-batch de-duplication
//!
//! A field conflict exists when the canonical record and an incoming record disagree
//! on a field's value. Each field is settled by the strategy configured for it:
//!
//! - `last_write_wins`: the newer timestamp wins; ties go to the incoming value
//! - `highest_confidence`: the higher confidence wins; ties go to the incoming value
//! - `manual_review`: the canonical value is kept and the conflict is queued
//!
//! The sync mode decides whether merging happens at all: `replace` makes the incoming
//! record authoritative and `append` never touches an existing record.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use strsim::jaro_winkler;
use tributary_common::fingerprint::fingerprint_json;
use uuid::Uuid;

use crate::models::{
    CanonicalRecord, Conflict, ConflictCandidate, ConflictStrategy, DuplicateDetection, FieldValue,
    MappedRecord, SyncMode, SyncSettings,
};

/// Fingerprint of a record's field values
pub fn content_hash(values: &BTreeMap<String, Value>) -> String {
    let object: serde_json::Map<String, Value> =
        values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    fingerprint_json(&Value::Object(object))
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction {
    Create(CanonicalRecord),
    /// `changed` is false when the merge left every value as it was
    Update {
        record: CanonicalRecord,
        changed: bool,
    },
    Delete,
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub action: MergeAction,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    fn action(action: MergeAction) -> Self {
        Self {
            action,
            conflicts: Vec::new(),
        }
    }
}

/// Result of collapsing duplicates within one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupedBatch {
    pub records: Vec<MappedRecord>,
    /// Records folded into an earlier record of the same batch
    pub merged: u64,
    pub conflicts: Vec<Conflict>,
}

/// Which side of a disagreement wins
enum Winner {
    Current,
    Incoming,
    Review,
}

fn decide(
    strategy: ConflictStrategy,
    current: (DateTime<Utc>, f64),
    incoming: (DateTime<Utc>, f64),
) -> Winner {
    match strategy {
        ConflictStrategy::LastWriteWins if incoming.0 >= current.0 => Winner::Incoming,
        ConflictStrategy::HighestConfidence if incoming.1 >= current.1 => Winner::Incoming,
        ConflictStrategy::ManualReview => Winner::Review,
        _ => Winner::Current,
    }
}

/// Settles incoming records against canonical state for one source and mode
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    settings: SyncSettings,
    mode: SyncMode,
    source_id: Uuid,
}

impl ConflictResolver {
    pub fn new(settings: SyncSettings, mode: SyncMode, source_id: Uuid) -> Self {
        Self {
            settings,
            mode,
            source_id,
        }
    }

    fn field_value(&self, incoming: &MappedRecord, value: Value) -> FieldValue {
        FieldValue {
            value,
            source_id: self.source_id,
            confidence: incoming.confidence,
            timestamp: incoming.timestamp,
        }
    }

    fn build(
        &self,
        incoming: &MappedRecord,
        fields: BTreeMap<String, FieldValue>,
        created_at: DateTime<Utc>,
        sync_id: Uuid,
        now: DateTime<Utc>,
    ) -> CanonicalRecord {
        let values = fields.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect();
        CanonicalRecord {
            logical_key: incoming.logical_key.clone(),
            entity: incoming.entity.clone(),
            content_hash: content_hash(&values),
            fields,
            created_at,
            updated_at: now,
            last_sync_id: sync_id,
        }
    }

    /// Merge `incoming` into the canonical record stored under its key
    pub fn merge(
        &self,
        existing: Option<&CanonicalRecord>,
        incoming: &MappedRecord,
        sync_id: Uuid,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let Some(existing) = existing else {
            if incoming.deleted {
                return MergeOutcome::action(MergeAction::Skip);
            }
            let fields = incoming
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), self.field_value(incoming, v.clone())))
                .collect();
            return MergeOutcome::action(MergeAction::Create(self.build(incoming, fields, now, sync_id, now)));
        };

        if incoming.deleted {
            return MergeOutcome::action(match self.mode {
                SyncMode::Append => MergeAction::Skip,
                _ => MergeAction::Delete,
            });
        }

        let mut conflicts = Vec::new();
        let fields = match self.mode {
            SyncMode::Append => return MergeOutcome::action(MergeAction::Skip),
            SyncMode::Replace => incoming
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), self.field_value(incoming, v.clone())))
                .collect(),
            _ => {
                let mut fields = existing.fields.clone();
                for (name, value) in &incoming.fields {
                    let Some(current) = existing.fields.get(name) else {
                        fields.insert(name.clone(), self.field_value(incoming, value.clone()));
                        continue;
                    };
                    if current.value == *value {
                        continue;
                    }
                    let winner = decide(
                        self.settings.strategy_for(name),
                        (current.timestamp, current.confidence),
                        (incoming.timestamp, incoming.confidence),
                    );
                    match winner {
                        Winner::Incoming => {
                            fields.insert(name.clone(), self.field_value(incoming, value.clone()));
                        }
                        Winner::Current => {}
                        Winner::Review => conflicts.push(Conflict {
                            logical_key: incoming.logical_key.clone(),
                            entity: incoming.entity.clone(),
                            field: name.clone(),
                            candidates: vec![
                                ConflictCandidate {
                                    source_id: current.source_id,
                                    value: current.value.clone(),
                                    confidence: current.confidence,
                                    timestamp: current.timestamp,
                                },
                                ConflictCandidate {
                                    source_id: self.source_id,
                                    value: value.clone(),
                                    confidence: incoming.confidence,
                                    timestamp: incoming.timestamp,
                                },
                            ],
                        }),
                    }
                }
                fields
            }
        };

        let mut record = self.build(incoming, fields, existing.created_at, sync_id, now);
        let changed = record.content_hash != existing.content_hash;
        if !changed {
            record.updated_at = existing.updated_at;
        }
        MergeOutcome {
            action: MergeAction::Update { record, changed },
            conflicts,
        }
    }

    /// Collapse records of one page that describe the same entity
    ///
    /// Records sharing a logical key are always merged. With duplicate detection
    /// configured, records whose `matching_fields` are similar enough (mean
    /// Jaro-Winkler over lower-cased values) are merged as well. Tombstones only
    /// merge on an exact key and supersede what came before them.
    pub fn dedupe_batch(&self, records: Vec<MappedRecord>) -> DedupedBatch {
        let mut batch = DedupedBatch::default();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for record in records {
            let target = by_key.get(&record.logical_key).copied().or_else(|| {
                if record.deleted {
                    return None;
                }
                let detection = self.settings.duplicate_detection.as_ref()?;
                batch
                    .records
                    .iter()
                    .position(|seen| !seen.deleted && similarity(detection, seen, &record) >= detection.threshold)
            });

            match target {
                Some(index) => {
                    batch.merged += 1;
                    let seen = &mut batch.records[index];
                    if record.deleted || seen.deleted {
                        let key = seen.logical_key.clone();
                        *seen = MappedRecord {
                            logical_key: key,
                            ..record
                        };
                    } else {
                        let conflicts = self.fold(seen, record);
                        batch.conflicts.extend(conflicts);
                    }
                }
                None => {
                    by_key.insert(record.logical_key.clone(), batch.records.len());
                    batch.records.push(record);
                }
            }
        }

        batch
    }

    /// Fold a later duplicate into the record seen first
    fn fold(&self, seen: &mut MappedRecord, later: MappedRecord) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for (name, value) in later.fields {
            let Some(current) = seen.fields.get(&name) else {
                seen.fields.insert(name, value);
                continue;
            };
            if *current == value {
                continue;
            }
            match decide(
                self.settings.strategy_for(&name),
                (seen.timestamp, seen.confidence),
                (later.timestamp, later.confidence),
            ) {
                Winner::Incoming => {
                    seen.fields.insert(name, value);
                }
                Winner::Current => {}
                Winner::Review => conflicts.push(Conflict {
                    logical_key: seen.logical_key.clone(),
                    entity: seen.entity.clone(),
                    field: name,
                    candidates: vec![
                        ConflictCandidate {
                            source_id: self.source_id,
                            value: current.clone(),
                            confidence: seen.confidence,
                            timestamp: seen.timestamp,
                        },
                        ConflictCandidate {
                            source_id: self.source_id,
                            value,
                            confidence: later.confidence,
                            timestamp: later.timestamp,
                        },
                    ],
                }),
            }
        }
        seen.timestamp = seen.timestamp.max(later.timestamp);
        seen.confidence = seen.confidence.max(later.confidence);
        conflicts
    }
}

fn comparable(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Mean Jaro-Winkler similarity over the detection fields; missing values score zero
fn similarity(detection: &DuplicateDetection, a: &MappedRecord, b: &MappedRecord) -> f64 {
    if detection.matching_fields.is_empty() {
        return 0.0;
    }
    let total: f64 = detection
        .matching_fields
        .iter()
        .map(|field| {
            match (
                comparable(a.fields.get(field)),
                comparable(b.fields.get(field)),
            ) {
                (Some(x), Some(y)) => jaro_winkler(&x, &y),
                _ => 0.0,
            }
        })
        .sum();
    total / detection.matching_fields.len() as f64
}
