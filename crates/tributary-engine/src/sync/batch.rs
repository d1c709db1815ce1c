//! Transform half of a page: map, validate and collapse duplicates
//!
//! Nothing here touches the store. A record that cannot be mapped or that fails an
//! error-severity rule is counted as failed and left out; everything else comes out
//! de-duplicated and ready to merge.

use chrono::{DateTime, Utc};

use crate::conflict::ConflictResolver;
use crate::error::SyncError;
use crate::mapper::CompiledMapping;
use crate::models::{Conflict, MappedRecord, RawRecord};
use crate::validator::{QualityTracker, Validator};

#[derive(Debug, Default)]
pub(crate) struct PreparedPage {
    pub records: Vec<MappedRecord>,
    pub failed: u64,
    /// Records folded into another record of the same page
    pub merged: u64,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<SyncError>,
    pub conflicts: Vec<Conflict>,
    pub quality: QualityTracker,
}

pub(crate) fn prepare_page(
    mapping: &CompiledMapping,
    validator: &Validator,
    resolver: &ConflictResolver,
    raws: &[RawRecord],
    source_confidence: f64,
    fetched_at: DateTime<Utc>,
) -> PreparedPage {
    let mut page = PreparedPage::default();
    let mut mapped = Vec::with_capacity(raws.len());

    for raw in raws {
        let record = match mapping.map_record(raw, source_confidence, fetched_at) {
            Ok(record) => record,
            Err(e) => {
                page.failed += 1;
                page.quality.record_invalid();
                page.errors
                    .push(e.to_sync_error(mapping.describe(raw).as_deref()));
                continue;
            }
        };

        let outcome = validator.validate(&record);
        if !outcome.passed() {
            page.failed += 1;
            page.quality.record_invalid();
            page.errors.extend(
                outcome
                    .errors()
                    .map(|v| v.to_sync_error(&record.logical_key)),
            );
            continue;
        }

        let warnings: Vec<SyncError> = outcome
            .warnings()
            .map(|v| v.to_sync_error(&record.logical_key))
            .collect();
        page.quality.record_valid(warnings.len());
        page.warnings.extend(warnings);
        mapped.push(record);
    }

    let deduped = resolver.dedupe_batch(mapped);
    page.quality.record_duplicates(deduped.merged);
    page.merged = deduped.merged;
    page.conflicts = deduped.conflicts;
    page.records = deduped.records;
    page
}
