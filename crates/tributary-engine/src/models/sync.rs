//! Sync runs and their results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::source::SyncMode;
use crate::error::SyncError;

/// Status of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Scheduled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Paused => "paused",
            SyncStatus::Scheduled => "scheduled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }
}

impl From<String> for SyncStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => SyncStatus::Running,
            "completed" => SyncStatus::Completed,
            "failed" => SyncStatus::Failed,
            "cancelled" => SyncStatus::Cancelled,
            "paused" => SyncStatus::Paused,
            "scheduled" => SyncStatus::Scheduled,
            _ => SyncStatus::Pending,
        }
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    #[default]
    Manual,
    Scheduled,
    Pipeline,
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Queue behind an active run instead of failing admission
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub mode: Option<SyncMode>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub trigger: SyncTrigger,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn triggered_by(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }
}

/// Record counters for one run
///
/// Only the `add_*` methods mutate the counters so that
/// `records_processed == created + updated + deleted + failed` always holds.
/// Skipped records are informational and not part of `records_processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub records_processed: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
}

impl SyncCounts {
    pub fn add_created(&mut self, n: u64) {
        self.records_created += n;
        self.records_processed += n;
    }

    pub fn add_updated(&mut self, n: u64) {
        self.records_updated += n;
        self.records_processed += n;
    }

    pub fn add_deleted(&mut self, n: u64) {
        self.records_deleted += n;
        self.records_processed += n;
    }

    pub fn add_failed(&mut self, n: u64) {
        self.records_failed += n;
        self.records_processed += n;
    }

    pub fn add_skipped(&mut self, n: u64) {
        self.records_skipped += n;
    }

    pub fn merge(&mut self, other: &SyncCounts) {
        self.add_created(other.records_created);
        self.add_updated(other.records_updated);
        self.add_deleted(other.records_deleted);
        self.add_failed(other.records_failed);
        self.add_skipped(other.records_skipped);
    }

    pub fn is_consistent(&self) -> bool {
        self.records_processed
            == self.records_created + self.records_updated + self.records_deleted + self.records_failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: u64,
    pub pages_fetched: u32,
    pub api_calls: u32,
    pub retries: u32,
    pub rate_limit_wait_ms: u64,
    pub avg_page_latency_ms: f64,
    pub records_per_second: f64,
}

impl PerformanceMetrics {
    /// Fold one fetched page into the running averages
    pub fn record_page(&mut self, latency_ms: u64) {
        let pages = self.pages_fetched as f64;
        self.avg_page_latency_ms = (self.avg_page_latency_ms * pages + latency_ms as f64) / (pages + 1.0);
        self.pages_fetched += 1;
    }

    pub fn finish(&mut self, duration_ms: u64, records: u64) {
        self.duration_ms = duration_ms;
        self.records_per_second = if duration_ms == 0 {
            0.0
        } else {
            records as f64 / (duration_ms as f64 / 1000.0)
        };
    }
}

/// Per-run data quality summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub total_records: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    pub duplicate_records: u64,
    pub warning_count: u64,
    pub quality_score: f64,
}

impl Default for DataQualityReport {
    fn default() -> Self {
        Self::compute(0, 0, 0, 0, 0)
    }
}

impl DataQualityReport {
    const DUPLICATE_PENALTY: f64 = 20.0;
    const WARNING_PENALTY: f64 = 10.0;

    /// Score is `valid / total * 100`, reduced by the duplicate and warning ratios
    pub fn compute(total: u64, valid: u64, invalid: u64, duplicates: u64, warnings: u64) -> Self {
        let quality_score = if total == 0 {
            100.0
        } else {
            let total_f = total as f64;
            let base = valid as f64 / total_f * 100.0;
            let penalty = Self::DUPLICATE_PENALTY * duplicates as f64 / total_f
                + Self::WARNING_PENALTY * warnings as f64 / total_f;
            (base - penalty).clamp(0.0, 100.0)
        };

        Self {
            total_records: total,
            valid_records: valid,
            invalid_records: invalid,
            duplicate_records: duplicates,
            warning_count: warnings,
            quality_score,
        }
    }
}

/// Append-only record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: SyncStatus,
    pub trigger: SyncTrigger,
    pub mode: SyncMode,
    pub queued_at: DateTime<Utc>,
    /// Set when the run acquires the source's merge lock
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<SyncError>,
    pub performance_metrics: PerformanceMetrics,
    pub data_quality_report: DataQualityReport,
    /// Cursor reached by this run
    pub cursor: Option<String>,
}

impl SyncResult {
    pub fn pending(source_id: Uuid, mode: SyncMode, trigger: SyncTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            status: SyncStatus::Pending,
            trigger,
            mode,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            counts: SyncCounts::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            performance_metrics: PerformanceMetrics::default(),
            data_quality_report: DataQualityReport::default(),
            cursor: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal() && self.completed_at.is_some()
    }
}

/// Live view of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub sync_id: Uuid,
    pub source_id: Uuid,
    pub status: SyncStatus,
    pub pages_fetched: u32,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub error_count: usize,
    pub last_error: Option<SyncError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl From<&SyncResult> for SyncProgress {
    fn from(result: &SyncResult) -> Self {
        let end = result.completed_at.unwrap_or_else(Utc::now);
        let elapsed_ms = result
            .started_at
            .map(|start| (end - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        Self {
            sync_id: result.id,
            source_id: result.source_id,
            status: result.status,
            pages_fetched: result.performance_metrics.pages_fetched,
            counts: result.counts,
            error_count: result.errors.len(),
            last_error: result.errors.last().cloned(),
            started_at: result.started_at,
            completed_at: result.completed_at,
            elapsed_ms,
        }
    }
}
