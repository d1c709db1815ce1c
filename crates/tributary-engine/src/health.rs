//! Source health monitoring
//!
//! Every finalized run is fed to [`HealthMonitor::observe`]. A source is
//! `unhealthy` after a configured number of consecutive failed runs or on an
//! authentication failure, `degraded` when the failure rate over the rolling window
//! or the page latency (against the window's baseline) crosses its threshold, and
//! `healthy` otherwise. Status transitions are reported to an [`AlertNotifier`].
//! Cancelled runs say nothing about the provider and are ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HealthThresholds;
use crate::error::{ErrorKind, SyncError};
use crate::models::source::source_labels;
use crate::models::{DataSource, SyncResult, SyncStatus};

/// Runs needed before latency is compared against a baseline
const MIN_LATENCY_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_id: Uuid,
    pub status: HealthStatus,
    /// Failed runs over the rolling window
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub runs_observed: usize,
    /// Mean page latency of the window, excluding the latest run
    pub baseline_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub last_error: Option<SyncError>,
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl SourceHealth {
    /// A source with no finished runs yet
    pub fn unobserved(source_id: Uuid) -> Self {
        Self {
            source_id,
            status: HealthStatus::Healthy,
            error_rate: 0.0,
            consecutive_failures: 0,
            runs_observed: 0,
            baseline_latency_ms: None,
            last_latency_ms: None,
            last_error: None,
            reason: None,
            checked_at: Utc::now(),
        }
    }
}

/// A health status transition
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub source_id: Uuid,
    pub labels: BTreeMap<&'static str, String>,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Receives health transitions
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &HealthAlert);
}

/// Writes transitions to the log
pub struct TracingNotifier;

#[async_trait]
impl AlertNotifier for TracingNotifier {
    async fn notify(&self, alert: &HealthAlert) {
        if alert.to == HealthStatus::Healthy {
            info!(
                source_id = %alert.source_id,
                provider = alert.labels.get("provider").map(String::as_str).unwrap_or_default(),
                from = %alert.from,
                "source recovered"
            );
        } else {
            warn!(
                source_id = %alert.source_id,
                provider = alert.labels.get("provider").map(String::as_str).unwrap_or_default(),
                from = %alert.from,
                to = %alert.to,
                reason = %alert.reason,
                "source health changed"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    failed: bool,
    latency_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct Tracker {
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
    status: HealthStatus,
    snapshot: Option<SourceHealth>,
}

pub struct HealthMonitor {
    thresholds: HealthThresholds,
    notifier: Arc<dyn AlertNotifier>,
    trackers: RwLock<HashMap<Uuid, Tracker>>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self {
            thresholds,
            notifier,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a finalized run into the source's health
    pub async fn observe(&self, source: &DataSource, result: &SyncResult) -> HealthStatus {
        let (health, transition) = {
            let mut trackers = self.trackers.write().await;
            let tracker = trackers.entry(source.id).or_default();
            if !result.status.is_terminal() || result.status == SyncStatus::Cancelled {
                return tracker.status;
            }
            let health = self.update(tracker, source.id, result);
            let transition = (health.status != tracker.status).then_some(tracker.status);
            tracker.status = health.status;
            tracker.snapshot = Some(health.clone());
            (health, transition)
        };

        if let Some(from) = transition {
            let alert = HealthAlert {
                source_id: source.id,
                labels: source_labels(source),
                from,
                to: health.status,
                reason: health
                    .reason
                    .clone()
                    .unwrap_or_else(|| "within thresholds".to_string()),
                at: health.checked_at,
            };
            self.notifier.notify(&alert).await;
        }
        health.status
    }

    fn update(&self, tracker: &mut Tracker, source_id: Uuid, result: &SyncResult) -> SourceHealth {
        let failed = result.status == SyncStatus::Failed;
        let latency_ms = (result.performance_metrics.pages_fetched > 0)
            .then_some(result.performance_metrics.avg_page_latency_ms);

        let previous: Vec<f64> = tracker.samples.iter().filter_map(|s| s.latency_ms).collect();
        let baseline = (previous.len() >= MIN_LATENCY_SAMPLES)
            .then(|| previous.iter().sum::<f64>() / previous.len() as f64);

        tracker.samples.push_back(Sample { failed, latency_ms });
        while tracker.samples.len() > self.thresholds.window {
            tracker.samples.pop_front();
        }
        tracker.consecutive_failures = if failed {
            tracker.consecutive_failures + 1
        } else {
            0
        };

        let failures = tracker.samples.iter().filter(|s| s.failed).count();
        let error_rate = failures as f64 / tracker.samples.len() as f64;
        let last_error = result.errors.last().cloned();
        let auth_failed = failed
            && result
                .errors
                .iter()
                .any(|e| e.kind == ErrorKind::AuthError);

        let (status, reason) = if auth_failed {
            (HealthStatus::Unhealthy, Some("authentication failed".to_string()))
        } else if tracker.consecutive_failures >= self.thresholds.consecutive_failures {
            (
                HealthStatus::Unhealthy,
                Some(format!("{} consecutive failed runs", tracker.consecutive_failures)),
            )
        } else if error_rate > self.thresholds.error_rate {
            (
                HealthStatus::Degraded,
                Some(format!("error rate {:.0}% over the last {} runs", error_rate * 100.0, tracker.samples.len())),
            )
        } else if let (Some(latency), Some(base)) = (latency_ms, baseline) {
            if latency > base * self.thresholds.latency_factor {
                (
                    HealthStatus::Degraded,
                    Some(format!("page latency {latency:.0}ms against a {base:.0}ms baseline")),
                )
            } else {
                (HealthStatus::Healthy, None)
            }
        } else {
            (HealthStatus::Healthy, None)
        };

        SourceHealth {
            source_id,
            status,
            error_rate,
            consecutive_failures: tracker.consecutive_failures,
            runs_observed: tracker.samples.len(),
            baseline_latency_ms: baseline,
            last_latency_ms: latency_ms,
            last_error,
            reason,
            checked_at: Utc::now(),
        }
    }

    pub async fn health(&self, source_id: Uuid) -> SourceHealth {
        self.trackers
            .read()
            .await
            .get(&source_id)
            .and_then(|t| t.snapshot.clone())
            .unwrap_or_else(|| SourceHealth::unobserved(source_id))
    }

    pub async fn forget(&self, source_id: Uuid) {
        self.trackers.write().await.remove(&source_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::models::{CreateDataSource, SyncMode, SyncTrigger};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        alerts: Mutex<Vec<(HealthStatus, HealthStatus)>>,
    }

    #[async_trait]
    impl AlertNotifier for Recorder {
        async fn notify(&self, alert: &HealthAlert) {
            self.alerts.lock().unwrap().push((alert.from, alert.to));
        }
    }

    fn source() -> DataSource {
        let request: CreateDataSource = serde_json::from_value(json!({
            "name": "Wire",
            "provider": "newswire",
            "configuration": {"type": "rest_api", "endpoint": "https://api.example.com/items"},
            "data_mapping": {"target_entity": "article", "field_mappings": []}
        }))
        .unwrap();
        DataSource::from_request(request)
    }

    fn run(source: &DataSource, status: SyncStatus, latency_ms: f64) -> SyncResult {
        let mut result = SyncResult::pending(source.id, SyncMode::Incremental, SyncTrigger::Scheduled);
        result.status = status;
        result.completed_at = Some(Utc::now());
        result.performance_metrics.pages_fetched = 1;
        result.performance_metrics.avg_page_latency_ms = latency_ms;
        result
    }

    fn monitor(recorder: Arc<Recorder>) -> HealthMonitor {
        HealthMonitor::new(HealthThresholds::default(), recorder)
    }

    #[tokio::test]
    async fn test_consecutive_failures_make_source_unhealthy() {
        let recorder = Arc::new(Recorder::default());
        let monitor = monitor(recorder.clone());
        let source = source();

        for _ in 0..3 {
            monitor.observe(&source, &run(&source, SyncStatus::Completed, 100.0)).await;
        }
        assert_eq!(monitor.health(source.id).await.status, HealthStatus::Healthy);

        monitor.observe(&source, &run(&source, SyncStatus::Failed, 100.0)).await;
        monitor.observe(&source, &run(&source, SyncStatus::Failed, 100.0)).await;
        let status = monitor.observe(&source, &run(&source, SyncStatus::Failed, 100.0)).await;
        assert_eq!(status, HealthStatus::Unhealthy);

        let recovered = monitor.observe(&source, &run(&source, SyncStatus::Completed, 100.0)).await;
        assert_eq!(recovered, HealthStatus::Healthy);

        let alerts = recorder.alerts.lock().unwrap().clone();
        assert_eq!(
            alerts,
            vec![
                (HealthStatus::Healthy, HealthStatus::Unhealthy),
                (HealthStatus::Unhealthy, HealthStatus::Healthy)
            ]
        );
    }

    #[tokio::test]
    async fn test_auth_failure_is_unhealthy_at_once() {
        let monitor = monitor(Arc::new(Recorder::default()));
        let source = source();
        let mut result = run(&source, SyncStatus::Failed, 100.0);
        result
            .errors
            .push(SyncError::new(ErrorKind::AuthError, Severity::Critical, "401"));
        assert_eq!(monitor.observe(&source, &result).await, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_latency_regression_degrades() {
        let monitor = monitor(Arc::new(Recorder::default()));
        let source = source();
        for _ in 0..3 {
            monitor.observe(&source, &run(&source, SyncStatus::Completed, 100.0)).await;
        }
        let status = monitor.observe(&source, &run(&source, SyncStatus::Completed, 450.0)).await;
        assert_eq!(status, HealthStatus::Degraded);
        let health = monitor.health(source.id).await;
        assert_eq!(health.baseline_latency_ms, Some(100.0));
    }

    #[tokio::test]
    async fn test_cancelled_runs_ignored() {
        let monitor = monitor(Arc::new(Recorder::default()));
        let source = source();
        for _ in 0..5 {
            monitor.observe(&source, &run(&source, SyncStatus::Cancelled, 100.0)).await;
        }
        let health = monitor.health(source.id).await;
        assert_eq!(health.runs_observed, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}
