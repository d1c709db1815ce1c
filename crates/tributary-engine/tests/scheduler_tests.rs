//! Scheduler tick tests driven with explicit clock values

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::{Duration, Utc};
use common::*;
use tributary_engine::adapter::{Page, SourceAdapter};
use tributary_engine::models::{
    CreateDataSource, ScheduleRequest, ScheduleSpec, SyncFrequency, SyncTrigger,
};
use tributary_engine::{EngineConfig, IntegrationError};

fn hourly(name: &str, provider: &str) -> CreateDataSource {
    let mut request = contact_source(name, provider);
    request.sync_settings.frequency = SyncFrequency::Hourly;
    request
}

#[tokio::test]
async fn test_due_sources_are_started_and_rescheduled() {
    init_tracing();
    let adapter = ScriptedAdapter::new("crm");
    let service = service_with(EngineConfig::default(), std::slice::from_ref(&adapter));
    service.register_schema(contact_schema()).await.unwrap();

    let before = Utc::now();
    let scheduled = service
        .create_data_source(hourly("hourly", adapter.provider()))
        .await
        .unwrap();
    let manual = service
        .create_data_source(contact_source("manual", adapter.provider()))
        .await
        .unwrap();

    let next = scheduled.next_sync.unwrap();
    assert!(next >= before + Duration::minutes(59));
    assert!(manual.next_sync.is_none());

    adapter.push_page(Page::last(contacts(0..3, "a", before)));
    let now = next + Duration::seconds(1);
    let report = service.scheduler().tick(now).await.unwrap();
    assert_eq!(report.triggered, vec![scheduled.id]);
    assert!(report.deferred.is_empty());

    let history = service.get_sync_history(scheduled.id, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger, SyncTrigger::Scheduled);
    service.wait_for_sync(history[0].id).await.unwrap();

    let source = service.get_data_source(scheduled.id).await.unwrap();
    assert!(source.next_sync.unwrap() > now);
    assert!(service
        .get_sync_history(manual.id, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_concurrency_cap_defers_and_busy_sources_are_skipped() {
    init_tracing();
    let adapter = ScriptedAdapter::gated("crm");
    let config = EngineConfig {
        max_concurrent_syncs: 1,
        ..EngineConfig::default()
    };
    let service = service_with(config, std::slice::from_ref(&adapter));
    service.register_schema(contact_schema()).await.unwrap();
    let a = service
        .create_data_source(hourly("a", adapter.provider()))
        .await
        .unwrap();
    let b = service
        .create_data_source(hourly("b", adapter.provider()))
        .await
        .unwrap();

    let now = Utc::now() + Duration::hours(2);
    let report = service.scheduler().tick(now).await.unwrap();
    assert_eq!(report.triggered.len(), 1);
    assert_eq!(report.deferred.len(), 1);
    let started = report.triggered[0];
    let deferred = report.deferred[0];
    assert!([a.id, b.id].contains(&started));
    assert_ne!(started, deferred);

    let source = service.get_data_source(deferred).await.unwrap();
    assert!(source.next_sync.unwrap() <= now);

    let later = now + Duration::hours(2);
    let report = service.scheduler().tick(later).await.unwrap();
    assert!(report.skipped.contains(&started));

    adapter.release(10);
    let run = service.get_sync_history(started, None).await.unwrap()[0].id;
    service.wait_for_sync(run).await.unwrap();
}

#[tokio::test]
async fn test_schedule_sync_applies_calendar_rules() {
    init_tracing();
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;

    let request: ScheduleRequest = serde_json::from_value(serde_json::json!({
        "frequency": "daily",
        "schedule": {
            "cron": "0 0 9 * * *",
            "timezone": "Europe/Berlin",
            "excluded_weekdays": ["Sat", "Sun"]
        }
    }))
    .unwrap();
    let source = service.schedule_sync(source_id, request).await.unwrap();
    let next = source.next_sync.unwrap();
    let local = next.with_timezone(&chrono_tz::Europe::Berlin);

    use chrono::{Datelike, Timelike, Weekday};
    assert_eq!(local.hour(), 9);
    assert!(!matches!(local.weekday(), Weekday::Sat | Weekday::Sun));

    let bad = ScheduleRequest {
        frequency: None,
        schedule: Some(ScheduleSpec {
            timezone: "Mars/Olympus".to_string(),
            ..ScheduleSpec::default()
        }),
    };
    let err = service.schedule_sync(source_id, bad).await.unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidInput(_)));

    let manual = ScheduleRequest {
        frequency: Some(SyncFrequency::Manual),
        schedule: None,
    };
    let source = service.schedule_sync(source_id, manual).await.unwrap();
    assert!(source.next_sync.is_none());
}
