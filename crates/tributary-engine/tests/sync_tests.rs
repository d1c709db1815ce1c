//! Run lifecycle tests against the in-memory store
//!
//! Covers:
//! - page-by-page counting and last-write-wins merges
//! - idempotent re-runs
//! - bounded backoff on rate limits
//! - configuration errors failing before any network call
//! - cooperative cancellation and single-flight admission
//! - run deadlines and parallel runs of different sources

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;
use tributary_engine::adapter::{AdapterError, Page, SourceAdapter};
use tributary_engine::credentials::{AccessToken, TokenRefresher};
use tributary_engine::models::{
    DataSourcePatch, OAuth2Config, SyncMode, SyncOptions, SyncProgress, SyncResult, SyncStatus,
    SyncTrigger,
};
use tributary_engine::{EngineConfig, ErrorKind, IntegrationError, IntegrationService};

#[tokio::test]
async fn test_incremental_run_counts_creates_and_newer_duplicates() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;

    let t0 = Utc::now() - Duration::hours(2);
    let t1 = t0 + Duration::hours(1);
    adapter.push_page(Page::with_next(contacts(0..10, "first", t0), "page-2"));
    let mut second = contacts(10..13, "first", t1);
    second.push(contact(0, "second", t1));
    second.push(contact(1, "second", t1));
    adapter.push_page(Page::last(second));

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.counts.records_created, 13);
    assert_eq!(result.counts.records_updated, 2);
    assert_eq!(result.counts.records_failed, 0);
    assert_eq!(result.counts.records_processed, 15);
    assert!(result.counts.is_consistent());
    assert_eq!(result.performance_metrics.pages_fetched, 2);
    assert_eq!(adapter.tokens(), vec![None, Some("page-2".to_string())]);

    let store = service.store();
    assert_eq!(store.count_records("contact").await.unwrap(), 13);
    for i in [0, 1] {
        let record = store.get_record("contact", &contact_key(i)).await.unwrap().unwrap();
        assert_eq!(record.fields["name"].value, "second");
    }
    let untouched = store.get_record("contact", &contact_key(2)).await.unwrap().unwrap();
    assert_eq!(untouched.fields["name"].value, "first");

    let source = service.get_data_source(source_id).await.unwrap();
    assert_eq!(source.sync_cursor.as_deref(), Some("page-2"));
    assert!(source.last_sync.is_some());
}

#[tokio::test]
async fn test_rerunning_the_same_pages_leaves_state_unchanged() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    let at = Utc::now() - Duration::minutes(5);
    let options = SyncOptions {
        mode: Some(SyncMode::FullSync),
        ..SyncOptions::default()
    };

    adapter.push_page(Page::last(contacts(0..10, "same", at)));
    let first = service.sync_data_source(source_id, options.clone()).await.unwrap();
    service.wait_for_sync(first).await.unwrap();
    let before = service
        .store()
        .get_record("contact", &contact_key(3))
        .await
        .unwrap()
        .unwrap();

    adapter.push_page(Page::last(contacts(0..10, "same", at)));
    let second = service.sync_data_source(source_id, options).await.unwrap();
    let result = service.wait_for_sync(second).await.unwrap();

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.counts.records_created, 0);
    assert_eq!(result.counts.records_updated, 10);
    assert_eq!(service.store().count_records("contact").await.unwrap(), 10);

    let after = service
        .store()
        .get_record("contact", &contact_key(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.fields, before.fields);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_rate_limit_fails_after_max_retries() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    for _ in 0..10 {
        adapter.push_error(AdapterError::RateLimited { retry_after: None });
    }

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(adapter.calls(), 4);
    assert_eq!(result.performance_metrics.retries, 3);
    let error = result.errors.last().unwrap();
    assert_eq!(error.kind, ErrorKind::RateLimitExceeded);
}

#[tokio::test]
async fn test_broken_mapping_fails_without_network_calls() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;

    let mut schema = contact_schema();
    schema.fields.push(
        serde_json::from_value(serde_json::json!({
            "name": "phone", "field_type": "string", "required": true
        }))
        .unwrap(),
    );
    service.register_schema(schema).await.unwrap();

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(result.errors[0].kind, ErrorKind::FatalConfigError);
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_failure_mid_run_keeps_committed_pages() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    adapter.push_page(Page::with_next(contacts(0..10, "a", Utc::now()), "p2"));
    adapter.push_error(AdapterError::Malformed("truncated body".to_string()));

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(result.counts.records_created, 10);
    assert_eq!(service.store().count_records("contact").await.unwrap(), 10);

    let source = service.get_data_source(source_id).await.unwrap();
    assert!(source.last_sync.is_none());
}

#[tokio::test]
async fn test_invalid_record_is_counted_and_run_continues() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    let mut page = contacts(0..3, "ok", Utc::now());
    page.push(tributary_engine::models::RawRecord::new(
        serde_json::json!({"name": "no email"}),
    ));
    adapter.push_page(Page::last(page));

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.counts.records_created, 3);
    assert_eq!(result.counts.records_failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.data_quality_report.invalid_records, 1);
}

#[tokio::test]
async fn test_auth_failure_is_retried_once_after_refresh() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    adapter.push_error(AdapterError::Auth("token expired".to_string()));
    adapter.push_page(Page::last(contacts(0..2, "a", Utc::now())));

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();
    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.counts.records_created, 2);

    adapter.push_error(AdapterError::Auth("revoked".to_string()));
    adapter.push_error(AdapterError::Auth("revoked".to_string()));
    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();
    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(result.errors.last().unwrap().kind, ErrorKind::AuthError);
    assert_eq!(adapter.calls(), 4);
}

#[tokio::test]
async fn test_cancel_stops_between_pages() {
    let adapter = ScriptedAdapter::gated("crm");
    let (service, source_id) = setup(&adapter).await;
    let at = Utc::now();
    adapter.push_page(Page::with_next(contacts(0..10, "a", at), "p2"));
    adapter.push_page(Page::with_next(contacts(10..20, "a", at), "p3"));
    adapter.push_page(Page::last(contacts(20..30, "a", at)));

    let sync_id = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();
    adapter.release(1);
    let progress = wait_until(&service, sync_id, |p: &SyncProgress| {
        p.counts.records_created == 10
    })
    .await;
    assert_eq!(progress.status, SyncStatus::Running);

    service.cancel_sync(sync_id).await.unwrap();
    adapter.release(5);
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Cancelled);
    let created = result.counts.records_created;
    assert!(created == 10 || created == 20, "unexpected count {created}");
    assert_eq!(
        service.store().count_records("contact").await.unwrap() as u64,
        created
    );

    let err = service.cancel_sync(sync_id).await.unwrap_err();
    assert!(matches!(err, IntegrationError::AlreadyFinalized(id) if id == sync_id));
}

#[tokio::test]
async fn test_second_run_of_a_source_is_rejected_or_queued() {
    let adapter = ScriptedAdapter::gated("crm");
    let (service, source_id) = setup(&adapter).await;
    adapter.push_page(Page::last(contacts(0..5, "a", Utc::now())));

    let first = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap();

    let err = service
        .sync_data_source(source_id, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::AlreadyRunning(id) if id == source_id));

    let err = service
        .update_data_source(
            source_id,
            DataSourcePatch {
                name: Some("renamed".to_string()),
                ..DataSourcePatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::SourceBusy(_)));

    let forced = service
        .sync_data_source(source_id, SyncOptions::forced())
        .await
        .unwrap();
    adapter.release(2);

    let first: SyncResult = service.wait_for_sync(first).await.unwrap();
    let forced: SyncResult = service.wait_for_sync(forced).await.unwrap();
    assert_eq!(first.status, SyncStatus::Completed);
    assert_eq!(forced.status, SyncStatus::Completed);
    assert!(forced.started_at.unwrap() >= first.completed_at.unwrap());
}

#[tokio::test]
async fn test_orphaned_runs_are_finalized_on_recovery() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;

    let orphan = SyncResult::pending(source_id, SyncMode::Incremental, SyncTrigger::Manual);
    service.store().insert_sync_result(&orphan).await.unwrap();

    assert_eq!(service.recover_orphaned_runs().await.unwrap(), 1);
    let result = service.get_sync_result(orphan.id).await.unwrap();
    assert_eq!(result.status, SyncStatus::Failed);
    assert!(result.completed_at.is_some());
    assert_eq!(result.errors[0].kind, ErrorKind::Internal);

    assert_eq!(service.recover_orphaned_runs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_history_is_newest_first() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = service
            .sync_data_source(source_id, SyncOptions::default())
            .await
            .unwrap();
        service.wait_for_sync(id).await.unwrap();
        ids.push(id);
    }

    let history = service.get_sync_history(source_id, Some(2)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, ids[2]);
    assert_eq!(history[1].id, ids[1]);
}

#[tokio::test]
async fn test_run_past_its_deadline_fails_and_keeps_committed_pages() {
    init_tracing();
    let adapter = ScriptedAdapter::gated("crm");
    let service = service_with(EngineConfig::default(), std::slice::from_ref(&adapter));
    service.register_schema(contact_schema()).await.unwrap();
    let mut request = contact_source("contacts", adapter.provider());
    request.sync_settings.run_timeout_secs = 1;
    let source = service.create_data_source(request).await.unwrap();

    let at = Utc::now();
    adapter.push_page(Page::with_next(contacts(0..3, "a", at), "p2"));
    adapter.push_page(Page::with_next(contacts(3..6, "a", at), "p3"));
    adapter.push_page(Page::last(contacts(6..9, "a", at)));

    let sync_id = service
        .sync_data_source(source.id, SyncOptions::default())
        .await
        .unwrap();
    adapter.release(1);
    let progress = wait_until(&service, sync_id, |p| p.pages_fetched == 1).await;
    assert_eq!(progress.status, SyncStatus::Running);

    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    adapter.release(2);
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    let error = result.errors.last().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert!(error.message.contains("deadline"));
    assert_eq!(adapter.calls(), 2);
    assert_eq!(result.counts.records_created, 6);
    assert_eq!(service.store().count_records("contact").await.unwrap(), 6);
}

#[tokio::test]
async fn test_runs_of_different_sources_proceed_in_parallel() {
    init_tracing();
    let crm = ScriptedAdapter::gated("crm");
    let erp = ScriptedAdapter::gated("erp");
    let service = service_with(EngineConfig::default(), &[crm.clone(), erp.clone()]);
    service.register_schema(contact_schema()).await.unwrap();
    let crm_source = service
        .create_data_source(contact_source("crm", crm.provider()))
        .await
        .unwrap();
    let erp_source = service
        .create_data_source(contact_source("erp", erp.provider()))
        .await
        .unwrap();

    let at = Utc::now();
    crm.push_page(Page::last(contacts(0..3, "crm", at)));
    erp.push_page(Page::last(contacts(10..12, "erp", at)));

    let first = service
        .sync_data_source(crm_source.id, SyncOptions::default())
        .await
        .unwrap();
    let second = service
        .sync_data_source(erp_source.id, SyncOptions::default())
        .await
        .unwrap();

    // both runs hold a permit at the same time while their fetches are held back
    for sync_id in [first, second] {
        let progress = wait_until(&service, sync_id, |p| p.status == SyncStatus::Running).await;
        assert_eq!(progress.status, SyncStatus::Running);
    }

    erp.release(1);
    let erp_result = service.wait_for_sync(second).await.unwrap();
    assert_eq!(erp_result.status, SyncStatus::Completed);
    assert_eq!(
        service.get_sync_status(first).await.unwrap().status,
        SyncStatus::Running
    );

    crm.release(1);
    let crm_result = service.wait_for_sync(first).await.unwrap();
    assert_eq!(crm_result.status, SyncStatus::Completed);
    assert_eq!(service.store().count_records("contact").await.unwrap(), 5);
}

/// Signals once a token request is in flight, then never answers
struct StalledTokenEndpoint {
    entered: Arc<Notify>,
}

#[async_trait]
impl TokenRefresher for StalledTokenEndpoint {
    async fn fetch_token(
        &self,
        _config: &OAuth2Config,
        _refresh_token: Option<&str>,
    ) -> Result<AccessToken, AdapterError> {
        self.entered.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_stalled_token_endpoint_only_holds_its_own_source() {
    init_tracing();
    let entered = Arc::new(Notify::new());
    let crm = ScriptedAdapter::new("crm");
    let erp = ScriptedAdapter::new("erp");
    let service = IntegrationService::builder(EngineConfig::default())
        .adapter(crm.clone())
        .adapter(erp.clone())
        .token_refresher(Arc::new(StalledTokenEndpoint {
            entered: entered.clone(),
        }))
        .build();
    service.register_schema(contact_schema()).await.unwrap();

    let mut oauth_request = contact_source("crm", crm.provider());
    oauth_request.authentication = serde_json::from_value(json!({
        "type": "oauth2",
        "token_url": "https://auth.example.com/token",
        "client_id": "tributary",
        "client_secret": "s3cret"
    }))
    .unwrap();
    let oauth_source = service.create_data_source(oauth_request).await.unwrap();
    let plain_source = service
        .create_data_source(contact_source("erp", erp.provider()))
        .await
        .unwrap();

    let stalled = service
        .sync_data_source(oauth_source.id, SyncOptions::default())
        .await
        .unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), entered.notified())
        .await
        .expect("token request never started");

    erp.push_page(Page::last(contacts(0..2, "erp", Utc::now())));
    let sync_id = service
        .sync_data_source(plain_source.id, SyncOptions::default())
        .await
        .unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), service.wait_for_sync(sync_id))
        .await
        .expect("run of another source waited behind the stalled token request")
        .unwrap();

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.counts.records_created, 2);
    assert_eq!(crm.calls(), 0);
    assert_eq!(
        service.get_sync_status(stalled).await.unwrap().status,
        SyncStatus::Running
    );
}
