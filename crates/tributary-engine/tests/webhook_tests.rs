//! Signed webhook deliveries

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::Utc;
use common::*;
use serde_json::json;
use tributary_engine::models::{CreateDataSource, SyncStatus, SyncTrigger};
use tributary_engine::webhook::{sign, WebhookError};
use tributary_engine::{EngineConfig, IntegrationError, IntegrationService};
use uuid::Uuid;

const SECRET: &str = "whsec_0123456789abcdef";

fn webhook_source() -> CreateDataSource {
    let mut request = contact_source("crm pushes", "crm");
    request.configuration = serde_json::from_value(json!({
        "type": "webhook",
        "secret_key": SECRET
    }))
    .unwrap();
    request
}

async fn setup_webhook() -> (IntegrationService, Uuid) {
    init_tracing();
    let service = IntegrationService::builder(EngineConfig::default()).build();
    service.register_schema(contact_schema()).await.unwrap();
    let source = service.create_data_source(webhook_source()).await.unwrap();
    assert!(source.next_sync.is_none());
    (service, source.id)
}

fn delivery(count: usize) -> Vec<u8> {
    let records: Vec<_> = contacts(0..count, "pushed", Utc::now())
        .into_iter()
        .map(|r| r.data)
        .collect();
    serde_json::to_vec(&json!({ "records": records })).unwrap()
}

#[tokio::test]
async fn test_signed_delivery_is_ingested() {
    let (service, source_id) = setup_webhook().await;
    let body = delivery(4);
    let ts = Utc::now().timestamp();
    let signature = format!("sha256={}", sign(SECRET, ts, &body));

    let sync_id = service
        .receive_webhook(source_id, Some(&ts.to_string()), Some(&signature), &body)
        .await
        .unwrap();
    let result = service.wait_for_sync(sync_id).await.unwrap();

    assert_eq!(result.status, SyncStatus::Completed);
    assert_eq!(result.trigger, SyncTrigger::Webhook);
    assert_eq!(result.counts.records_created, 4);
    assert_eq!(service.store().count_records("contact").await.unwrap(), 4);
}

#[tokio::test]
async fn test_tampered_delivery_is_rejected_before_processing() {
    let (service, source_id) = setup_webhook().await;
    let body = delivery(2);
    let ts = Utc::now().timestamp();
    let signature = sign(SECRET, ts, &body);

    let mut tampered = body.clone();
    tampered.extend_from_slice(b" ");
    let err = service
        .receive_webhook(source_id, Some(&ts.to_string()), Some(&signature), &tampered)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::Webhook(WebhookError::InvalidSignature)
    ));

    let err = service
        .receive_webhook(source_id, Some(&ts.to_string()), None, &body)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::Webhook(WebhookError::MissingSignature)
    ));

    let stale = ts - 3_600;
    let signature = sign(SECRET, stale, &body);
    let err = service
        .receive_webhook(source_id, Some(&stale.to_string()), Some(&signature), &body)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::Webhook(WebhookError::Expired { .. })
    ));

    assert!(service
        .get_sync_history(source_id, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_replayed_delivery_is_rejected() {
    let (service, source_id) = setup_webhook().await;
    let body = delivery(1);
    let now = Utc::now().timestamp();
    let ts = now.to_string();
    let signature = sign(SECRET, now, &body);

    let sync_id = service
        .receive_webhook(source_id, Some(&ts), Some(&signature), &body)
        .await
        .unwrap();
    service.wait_for_sync(sync_id).await.unwrap();

    let err = service
        .receive_webhook(source_id, Some(&ts), Some(&signature), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::Webhook(WebhookError::Replayed)));
}

#[tokio::test]
async fn test_polling_sources_do_not_accept_webhooks() {
    let adapter = ScriptedAdapter::new("crm");
    let (service, source_id) = setup(&adapter).await;
    let body = delivery(1);
    let ts = Utc::now().timestamp();

    let err = service
        .receive_webhook(
            source_id,
            Some(&ts.to_string()),
            Some(&sign(SECRET, ts, &body)),
            &body,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::Webhook(WebhookError::NotWebhookSource(id)) if id == source_id
    ));
}

#[tokio::test]
async fn test_webhook_sources_cannot_be_polled() {
    let (service, source_id) = setup_webhook().await;
    let err = service
        .sync_data_source(source_id, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidInput(_)));
}
