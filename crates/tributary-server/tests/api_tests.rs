//! API integration tests for the Tributary server
//!
//! Routes are driven in-process with `tower::ServiceExt::oneshot` against an engine backed
//! by the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use tributary_engine::webhook::{sign, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use tributary_engine::{EngineConfig, IntegrationService};
use tributary_server::{config::CorsConfig, create_app, AppState};

const SECRET: &str = "whsec_api_test_secret";

// ============================================================================
// Helper Functions
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn create_test_app() -> Router {
    init_tracing();
    let service = IntegrationService::builder(EngineConfig::default()).build();
    let cors = CorsConfig {
        allowed_origins: vec!["*".to_string()],
        allow_credentials: false,
    };
    create_app(AppState::new(service), &cors)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn with_body(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn register_contact_schema(app: &Router) {
    let (status, _) = with_body(
        app,
        "POST",
        "/api/v1/schemas",
        json!({
            "entity": "contact",
            "fields": [
                {"name": "email", "field_type": "string", "required": true},
                {"name": "name", "field_type": "string"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

fn mapping() -> Value {
    json!({
        "target_entity": "contact",
        "key_fields": ["email"],
        "field_mappings": [
            {"source_field": "email", "target_field": "email"},
            {"source_field": "name", "target_field": "name"}
        ]
    })
}

fn rest_source() -> Value {
    json!({
        "name": "crm contacts",
        "provider": "crm",
        "configuration": {"type": "rest_api", "endpoint": "https://crm.example.com/contacts"},
        "authentication": {"type": "api_key", "header": "X-Api-Key", "key": "super-secret"},
        "sync_settings": {"conflict_resolution": "last_write_wins"},
        "data_mapping": mapping()
    })
}

fn webhook_source() -> Value {
    json!({
        "name": "crm pushes",
        "provider": "crm",
        "configuration": {"type": "webhook", "secret_key": SECRET},
        "sync_settings": {"conflict_resolution": "last_write_wins"},
        "data_mapping": mapping()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app();
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_data_source_lifecycle() {
    let app = create_test_app();
    register_contact_schema(&app).await;

    let (status, body) = with_body(&app, "POST", "/api/v1/data-sources", rest_source()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["authentication"]["type"], "api_key");
    assert_ne!(body["data"]["authentication"]["key"], "super-secret");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = get(&app, "/api/v1/data-sources").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 1);

    let (status, body) = with_body(
        &app,
        "PATCH",
        &format!("/api/v1/data-sources/{id}"),
        json!({"name": "crm contacts v2"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "crm contacts v2");

    let (status, body) = get(&app, &format!("/api/v1/data-sources/{id}/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "healthy");

    let (status, body) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/data-sources/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "deprecated");

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/data-sources/{id}/sync"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "UNAVAILABLE");

    let (_, body) = get(&app, "/api/v1/data-sources").await;
    assert_eq!(body["meta"]["count"], 0);
}

#[tokio::test]
async fn test_registration_errors_use_the_error_envelope() {
    let app = create_test_app();

    let (status, body) = with_body(&app, "POST", "/api/v1/data-sources", rest_source()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/data-sources")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, body) = get(
        &app,
        "/api/v1/data-sources/6f9619ff-8b86-4d01-b42d-00cf4fc964ff",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_signed_webhook_is_accepted_and_processed() {
    let app = create_test_app();
    register_contact_schema(&app).await;

    let (status, body) = with_body(&app, "POST", "/api/v1/data-sources", webhook_source()).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let payload = json!({"records": [
        {"email": "ada@example.com", "name": "Ada"},
        {"email": "grace@example.com", "name": "Grace"}
    ]})
    .to_string();
    let ts = chrono::Utc::now().timestamp();

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/webhooks/{id}"))
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, format!("sha256={}", sign(SECRET, ts, payload.as_bytes())))
            .body(Body::from(payload.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let sync_id = body["data"]["sync_id"].as_str().unwrap().to_string();

    let mut progress = Value::Null;
    for _ in 0..200 {
        let (status, body) = get(&app, &format!("/api/v1/syncs/{sync_id}")).await;
        assert_eq!(status, StatusCode::OK);
        progress = body["data"].clone();
        if progress["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(progress["status"], "completed");
    assert_eq!(progress["records_created"], 2);

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/webhooks/{id}"))
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, "deadbeef")
            .body(Body::from(payload))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_inactive_pipeline_cannot_run() {
    let app = create_test_app();
    register_contact_schema(&app).await;
    let (_, body) = with_body(&app, "POST", "/api/v1/data-sources", rest_source()).await;
    let source_id = body["data"]["id"].clone();

    let (status, body) = with_body(
        &app,
        "POST",
        "/api/v1/pipelines",
        json!({"name": "nightly", "stages": [{"id": "pull", "source_id": source_id}]}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["state"], "draft");
    let pipeline_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/pipelines/{pipeline_id}/run"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "UNAVAILABLE");

    let (status, body) = get(&app, &format!("/api/v1/pipelines/{pipeline_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["latest_run"].is_null());
}

#[tokio::test]
async fn test_conflict_queue_starts_empty() {
    let app = create_test_app();
    let (status, body) = get(&app, "/api/v1/conflicts?status=pending").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 0);

    let (status, body) = with_body(
        &app,
        "POST",
        "/api/v1/conflicts/6f9619ff-8b86-4d01-b42d-00cf4fc964ff/resolve",
        json!({"value": "Ada"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
