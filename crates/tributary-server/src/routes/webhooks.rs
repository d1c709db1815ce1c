use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use serde_json::json;
use tributary_engine::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use uuid::Uuid;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new().route("/:source_id", post(receive_webhook))
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Signed push delivery; the raw body is verified before it is parsed
#[tracing::instrument(skip_all, fields(source_id = %source_id, bytes = body.len()))]
async fn receive_webhook(
    State(state): State<AppState>,
    Path(source_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let sync_id = state
        .service
        .receive_webhook(
            source_id,
            header(&headers, TIMESTAMP_HEADER),
            header(&headers, SIGNATURE_HEADER),
            &body,
        )
        .await
        .inspect_err(|e| tracing::warn!(source_id = %source_id, error = %e, "Webhook delivery rejected"))?;

    Ok(ApiResponse::success(json!({ "sync_id": sync_id })).with_status(StatusCode::ACCEPTED))
}
