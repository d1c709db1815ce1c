use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tributary_engine::models::ConflictFilter;
use uuid::Uuid;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_conflicts))
        .route("/:id/resolve", post(resolve_conflict))
}

#[derive(Debug, Deserialize)]
struct ResolveConflict {
    value: Value,
}

#[tracing::instrument(skip(state, query))]
async fn list_conflicts(
    State(state): State<AppState>,
    query: Result<Query<ConflictFilter>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(filter) = query?;
    let conflicts = state.service.list_conflicts(&filter).await?;
    let count = conflicts.len();
    Ok(ApiResponse::success_with_meta(conflicts, json!({ "count": count })).into_response())
}

#[tracing::instrument(skip(state, payload), fields(conflict_id = %id))]
async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ResolveConflict>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = payload?;
    let conflict = state.service.resolve_conflict(id, body.value).await?;

    tracing::info!(conflict_id = %id, logical_key = %conflict.conflict.logical_key, "Conflict resolved via API");

    Ok(ApiResponse::success(conflict).into_response())
}
