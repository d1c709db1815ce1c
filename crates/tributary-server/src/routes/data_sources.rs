use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tributary_engine::models::{
    CreateDataSource, DataSourcePatch, ScheduleRequest, SourceFilter, SyncOptions, SyncTrigger,
};
use uuid::Uuid;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_data_source).get(list_data_sources))
        .route(
            "/:id",
            get(get_data_source)
                .patch(update_data_source)
                .delete(delete_data_source),
        )
        .route("/:id/sync", post(sync_data_source))
        .route("/:id/schedule", put(schedule_sync))
        .route("/:id/history", get(get_sync_history))
        .route("/:id/health", get(get_source_health))
}

#[tracing::instrument(skip(state, payload))]
async fn create_data_source(
    State(state): State<AppState>,
    payload: Result<Json<CreateDataSource>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let source = state.service.create_data_source(request).await?;

    tracing::info!(source_id = %source.id, name = %source.name, "Data source registered via API");

    Ok(ApiResponse::success(source.redacted()).with_status(StatusCode::CREATED))
}

#[tracing::instrument(skip(state, query))]
async fn list_data_sources(
    State(state): State<AppState>,
    query: Result<Query<SourceFilter>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(filter) = query?;
    let sources: Vec<_> = state
        .service
        .list_data_sources(&filter)
        .await?
        .iter()
        .map(|s| s.redacted())
        .collect();
    let count = sources.len();

    Ok(ApiResponse::success_with_meta(sources, json!({ "count": count })).into_response())
}

#[tracing::instrument(skip(state), fields(source_id = %id))]
async fn get_data_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let source = state.service.get_data_source(id).await?;
    Ok(ApiResponse::success(source.redacted()).into_response())
}

#[tracing::instrument(skip(state, payload), fields(source_id = %id))]
async fn update_data_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<DataSourcePatch>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(patch) = payload?;
    let source = state.service.update_data_source(id, patch).await?;

    tracing::info!(source_id = %source.id, "Data source updated via API");

    Ok(ApiResponse::success(source.redacted()).into_response())
}

#[tracing::instrument(skip(state), fields(source_id = %id))]
async fn delete_data_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    state.service.delete_data_source(id).await?;
    let source = state.service.get_data_source(id).await?;

    tracing::info!(source_id = %id, "Data source deprecated via API");

    Ok(ApiResponse::success(source.redacted()).into_response())
}

/// Manual trigger; the body is optional
#[tracing::instrument(skip(state, payload), fields(source_id = %id))]
async fn sync_data_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<SyncOptions>>,
) -> ApiResult<Response> {
    let mut options = payload.map(|Json(o)| o).unwrap_or_default();
    options.trigger = SyncTrigger::Manual;

    let sync_id = state.service.sync_data_source(id, options).await?;

    tracing::info!(source_id = %id, sync_id = %sync_id, "Sync queued via API");

    Ok(ApiResponse::success(json!({ "sync_id": sync_id })).with_status(StatusCode::ACCEPTED))
}

#[tracing::instrument(skip(state, payload), fields(source_id = %id))]
async fn schedule_sync(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let source = state.service.schedule_sync(id, request).await?;
    Ok(ApiResponse::success(source.redacted()).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[tracing::instrument(skip(state, query), fields(source_id = %id))]
async fn get_sync_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let history = state.service.get_sync_history(id, query.limit).await?;
    let count = history.len();
    Ok(ApiResponse::success_with_meta(history, json!({ "count": count })).into_response())
}

#[tracing::instrument(skip(state), fields(source_id = %id))]
async fn get_source_health(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let report = state.service.get_source_health(id).await?;
    Ok(ApiResponse::success(report).into_response())
}
