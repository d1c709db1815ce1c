use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tributary_engine::models::TargetSchema;

use super::AppState;
use crate::api::ApiResponse;
use crate::error::ApiResult;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(register_schema).get(list_schemas))
}

#[tracing::instrument(skip(state, payload))]
async fn register_schema(
    State(state): State<AppState>,
    payload: Result<Json<TargetSchema>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(schema) = payload?;
    let schema = state.service.register_schema(schema).await?;

    tracing::info!(entity = %schema.entity, fields = schema.fields.len(), "Schema registered via API");

    Ok(ApiResponse::success(schema).with_status(StatusCode::CREATED))
}

#[tracing::instrument(skip(state))]
async fn list_schemas(State(state): State<AppState>) -> ApiResult<Response> {
    let schemas = state.service.list_schemas().await?;
    Ok(ApiResponse::success(schemas).into_response())
}
