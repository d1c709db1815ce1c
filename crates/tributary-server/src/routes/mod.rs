//! HTTP routes for the integration service
//!
//! Mounted under `/api/v1`:
//! - `/data-sources` - registration, updates, manual syncs, schedules, history, health
//! - `/syncs` - run status and cancellation
//! - `/schemas` - canonical target schemas
//! - `/pipelines` - pipeline definitions, activation and runs
//! - `/conflicts` - conflict audit log and manual resolution
//! - `/webhooks` - signed inbound deliveries

pub mod conflicts;
pub mod data_sources;
pub mod pipelines;
pub mod schemas;
pub mod syncs;
pub mod webhooks;

use axum::Router;
use tributary_engine::IntegrationService;

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub service: IntegrationService,
}

impl AppState {
    pub fn new(service: IntegrationService) -> Self {
        Self { service }
    }
}

/// Creates the API router with all feature routes mounted
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/data-sources", data_sources::routes())
        .nest("/syncs", syncs::routes())
        .nest("/schemas", schemas::routes())
        .nest("/pipelines", pipelines::routes())
        .nest("/conflicts", conflicts::routes())
        .nest("/webhooks", webhooks::routes())
        .with_state(state)
}
