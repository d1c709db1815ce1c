//! Public entry point of the engine
//!
//! [`IntegrationService`] owns the shared collaborators (store, adapters, credentials,
//! run registry, health monitor) and exposes every operation the HTTP layer and the
//! CLI need. It is cheap to clone.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, SourceAdapter};
use crate::config::EngineConfig;
use crate::conflict::content_hash;
use crate::credentials::{AuthHealth, CredentialStore, OAuthTokenClient, TokenRefresher};
use crate::error::{ErrorKind, IntegrationError, Result, Severity, SyncError};
use crate::health::{AlertNotifier, HealthMonitor, SourceHealth, TracingNotifier};
use crate::mapper::functions::{CustomFn, FunctionRegistry};
use crate::mapper::schema::coerce;
use crate::mapper::CompiledMapping;
use crate::models::{
    ConflictFilter, ConflictStatus, CreateDataSource, CreatePipeline, DataSource,
    DataSourcePatch, DataSourceType, FieldValue, Pipeline, PipelineResult, PipelineState,
    PipelineStatusReport, QueuedConflict, ScheduleRequest, SourceConfiguration, SourceFilter,
    SourceStatus, StreamEvent, SyncFrequency, SyncOptions, SyncProgress, SyncResult,
    SyncStatus, TargetSchema,
};
use crate::pipeline::{validate_stages, PipelineOrchestrator};
use crate::retry::RetryPolicy;
use crate::scheduler::{next_run_after, validate_schedule, Scheduler};
use crate::store::{IntegrationStore, MemoryStore, RecordWrite, StoreError};
use crate::sync::{SyncContext, SyncRegistry, Synchronizer};
use crate::validator::Validator;
use crate::webhook::{parse_payload, WebhookError, WebhookVerifier};

/// Default page of sync history
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Largest page of sync history returned at once
pub const MAX_HISTORY_LIMIT: usize = 500;

const MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// Health of a source including its credential state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealthReport {
    #[serde(flatten)]
    pub health: SourceHealth,
    pub auth: AuthHealth,
}

pub struct IntegrationServiceBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn IntegrationStore>>,
    adapters: Option<AdapterRegistry>,
    extra_adapters: Vec<Arc<dyn SourceAdapter>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    functions: FunctionRegistry,
}

impl IntegrationServiceBuilder {
    pub fn store(mut self, store: Arc<dyn IntegrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default adapter set
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Add a provider adapter on top of the configured set
    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.extra_adapters.push(adapter);
        self
    }

    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Register a named `custom_function` transformation
    pub fn function(mut self, name: impl Into<String>, function: CustomFn) -> Self {
        self.functions.register(name, function);
        self
    }

    pub fn build(self) -> IntegrationService {
        let http = reqwest::Client::builder()
            .timeout(self.config.http_timeout())
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP client with timeout unavailable, using defaults");
                reqwest::Client::new()
            });
        let mut adapters = self
            .adapters
            .unwrap_or_else(|| AdapterRegistry::with_defaults(http.clone()));
        for adapter in self.extra_adapters {
            adapters.register(adapter);
        }

        let refresher = self
            .refresher
            .unwrap_or_else(|| Arc::new(OAuthTokenClient::new(http)));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let ctx = SyncContext {
            store,
            adapters,
            credentials: Arc::new(CredentialStore::new(refresher, self.config.refresh_skew())),
            registry: Arc::new(SyncRegistry::new(self.config.max_concurrent_syncs)),
            health: Arc::new(HealthMonitor::new(self.config.health.clone(), notifier)),
            functions: self.functions,
            config: self.config,
        };
        let synchronizer = Synchronizer::new(ctx);

        IntegrationService {
            inner: Arc::new(ServiceInner {
                orchestrator: PipelineOrchestrator::new(synchronizer.clone()),
                synchronizer,
                webhooks: WebhookVerifier::new(),
            }),
        }
    }
}

struct ServiceInner {
    synchronizer: Synchronizer,
    orchestrator: PipelineOrchestrator,
    webhooks: WebhookVerifier,
}

#[derive(Clone)]
pub struct IntegrationService {
    inner: Arc<ServiceInner>,
}

impl IntegrationService {
    pub fn builder(config: EngineConfig) -> IntegrationServiceBuilder {
        IntegrationServiceBuilder {
            config,
            store: None,
            adapters: None,
            extra_adapters: Vec::new(),
            refresher: None,
            notifier: None,
            functions: FunctionRegistry::builtin(),
        }
    }

    fn ctx(&self) -> &SyncContext {
        self.inner.synchronizer.context()
    }

    pub fn store(&self) -> &Arc<dyn IntegrationStore> {
        &self.ctx().store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx().config
    }

    /// Scheduler bound to this service; `spawn_scheduler` runs it in the background
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.inner.synchronizer.clone())
    }

    pub fn spawn_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.scheduler().spawn(shutdown)
    }

    async fn load_source(&self, id: Uuid) -> Result<DataSource> {
        self.store()
            .get_source(id)
            .await?
            .ok_or(IntegrationError::SourceNotFound(id))
    }

    // ------------------------------------------------------------------------
    // Schemas
    // ------------------------------------------------------------------------

    /// Register or replace the canonical schema of an entity
    #[instrument(skip(self, schema), fields(entity = %schema.entity))]
    pub async fn register_schema(&self, schema: TargetSchema) -> Result<TargetSchema> {
        if schema.entity.trim().is_empty() {
            return Err(IntegrationError::InvalidInput(
                "schema entity must not be empty".to_string(),
            ));
        }
        if schema.fields.is_empty() {
            return Err(IntegrationError::InvalidInput(format!(
                "schema '{}' declares no fields",
                schema.entity
            )));
        }
        let mut names = std::collections::HashSet::new();
        for field in &schema.fields {
            if !names.insert(field.name.as_str()) {
                return Err(IntegrationError::InvalidInput(format!(
                    "field '{}' is declared twice in schema '{}'",
                    field.name, schema.entity
                )));
            }
            if let Some(default) = &field.default_value {
                coerce(default.clone(), field.field_type).map_err(|e| {
                    IntegrationError::InvalidInput(format!(
                        "default of field '{}' does not fit its type: {e}",
                        field.name
                    ))
                })?;
            }
        }

        self.store().put_schema(&schema).await?;
        info!(fields = schema.fields.len(), "schema registered");
        Ok(schema)
    }

    pub async fn list_schemas(&self) -> Result<Vec<TargetSchema>> {
        Ok(self.store().list_schemas().await?)
    }

    // ------------------------------------------------------------------------
    // Data sources
    // ------------------------------------------------------------------------

    /// Everything a source must satisfy before it is stored
    async fn check_source(&self, source: &DataSource) -> Result<()> {
        if source.name.trim().is_empty() {
            return Err(IntegrationError::InvalidInput(
                "data source name must not be empty".to_string(),
            ));
        }
        source
            .configuration
            .validate()
            .map_err(IntegrationError::FatalConfig)?;
        source
            .sync_settings
            .validate()
            .map_err(IntegrationError::FatalConfig)?;
        if let Some(schedule) = &source.sync_settings.schedule {
            validate_schedule(schedule)?;
        }
        if source.source_type != DataSourceType::Webhook
            && self.ctx().adapters.resolve(source).is_none()
        {
            return Err(IntegrationError::AdapterNotFound(source.provider.clone()));
        }

        let entity = &source.data_mapping.target_entity;
        let schema = self
            .store()
            .get_schema(entity)
            .await?
            .ok_or_else(|| IntegrationError::SchemaNotFound(entity.clone()))?;
        CompiledMapping::compile(&source.data_mapping, &schema, &self.ctx().functions)?;
        Validator::compile(&source.data_mapping, &schema)?;
        Ok(())
    }

    fn schedule_next(&self, source: &mut DataSource) -> Result<()> {
        let next = match (&source.configuration, source.status.can_sync()) {
            (SourceConfiguration::Webhook(_), _) | (_, false) => None,
            _ => next_run_after(&source.sync_settings, Utc::now())?,
        };
        source.set_next_sync(next);
        Ok(())
    }

    /// Register a source after validating its configuration, schedule and mapping
    #[instrument(skip(self, request), fields(name = %request.name, provider = %request.provider))]
    pub async fn create_data_source(&self, request: CreateDataSource) -> Result<DataSource> {
        let mut source = DataSource::from_request(request);
        if source.sync_settings.retry_policy == RetryPolicy::default() {
            source.sync_settings.retry_policy.max_retries = self.config().default_max_retries;
        }
        self.check_source(&source).await?;
        self.schedule_next(&mut source)?;

        self.store().insert_source(&source).await?;
        self.ctx()
            .credentials
            .register(source.id, source.authentication.clone())
            .await;

        info!(
            source_id = %source.id,
            source_type = source.source_type.as_str(),
            next_sync = ?source.next_sync,
            "data source registered"
        );
        Ok(source)
    }

    /// Apply a partial update; refused while a run holds the source
    #[instrument(skip(self, patch))]
    pub async fn update_data_source(&self, id: Uuid, patch: DataSourcePatch) -> Result<DataSource> {
        let _guard = self.ctx().registry.begin_edit(id)?;
        let mut source = self.load_source(id).await?;

        let reschedule = patch.sync_settings.is_some() || patch.status.is_some();
        let new_auth = patch.authentication.is_some();
        patch.apply(&mut source);

        self.check_source(&source).await?;
        if reschedule {
            self.schedule_next(&mut source)?;
        }

        self.store().update_source(&source).await?;
        if new_auth {
            self.ctx()
                .credentials
                .register(source.id, source.authentication.clone())
                .await;
        }
        info!(source_id = %id, "data source updated");
        Ok(source)
    }

    /// Soft delete: the source is deprecated and never synchronized again
    #[instrument(skip(self))]
    pub async fn delete_data_source(&self, id: Uuid) -> Result<()> {
        let guard = self.ctx().registry.begin_edit(id)?;
        let mut source = self.load_source(id).await?;

        source.status = SourceStatus::Deprecated;
        source.next_sync = None;
        source.updated_at = Utc::now();
        self.store().update_source(&source).await?;
        self.ctx().credentials.remove(id).await;
        self.ctx().health.forget(id).await;

        drop(guard);
        self.ctx().registry.forget_source(id);
        info!(source_id = %id, "data source deprecated");
        Ok(())
    }

    pub async fn get_data_source(&self, id: Uuid) -> Result<DataSource> {
        self.load_source(id).await
    }

    pub async fn list_data_sources(&self, filter: &SourceFilter) -> Result<Vec<DataSource>> {
        Ok(self.store().list_sources(filter).await?)
    }

    // ------------------------------------------------------------------------
    // Syncs
    // ------------------------------------------------------------------------

    /// Start a run and return its id without waiting for it
    pub async fn sync_data_source(&self, source_id: Uuid, options: SyncOptions) -> Result<Uuid> {
        self.inner.synchronizer.start(source_id, options).await
    }

    /// Change how often the source runs and recompute its next run
    #[instrument(skip(self, request))]
    pub async fn schedule_sync(&self, source_id: Uuid, request: ScheduleRequest) -> Result<DataSource> {
        let _guard = self.ctx().registry.begin_edit(source_id)?;
        let mut source = self.load_source(source_id).await?;

        if let Some(schedule) = &request.schedule {
            validate_schedule(schedule)?;
        }
        if let Some(frequency) = request.frequency {
            source.sync_settings.frequency = frequency;
        }
        source.sync_settings.schedule = request.schedule;
        if source.sync_settings.frequency == SyncFrequency::Manual
            && source
                .sync_settings
                .schedule
                .as_ref()
                .is_some_and(|s| s.cron.is_some())
        {
            return Err(IntegrationError::InvalidInput(
                "a cron schedule needs a non-manual frequency".to_string(),
            ));
        }

        self.schedule_next(&mut source)?;
        source.updated_at = Utc::now();
        self.store().update_source(&source).await?;
        info!(source_id = %source_id, next_sync = ?source.next_sync, "schedule updated");
        Ok(source)
    }

    /// Request cancellation of a run
    ///
    /// A run that is not in flight but was never finalized (its worker died) is
    /// finalized as cancelled here.
    #[instrument(skip(self))]
    pub async fn cancel_sync(&self, sync_id: Uuid) -> Result<SyncProgress> {
        let mut result = self.get_sync_result(sync_id).await?;
        if result.is_finalized() {
            return Err(IntegrationError::AlreadyFinalized(sync_id));
        }

        if self.inner.synchronizer.cancel(sync_id) {
            info!(%sync_id, "cancellation requested");
            return Ok(SyncProgress::from(&result));
        }

        result.status = SyncStatus::Cancelled;
        result.completed_at = Some(Utc::now());
        result.warnings.push(SyncError::new(
            ErrorKind::Cancelled,
            Severity::Info,
            "cancelled on request",
        ));
        match self.store().update_sync_result(&result).await {
            Ok(()) => Ok(SyncProgress::from(&result)),
            Err(StoreError::Finalized(_)) => Err(IntegrationError::AlreadyFinalized(sync_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_sync_result(&self, sync_id: Uuid) -> Result<SyncResult> {
        self.store()
            .get_sync_result(sync_id)
            .await?
            .ok_or(IntegrationError::SyncNotFound(sync_id))
    }

    pub async fn get_sync_status(&self, sync_id: Uuid) -> Result<SyncProgress> {
        Ok(SyncProgress::from(&self.get_sync_result(sync_id).await?))
    }

    /// Most recent runs of a source, newest first
    pub async fn get_sync_history(&self, source_id: Uuid, limit: Option<usize>) -> Result<Vec<SyncResult>> {
        self.load_source(source_id).await?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store().list_sync_results(source_id, limit).await?)
    }

    /// Wait for a run to finish and return its final result
    pub async fn wait_for_sync(&self, sync_id: Uuid) -> Result<SyncResult> {
        self.inner.synchronizer.wait(sync_id).await;
        self.get_sync_result(sync_id).await
    }

    /// Finalize runs left unfinished by a previous process
    #[instrument(skip(self))]
    pub async fn recover_orphaned_runs(&self) -> Result<usize> {
        let mut recovered = 0;
        for mut result in self.store().list_unfinished_sync_results().await? {
            if self.ctx().registry.is_tracked(result.id) {
                continue;
            }
            result.status = SyncStatus::Failed;
            result.completed_at = Some(Utc::now());
            result.errors.push(SyncError::new(
                ErrorKind::Internal,
                Severity::Critical,
                "worker stopped before the run finished",
            ));
            match self.store().update_sync_result(&result).await {
                Ok(()) | Err(StoreError::Finalized(_)) => recovered += 1,
                Err(e) => return Err(e.into()),
            }
            warn!(sync_id = %result.id, source_id = %result.source_id, "orphaned run finalized as failed");
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------------

    async fn check_stage_sources(&self, pipeline: &Pipeline) -> Result<()> {
        for stage in &pipeline.stages {
            let source = self.load_source(stage.source_id).await?;
            if source.status == SourceStatus::Deprecated {
                return Err(IntegrationError::InvalidPipeline(format!(
                    "stage '{}' uses deprecated data source {}",
                    stage.id, source.id
                )));
            }
        }
        Ok(())
    }

    /// Store a pipeline after checking its stage graph
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_pipeline(&self, request: CreatePipeline) -> Result<Pipeline> {
        if request.name.trim().is_empty() {
            return Err(IntegrationError::InvalidInput(
                "pipeline name must not be empty".to_string(),
            ));
        }
        validate_stages(&request.stages)?;
        let pipeline = Pipeline::from_request(request);
        self.check_stage_sources(&pipeline).await?;

        self.store().insert_pipeline(&pipeline).await?;
        info!(pipeline_id = %pipeline.id, stages = pipeline.stages.len(), "pipeline created");
        Ok(pipeline)
    }

    pub async fn get_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.store()
            .get_pipeline(id)
            .await?
            .ok_or(IntegrationError::PipelineNotFound(id))
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.store().list_pipelines().await?)
    }

    async fn set_pipeline_state(&self, id: Uuid, state: PipelineState) -> Result<Pipeline> {
        let mut pipeline = self.get_pipeline(id).await?;
        if state == PipelineState::Active {
            self.check_stage_sources(&pipeline).await?;
        }
        pipeline.state = state;
        pipeline.updated_at = Utc::now();
        self.store().update_pipeline(&pipeline).await?;
        info!(pipeline_id = %id, ?state, "pipeline state changed");
        Ok(pipeline)
    }

    pub async fn activate_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.set_pipeline_state(id, PipelineState::Active).await
    }

    pub async fn deactivate_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.set_pipeline_state(id, PipelineState::Inactive).await
    }

    /// Run every stage in dependency order and return the final result
    pub async fn run_pipeline(&self, id: Uuid) -> Result<PipelineResult> {
        let pipeline = self.get_pipeline(id).await?;
        self.inner.orchestrator.run(&pipeline).await
    }

    pub async fn monitor_pipeline(&self, id: Uuid) -> Result<PipelineStatusReport> {
        let pipeline = self.get_pipeline(id).await?;
        self.inner.orchestrator.status(&pipeline).await
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    pub async fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<QueuedConflict>> {
        Ok(self.store().list_conflicts(filter).await?)
    }

    /// Settle a queued conflict with an explicit value
    ///
    /// The value is coerced to the schema type of the field and written to the
    /// canonical record, unless the record has been deleted since.
    #[instrument(skip(self, value))]
    pub async fn resolve_conflict(&self, conflict_id: Uuid, value: Value) -> Result<QueuedConflict> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut queued = self
                .store()
                .get_conflict(conflict_id)
                .await?
                .ok_or(IntegrationError::ConflictNotFound(conflict_id))?;
            if queued.status == ConflictStatus::Resolved {
                return Err(IntegrationError::InvalidInput(format!(
                    "conflict {conflict_id} is already resolved"
                )));
            }

            let entity = queued.conflict.entity.clone();
            let field = queued.conflict.field.clone();
            let schema = self
                .store()
                .get_schema(&entity)
                .await?
                .ok_or_else(|| IntegrationError::SchemaNotFound(entity.clone()))?;
            let resolved = match schema.field(&field) {
                Some(target) => coerce(value.clone(), target.field_type).map_err(|e| {
                    IntegrationError::InvalidInput(format!("value for '{field}': {e}"))
                })?,
                None => value.clone(),
            };

            let now = Utc::now();
            let write = self
                .store()
                .get_record(&entity, &queued.conflict.logical_key)
                .await?
                .map(|mut record| {
                    let expected_hash = record.content_hash.clone();
                    record.fields.insert(
                        field.clone(),
                        FieldValue {
                            value: resolved.clone(),
                            source_id: queued.source_id,
                            confidence: 1.0,
                            timestamp: now,
                        },
                    );
                    let values = record
                        .fields
                        .iter()
                        .map(|(name, fv)| (name.clone(), fv.value.clone()))
                        .collect();
                    record.content_hash = content_hash(&values);
                    record.updated_at = now;
                    RecordWrite {
                        record,
                        expected_hash: Some(expected_hash),
                    }
                });

            queued.status = ConflictStatus::Resolved;
            queued.resolved_at = Some(now);
            queued.resolution = Some(resolved);

            match self.store().resolve_conflict(&queued, &entity, write).await {
                Ok(()) => {
                    info!(%conflict_id, field = %field, "conflict resolved");
                    return Ok(queued);
                }
                Err(StoreError::StaleWrite(_)) if attempt < MAX_RESOLVE_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    pub async fn get_source_health(&self, source_id: Uuid) -> Result<SourceHealthReport> {
        self.load_source(source_id).await?;
        Ok(SourceHealthReport {
            health: self.ctx().health.health(source_id).await,
            auth: self.ctx().credentials.health(source_id).await,
        })
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Verify a signed delivery and queue its records as a run
    ///
    /// Nothing in the body is looked at before the signature checks out.
    #[instrument(skip(self, timestamp, signature, body), fields(bytes = body.len()))]
    pub async fn receive_webhook(
        &self,
        source_id: Uuid,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<Uuid> {
        let source = self.load_source(source_id).await?;
        let SourceConfiguration::Webhook(config) = &source.configuration else {
            return Err(WebhookError::NotWebhookSource(source_id).into());
        };
        let window = if config.replay_window_secs == 0 {
            self.config().webhook_replay_window_secs
        } else {
            config.replay_window_secs
        };

        self.inner.webhooks.verify(
            source_id,
            &config.secret_key,
            window,
            timestamp,
            signature,
            body,
            Utc::now(),
        )?;

        let records = parse_payload(body)?;
        self.inner
            .synchronizer
            .ingest(&source, StreamEvent::webhook(source_id, records))
            .await
    }
}
