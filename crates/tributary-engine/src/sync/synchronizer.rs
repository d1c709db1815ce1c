//! One run for one source
//!
//! [`Synchronizer::start`] admits a run and returns its id at once; the run executes
//! on its own task. It waits for the source's previous run and a global permit,
//! snapshots the source, compiles its mapping, obtains credentials, then fetches and
//! commits page by page until the adapter runs out of pages. Every page is its own
//! commit unit, so a failure leaves earlier pages in place and the result keeps the
//! partial counts.
//!
//! Webhook deliveries enter through [`Synchronizer::ingest`] and go through the same
//! per-page path as polled pages.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::batch::prepare_page;
use super::registry::{Admission, SyncRegistry};
use crate::adapter::{AdapterError, AdapterRegistry, FetchRequest, Page};
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, MergeAction};
use crate::credentials::CredentialStore;
use crate::error::{ErrorKind, IntegrationError, Result, Severity, SyncError};
use crate::health::HealthMonitor;
use crate::mapper::functions::FunctionRegistry;
use crate::mapper::CompiledMapping;
use crate::models::{
    DataSource, DataSourceType, QueuedConflict, RawRecord, StreamEvent, SyncCounts, SyncMode,
    SyncOptions, SyncResult, SyncStatus, SyncTrigger,
};
use crate::retry::{CallStats, Idempotency, RetryExecutor};
use crate::store::{BatchCommit, IntegrationStore, RecordDelete, RecordWrite, StoreError};
use crate::validator::{QualityTracker, Validator};

/// A page is re-merged this many times when canonical records change underneath it
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Collaborators shared by every run
pub struct SyncContext {
    pub store: Arc<dyn IntegrationStore>,
    pub adapters: AdapterRegistry,
    pub credentials: Arc<CredentialStore>,
    pub registry: Arc<SyncRegistry>,
    pub health: Arc<HealthMonitor>,
    pub functions: FunctionRegistry,
    pub config: EngineConfig,
}

#[derive(Clone)]
pub struct Synchronizer {
    ctx: Arc<SyncContext>,
}

enum Work {
    Poll { max_pages: Option<u32> },
    Push(Vec<RawRecord>),
}

/// Why a run stopped without a run-level error
enum Stop {
    Exhausted,
    PageLimit,
    Cancelled,
    DeadlineExceeded(Duration),
}

/// Mapping, validation and merge rules compiled from the snapshot
struct Plan {
    mapping: CompiledMapping,
    validator: Validator,
    resolver: ConflictResolver,
}

/// State owned by the task executing a run
struct Run {
    result: SyncResult,
    quality: QualityTracker,
    stats: CallStats,
    started: Instant,
}

impl Run {
    fn new(result: SyncResult) -> Self {
        Self {
            result,
            quality: QualityTracker::default(),
            stats: CallStats::default(),
            started: Instant::now(),
        }
    }

    fn stamp_metrics(&self, result: &mut SyncResult) {
        let metrics = &mut result.performance_metrics;
        metrics.api_calls = self.stats.api_calls;
        metrics.retries = self.stats.retries;
        metrics.rate_limit_wait_ms = self.stats.rate_limit_wait.as_millis() as u64;
    }

    fn conclude(&mut self, outcome: Result<Stop>) {
        let result = &mut self.result;
        match outcome {
            Ok(Stop::Exhausted) | Ok(Stop::PageLimit) => result.status = SyncStatus::Completed,
            Ok(Stop::Cancelled) => {
                result.status = SyncStatus::Cancelled;
                result.warnings.push(SyncError::new(
                    ErrorKind::Cancelled,
                    Severity::Info,
                    "cancelled on request",
                ));
            }
            Ok(Stop::DeadlineExceeded(limit)) => {
                result.status = SyncStatus::Failed;
                result.errors.push(SyncError::new(
                    ErrorKind::Timeout,
                    Severity::Critical,
                    format!("run exceeded its {}s deadline", limit.as_secs()),
                ));
            }
            Err(e) => {
                result.status = SyncStatus::Failed;
                result.errors.push(e.to_sync_error());
            }
        }
    }
}

impl Synchronizer {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Admit a polling run for `source_id` and return its sync id
    #[instrument(skip(self, options))]
    pub async fn start(&self, source_id: Uuid, options: SyncOptions) -> Result<Uuid> {
        let source = self
            .ctx
            .store
            .get_source(source_id)
            .await?
            .ok_or(IntegrationError::SourceNotFound(source_id))?;

        if !source.status.can_sync() {
            return Err(IntegrationError::SourceUnavailable {
                id: source_id,
                status: source.status,
            });
        }
        if source.source_type == DataSourceType::Webhook {
            return Err(IntegrationError::InvalidInput(format!(
                "data source {source_id} receives records through its webhook endpoint"
            )));
        }

        let mode = options.mode.unwrap_or(source.sync_settings.mode);
        let max_pages = options.max_pages.or(source.sync_settings.max_pages);
        self.admit(
            source_id,
            mode,
            options.trigger,
            options.force,
            Work::Poll { max_pages },
        )
        .await
    }

    /// Queue pushed records of a webhook source as a run of their own
    ///
    /// Deliveries never fail admission; they wait behind the source's active run.
    #[instrument(skip(self, source, event), fields(source_id = %source.id, records = event.records.len()))]
    pub async fn ingest(&self, source: &DataSource, event: StreamEvent) -> Result<Uuid> {
        if !source.status.can_sync() {
            return Err(IntegrationError::SourceUnavailable {
                id: source.id,
                status: source.status,
            });
        }
        self.admit(
            source.id,
            source.sync_settings.mode,
            SyncTrigger::Webhook,
            true,
            Work::Push(event.records),
        )
        .await
    }

    /// Request cooperative cancellation; `false` when the run is not in flight
    pub fn cancel(&self, sync_id: Uuid) -> bool {
        self.ctx.registry.cancel(sync_id)
    }

    /// Wait until the run has been finalized
    pub async fn wait(&self, sync_id: Uuid) {
        self.ctx.registry.wait_for(sync_id).await;
    }

    async fn admit(
        &self,
        source_id: Uuid,
        mode: SyncMode,
        trigger: SyncTrigger,
        force: bool,
        work: Work,
    ) -> Result<Uuid> {
        let result = SyncResult::pending(source_id, mode, trigger);
        let sync_id = result.id;
        let admission = self.ctx.registry.admit(source_id, sync_id, force)?;

        if let Err(e) = self.ctx.store.insert_sync_result(&result).await {
            self.ctx.registry.release(sync_id);
            return Err(e.into());
        }

        info!(%source_id, %sync_id, mode = mode.as_str(), ?trigger, "sync queued");
        let this = self.clone();
        tokio::spawn(async move { this.execute(admission, result, work).await });
        Ok(sync_id)
    }

    #[instrument(name = "sync_run", skip_all, fields(sync_id = %result.id, source_id = %result.source_id))]
    async fn execute(self, mut admission: Admission, result: SyncResult, work: Work) {
        let sync_id = result.id;
        let mut run = Run::new(result);

        let slot = admission.wait_turn(self.ctx.registry.permits()).await;
        let source = if slot.is_some() {
            self.drive(&mut run, &admission.cancel, work).await
        } else {
            run.conclude(Ok(Stop::Cancelled));
            None
        };

        self.finalize(run, source.as_ref()).await;
        drop(slot);
        self.ctx.registry.release(sync_id);
        admission.finish();
    }

    /// Snapshot the source and run it; returns the snapshot for health reporting
    async fn drive(
        &self,
        run: &mut Run,
        cancel: &CancellationToken,
        work: Work,
    ) -> Option<DataSource> {
        let source_id = run.result.source_id;
        let source = match self.ctx.store.get_source(source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                run.conclude(Err(IntegrationError::SourceNotFound(source_id)));
                return None;
            }
            Err(e) => {
                run.conclude(Err(e.into()));
                return None;
            }
        };

        run.started = Instant::now();
        run.result.started_at = Some(Utc::now());
        run.result.status = SyncStatus::Running;

        let outcome = if !source.status.can_sync() {
            Err(IntegrationError::SourceUnavailable {
                id: source_id,
                status: source.status,
            })
        } else {
            match self.ctx.store.update_sync_result(&run.result).await {
                Ok(()) => self.process(&source, run, cancel, work).await,
                Err(e) => Err(e.into()),
            }
        };
        run.conclude(outcome);
        Some(source)
    }

    async fn process(
        &self,
        source: &DataSource,
        run: &mut Run,
        cancel: &CancellationToken,
        work: Work,
    ) -> Result<Stop> {
        let plan = self.compile(source, run.result.mode).await?;

        match work {
            Work::Push(records) => {
                for chunk in records.chunks(source.batch_size().max(1)) {
                    if cancel.is_cancelled() {
                        return Ok(Stop::Cancelled);
                    }
                    self.commit_page(source, &plan, run, chunk, None).await?;
                }
                Ok(Stop::Exhausted)
            }
            Work::Poll { max_pages } => self.poll(source, &plan, run, cancel, max_pages).await,
        }
    }

    /// Compile the snapshot's mapping before any network call
    async fn compile(&self, source: &DataSource, mode: SyncMode) -> Result<Plan> {
        let entity = &source.data_mapping.target_entity;
        let schema = self
            .ctx
            .store
            .get_schema(entity)
            .await?
            .ok_or_else(|| IntegrationError::SchemaNotFound(entity.clone()))?;

        Ok(Plan {
            mapping: CompiledMapping::compile(&source.data_mapping, &schema, &self.ctx.functions)?,
            validator: Validator::compile(&source.data_mapping, &schema)?,
            resolver: ConflictResolver::new(source.sync_settings.clone(), mode, source.id),
        })
    }

    async fn poll(
        &self,
        source: &DataSource,
        plan: &Plan,
        run: &mut Run,
        cancel: &CancellationToken,
        max_pages: Option<u32>,
    ) -> Result<Stop> {
        let adapter = self
            .ctx
            .adapters
            .resolve(source)
            .ok_or_else(|| IntegrationError::AdapterNotFound(source.provider.clone()))?;
        let limiter = self.ctx.registry.limiter(source.id, source.rate_limits);
        let executor = RetryExecutor::new(
            source.sync_settings.retry_policy.clone(),
            limiter,
            source.call_timeout(),
        );
        let mut credential = self
            .ctx
            .credentials
            .ensure(source.id, &source.authentication, &executor, &mut run.stats)
            .await?;

        let resume = run.result.mode.resumes_from_cursor();
        let since = if resume { source.last_sync } else { None };
        let mut token = if resume { source.sync_cursor.clone() } else { None };
        let run_timeout = source.run_timeout();
        let deadline = run.started + run_timeout;
        let page_size = source.batch_size();
        let mut refreshed = false;
        let mut pages = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(Stop::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(Stop::DeadlineExceeded(run_timeout));
            }

            let fetch_started = Instant::now();
            let fetched = executor
                .execute(Idempotency::Idempotent, &mut run.stats, || {
                    adapter.fetch(FetchRequest {
                        source,
                        credential: &credential,
                        page_token: token.as_deref(),
                        since,
                        page_size,
                    })
                })
                .await;

            let Page {
                records,
                next_page_token,
            } = match fetched {
                Ok(page) => page,
                Err(IntegrationError::Adapter(AdapterError::Auth(message))) => {
                    if refreshed {
                        return Err(IntegrationError::Auth {
                            source_id: source.id,
                            message,
                        });
                    }
                    warn!(source_id = %source.id, %message, "provider rejected credentials, refreshing");
                    refreshed = true;
                    self.ctx.credentials.invalidate(source.id).await;
                    credential = self
                        .ctx
                        .credentials
                        .ensure(source.id, &source.authentication, &executor, &mut run.stats)
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            run.result
                .performance_metrics
                .record_page(fetch_started.elapsed().as_millis() as u64);
            pages += 1;
            debug!(
                source_id = %source.id,
                page = pages,
                records = records.len(),
                has_next = next_page_token.is_some(),
                "page fetched"
            );

            let cursor = next_page_token.clone().or_else(|| token.clone());
            self.commit_page(source, plan, run, &records, cursor).await?;

            let acknowledged = executor
                .execute(Idempotency::NonIdempotent, &mut run.stats, || {
                    adapter.acknowledge(source, next_page_token.as_deref())
                })
                .await;
            if let Err(e) = acknowledged {
                warn!(source_id = %source.id, error = %e, "page acknowledgement failed");
                run.result.warnings.push(SyncError::new(
                    e.kind(),
                    Severity::Warning,
                    format!("page {pages} was committed but not acknowledged: {e}"),
                ));
            }

            match next_page_token {
                None => return Ok(Stop::Exhausted),
                Some(_) if max_pages.is_some_and(|max| pages >= max) => {
                    return Ok(Stop::PageLimit)
                }
                next => token = next,
            }
        }
    }

    /// Transform one page and commit it together with the updated progress
    async fn commit_page(
        &self,
        source: &DataSource,
        plan: &Plan,
        run: &mut Run,
        records: &[RawRecord],
        cursor: Option<String>,
    ) -> Result<()> {
        let prepared = prepare_page(
            &plan.mapping,
            &plan.validator,
            &plan.resolver,
            records,
            source.sync_settings.source_confidence,
            Utc::now(),
        );
        let entity = plan.mapping.entity();
        let keys: Vec<String> = prepared
            .records
            .iter()
            .map(|r| r.logical_key.clone())
            .collect();
        let sync_id = run.result.id;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let existing = self.ctx.store.get_records(entity, &keys).await?;
            let now = Utc::now();

            let mut counts = SyncCounts::default();
            counts.add_failed(prepared.failed);
            counts.add_updated(prepared.merged);
            let mut upserts = Vec::new();
            let mut deletes = Vec::new();
            let mut conflicts = prepared.conflicts.clone();

            for record in &prepared.records {
                let current = existing.get(&record.logical_key);
                let outcome = plan.resolver.merge(current, record, sync_id, now);
                conflicts.extend(outcome.conflicts);
                match outcome.action {
                    MergeAction::Create(created) => {
                        counts.add_created(1);
                        upserts.push(RecordWrite {
                            record: created,
                            expected_hash: None,
                        });
                    }
                    MergeAction::Update { record, changed } => {
                        counts.add_updated(1);
                        if changed {
                            upserts.push(RecordWrite {
                                record,
                                expected_hash: current.map(|c| c.content_hash.clone()),
                            });
                        }
                    }
                    MergeAction::Delete => {
                        counts.add_deleted(1);
                        if let Some(current) = current {
                            deletes.push(RecordDelete {
                                logical_key: current.logical_key.clone(),
                                expected_hash: current.content_hash.clone(),
                            });
                        }
                    }
                    MergeAction::Skip => counts.add_skipped(1),
                }
            }

            let queued: Vec<QueuedConflict> = conflicts
                .into_iter()
                .map(|c| QueuedConflict::new(source.id, sync_id, c))
                .collect();

            let mut quality = run.quality;
            quality.merge(&prepared.quality);

            let mut progress = run.result.clone();
            progress.counts.merge(&counts);
            progress.errors.extend(prepared.errors.iter().cloned());
            progress.warnings.extend(prepared.warnings.iter().cloned());
            progress.warnings.extend(queued.iter().map(|q| {
                SyncError::new(
                    ErrorKind::ConflictUnresolved,
                    Severity::Warning,
                    format!("field '{}' queued for manual review", q.conflict.field),
                )
                .with_field(q.conflict.field.clone())
                .with_record(q.conflict.logical_key.clone())
            }));
            if cursor.is_some() {
                progress.cursor = cursor.clone();
            }
            progress.data_quality_report = quality.report();
            run.stamp_metrics(&mut progress);

            let batch = BatchCommit {
                entity: entity.to_string(),
                upserts,
                deletes,
                conflicts: queued,
                progress: progress.clone(),
            };
            match self.ctx.store.commit_batch(batch).await {
                Ok(()) => {
                    run.result = progress;
                    run.quality = quality;
                    return Ok(());
                }
                Err(StoreError::StaleWrite(key)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(sync_id = %sync_id, %key, attempt, "canonical record moved, re-merging page");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record the terminal state exactly once and report it
    async fn finalize(&self, run: Run, source: Option<&DataSource>) {
        let now = Utc::now();
        let mut result = run.result.clone();
        result.completed_at = Some(now);
        run.stamp_metrics(&mut result);
        result.performance_metrics.finish(
            run.started.elapsed().as_millis() as u64,
            result.counts.records_processed,
        );
        result.data_quality_report = run.quality.report();

        if let Err(e) = self.ctx.store.update_sync_result(&result).await {
            error!(sync_id = %result.id, error = %e, "failed to persist final sync result");
        }

        if result.status == SyncStatus::Completed {
            if let Err(e) = self
                .ctx
                .store
                .record_source_sync(result.source_id, now, result.cursor.clone())
                .await
            {
                error!(source_id = %result.source_id, error = %e, "failed to record last sync");
            }
        }

        if let Some(source) = source {
            self.ctx.health.observe(source, &result).await;
        }

        let counts = &result.counts;
        if result.status == SyncStatus::Failed {
            warn!(
                sync_id = %result.id,
                source_id = %result.source_id,
                processed = counts.records_processed,
                error = result.errors.last().map(|e| e.message.as_str()).unwrap_or_default(),
                "sync failed"
            );
        } else {
            info!(
                sync_id = %result.id,
                source_id = %result.source_id,
                status = result.status.as_str(),
                created = counts.records_created,
                updated = counts.records_updated,
                deleted = counts.records_deleted,
                failed = counts.records_failed,
                skipped = counts.records_skipped,
                "sync finished"
            );
        }
    }
}
