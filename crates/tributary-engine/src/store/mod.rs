//! Persistence boundary
//!
//! Everything the engine keeps lives behind [`IntegrationStore`]: registered sources
//! and schemas, sync results, canonical records, the conflict queue and pipelines.
//! [`MemoryStore`] backs tests and single-process deployments; the `database` feature
//! adds [`postgres::PgStore`].
//!
//! Canonical record writes are optimistic: every write names the content hash it
//! expects to replace (`None` for a record that must not exist yet). A mismatch fails
//! the whole batch with [`StoreError::StaleWrite`] and nothing is applied.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CanonicalRecord, ConflictFilter, DataSource, Pipeline, PipelineResult, QueuedConflict,
    SourceFilter, SyncResult, TargetSchema,
};

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("sync result {0} is finalized and cannot be modified")]
    Finalized(Uuid),

    #[error("canonical record {0} changed concurrently")]
    StaleWrite(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn duplicate(entity: &'static str, id: impl ToString) -> Self {
        StoreError::Duplicate {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Upsert of one canonical record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub record: CanonicalRecord,
    /// Hash of the stored version this write replaces; `None` when creating
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDelete {
    pub logical_key: String,
    pub expected_hash: String,
}

/// Everything one page commits, applied atomically
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub entity: String,
    pub upserts: Vec<RecordWrite>,
    pub deletes: Vec<RecordDelete>,
    pub conflicts: Vec<QueuedConflict>,
    /// Sync result carrying the counters after this page
    pub progress: SyncResult,
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    // Schemas
    async fn put_schema(&self, schema: &TargetSchema) -> StoreResult<()>;
    async fn get_schema(&self, entity: &str) -> StoreResult<Option<TargetSchema>>;
    async fn list_schemas(&self) -> StoreResult<Vec<TargetSchema>>;

    // Data sources
    async fn insert_source(&self, source: &DataSource) -> StoreResult<()>;
    async fn update_source(&self, source: &DataSource) -> StoreResult<()>;
    async fn get_source(&self, id: Uuid) -> StoreResult<Option<DataSource>>;
    async fn list_sources(&self, filter: &SourceFilter) -> StoreResult<Vec<DataSource>>;
    /// Field-level update after a completed run; the stored cursor is replaced only when one is given
    async fn record_source_sync(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        cursor: Option<String>,
    ) -> StoreResult<()>;
    /// Field-level update of the next eligible run time, clamped to not precede `last_sync`
    async fn set_next_sync(&self, id: Uuid, next: Option<DateTime<Utc>>) -> StoreResult<()>;

    // Sync results
    async fn insert_sync_result(&self, result: &SyncResult) -> StoreResult<()>;
    /// Rejects writes to a finalized result with [`StoreError::Finalized`]
    async fn update_sync_result(&self, result: &SyncResult) -> StoreResult<()>;
    async fn get_sync_result(&self, id: Uuid) -> StoreResult<Option<SyncResult>>;
    /// Newest first
    async fn list_sync_results(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SyncResult>>;
    async fn list_unfinished_sync_results(&self) -> StoreResult<Vec<SyncResult>>;

    // Canonical records
    async fn get_records(
        &self,
        entity: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CanonicalRecord>>;
    async fn get_record(&self, entity: &str, key: &str) -> StoreResult<Option<CanonicalRecord>>;
    async fn count_records(&self, entity: &str) -> StoreResult<usize>;
    async fn commit_batch(&self, batch: BatchCommit) -> StoreResult<()>;

    // Conflict queue
    async fn list_conflicts(&self, filter: &ConflictFilter) -> StoreResult<Vec<QueuedConflict>>;
    async fn get_conflict(&self, id: Uuid) -> StoreResult<Option<QueuedConflict>>;
    /// Persist a resolved conflict together with the record carrying the chosen value
    async fn resolve_conflict(
        &self,
        conflict: &QueuedConflict,
        entity: &str,
        write: Option<RecordWrite>,
    ) -> StoreResult<()>;

    // Pipelines
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()>;
    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()>;
    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>>;
    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>>;
    async fn insert_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()>;
    async fn update_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()>;
    async fn latest_pipeline_result(&self, pipeline_id: Uuid) -> StoreResult<Option<PipelineResult>>;
}
