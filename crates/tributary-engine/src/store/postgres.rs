//! PostgreSQL store
//!
//! Entities are stored as JSONB documents next to the columns the engine filters or
//! orders by. Batch commits run in one transaction and lock the affected canonical
//! rows before comparing content hashes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use super::{BatchCommit, IntegrationStore, RecordWrite, StoreError, StoreResult};
use crate::models::{
    CanonicalRecord, ConflictFilter, DataSource, Pipeline, PipelineResult, QueuedConflict,
    SourceFilter, SyncResult, TargetSchema,
};

pub struct PgStore {
    pool: PgPool,
}

fn document<T: DeserializeOwned>(row: &PgRow) -> StoreResult<T> {
    let Json(value): Json<serde_json::Value> = row.try_get("document")?;
    Ok(serde_json::from_value(value)?)
}

fn documents<T: DeserializeOwned>(rows: &[PgRow]) -> StoreResult<Vec<T>> {
    rows.iter().map(document).collect()
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("integration store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn check_progress(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> StoreResult<()> {
        let row = sqlx::query("SELECT completed_at FROM sync_results WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::not_found("sync result", id))?;
        let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at")?;
        if completed_at.is_some() {
            return Err(StoreError::Finalized(id));
        }
        Ok(())
    }

    async fn current_hash(
        tx: &mut Transaction<'_, Postgres>,
        entity: &str,
        key: &str,
    ) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "SELECT content_hash FROM canonical_records WHERE entity = $1 AND logical_key = $2 FOR UPDATE",
        )
        .bind(entity)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("content_hash")?),
            None => None,
        })
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        entity: &str,
        write: &RecordWrite,
    ) -> StoreResult<()> {
        let current = Self::current_hash(tx, entity, &write.record.logical_key).await?;
        if current != write.expected_hash {
            return Err(StoreError::StaleWrite(write.record.logical_key.clone()));
        }
        sqlx::query(
            r#"
            INSERT INTO canonical_records (entity, logical_key, content_hash, document, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity, logical_key) DO UPDATE SET
                content_hash = excluded.content_hash,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity)
        .bind(&write.record.logical_key)
        .bind(&write.record.content_hash)
        .bind(Json(&write.record))
        .bind(write.record.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_conflict(
        tx: &mut Transaction<'_, Postgres>,
        conflict: &QueuedConflict,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflicts (id, source_id, status, created_at, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                document = excluded.document
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.source_id)
        .bind(conflict.status.as_str())
        .bind(conflict.created_at)
        .bind(Json(conflict))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Add a conflict to the review queue; a pending entry with the same id is refreshed
    /// and a resolved one is left untouched
    async fn queue_conflict(
        tx: &mut Transaction<'_, Postgres>,
        conflict: &QueuedConflict,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflicts (id, source_id, status, created_at, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                document = excluded.document
                    || jsonb_build_object('created_at', conflicts.document -> 'created_at')
            WHERE conflicts.status = 'pending'
            "#,
        )
        .bind(conflict.id)
        .bind(conflict.source_id)
        .bind(conflict.status.as_str())
        .bind(conflict.created_at)
        .bind(Json(conflict))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_source(&self, source: &DataSource) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = $2, source_type = $3, provider = $4, document = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(source.id)
        .bind(source.status.as_str())
        .bind(source.source_type.as_str())
        .bind(&source.provider)
        .bind(Json(source))
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn modify_source<F>(&self, id: Uuid, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut DataSource) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT document FROM data_sources WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("data source", id))?;
        let mut source: DataSource = document(&row)?;
        change(&mut source);
        sqlx::query("UPDATE data_sources SET document = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(&source))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for PgStore {
    async fn put_schema(&self, schema: &TargetSchema) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO target_schemas (entity, document) VALUES ($1, $2)
            ON CONFLICT (entity) DO UPDATE SET document = excluded.document
            "#,
        )
        .bind(&schema.entity)
        .bind(Json(schema))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schema(&self, entity: &str) -> StoreResult<Option<TargetSchema>> {
        sqlx::query("SELECT document FROM target_schemas WHERE entity = $1")
            .bind(entity)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_schemas(&self) -> StoreResult<Vec<TargetSchema>> {
        let rows = sqlx::query("SELECT document FROM target_schemas ORDER BY entity")
            .fetch_all(&self.pool)
            .await?;
        documents(&rows)
    }

    async fn insert_source(&self, source: &DataSource) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO data_sources (id, status, source_type, provider, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(source.id)
        .bind(source.status.as_str())
        .bind(source.source_type.as_str())
        .bind(&source.provider)
        .bind(Json(source))
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::duplicate("data source", source.id));
        }
        Ok(())
    }

    async fn update_source(&self, source: &DataSource) -> StoreResult<()> {
        if self.write_source(source).await? == 0 {
            return Err(StoreError::not_found("data source", source.id));
        }
        Ok(())
    }

    async fn get_source(&self, id: Uuid) -> StoreResult<Option<DataSource>> {
        sqlx::query("SELECT document FROM data_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_sources(&self, filter: &SourceFilter) -> StoreResult<Vec<DataSource>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM data_sources
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source_type = $2)
            ORDER BY created_at
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.source_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        let sources: Vec<DataSource> = documents(&rows)?;
        Ok(sources.into_iter().filter(|s| filter.matches(s)).collect())
    }

    async fn record_source_sync(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        cursor: Option<String>,
    ) -> StoreResult<()> {
        self.modify_source(id, move |source| {
            source.record_sync(at);
            if cursor.is_some() {
                source.sync_cursor = cursor;
            }
        })
        .await
    }

    async fn set_next_sync(&self, id: Uuid, next: Option<DateTime<Utc>>) -> StoreResult<()> {
        self.modify_source(id, move |source| source.set_next_sync(next)).await
    }

    async fn insert_sync_result(&self, result: &SyncResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_results (id, source_id, status, queued_at, completed_at, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(result.id)
        .bind(result.source_id)
        .bind(result.status.as_str())
        .bind(result.queued_at)
        .bind(result.completed_at)
        .bind(Json(result))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_sync_result(&self, result: &SyncResult) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::check_progress(&mut tx, result.id).await?;
        sqlx::query(
            "UPDATE sync_results SET status = $2, completed_at = $3, document = $4 WHERE id = $1",
        )
        .bind(result.id)
        .bind(result.status.as_str())
        .bind(result.completed_at)
        .bind(Json(result))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_sync_result(&self, id: Uuid) -> StoreResult<Option<SyncResult>> {
        sqlx::query("SELECT document FROM sync_results WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_sync_results(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SyncResult>> {
        let rows = sqlx::query(
            "SELECT document FROM sync_results WHERE source_id = $1 ORDER BY queued_at DESC LIMIT $2",
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        documents(&rows)
    }

    async fn list_unfinished_sync_results(&self) -> StoreResult<Vec<SyncResult>> {
        let rows = sqlx::query(
            "SELECT document FROM sync_results WHERE completed_at IS NULL ORDER BY queued_at",
        )
        .fetch_all(&self.pool)
        .await?;
        documents(&rows)
    }

    async fn get_records(
        &self,
        entity: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CanonicalRecord>> {
        let rows = sqlx::query(
            "SELECT document FROM canonical_records WHERE entity = $1 AND logical_key = ANY($2)",
        )
        .bind(entity)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        let records: Vec<CanonicalRecord> = documents(&rows)?;
        Ok(records
            .into_iter()
            .map(|r| (r.logical_key.clone(), r))
            .collect())
    }

    async fn get_record(&self, entity: &str, key: &str) -> StoreResult<Option<CanonicalRecord>> {
        sqlx::query("SELECT document FROM canonical_records WHERE entity = $1 AND logical_key = $2")
            .bind(entity)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn count_records(&self, entity: &str) -> StoreResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM canonical_records WHERE entity = $1")
            .bind(entity)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as usize)
    }

    async fn commit_batch(&self, batch: BatchCommit) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::check_progress(&mut tx, batch.progress.id).await?;

        for write in &batch.upserts {
            Self::write_record(&mut tx, &batch.entity, write).await?;
        }
        for delete in &batch.deletes {
            let current = Self::current_hash(&mut tx, &batch.entity, &delete.logical_key).await?;
            if current.as_deref() != Some(delete.expected_hash.as_str()) {
                return Err(StoreError::StaleWrite(delete.logical_key.clone()));
            }
            sqlx::query("DELETE FROM canonical_records WHERE entity = $1 AND logical_key = $2")
                .bind(&batch.entity)
                .bind(&delete.logical_key)
                .execute(&mut *tx)
                .await?;
        }
        for conflict in &batch.conflicts {
            Self::queue_conflict(&mut tx, conflict).await?;
        }

        sqlx::query("UPDATE sync_results SET status = $2, document = $3 WHERE id = $1")
            .bind(batch.progress.id)
            .bind(batch.progress.status.as_str())
            .bind(Json(&batch.progress))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_conflicts(&self, filter: &ConflictFilter) -> StoreResult<Vec<QueuedConflict>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM conflicts
            WHERE ($1::uuid IS NULL OR source_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            "#,
        )
        .bind(filter.source_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        documents(&rows)
    }

    async fn get_conflict(&self, id: Uuid) -> StoreResult<Option<QueuedConflict>> {
        sqlx::query("SELECT document FROM conflicts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn resolve_conflict(
        &self,
        conflict: &QueuedConflict,
        entity: &str,
        write: Option<RecordWrite>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(write) = &write {
            Self::write_record(&mut tx, entity, write).await?;
        }
        Self::upsert_conflict(&mut tx, conflict).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO pipelines (id, created_at, document) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(pipeline.id)
        .bind(pipeline.created_at)
        .bind(Json(pipeline))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::duplicate("pipeline", pipeline.id));
        }
        Ok(())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()> {
        let result = sqlx::query("UPDATE pipelines SET document = $2 WHERE id = $1")
            .bind(pipeline.id)
            .bind(Json(pipeline))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("pipeline", pipeline.id));
        }
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>> {
        sqlx::query("SELECT document FROM pipelines WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(document)
            .transpose()
    }

    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        let rows = sqlx::query("SELECT document FROM pipelines ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        documents(&rows)
    }

    async fn insert_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pipeline_results (id, pipeline_id, started_at, document) VALUES ($1, $2, $3, $4)",
        )
        .bind(result.id)
        .bind(result.pipeline_id)
        .bind(result.started_at)
        .bind(Json(result))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE pipeline_results SET document = $2 WHERE id = $1")
            .bind(result.id)
            .bind(Json(result))
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("pipeline result", result.id));
        }
        Ok(())
    }

    async fn latest_pipeline_result(&self, pipeline_id: Uuid) -> StoreResult<Option<PipelineResult>> {
        sqlx::query(
            "SELECT document FROM pipeline_results WHERE pipeline_id = $1 ORDER BY started_at DESC LIMIT 1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(document)
        .transpose()
    }
}
