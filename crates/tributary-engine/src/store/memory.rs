//! In-process store
//!
//! All state sits behind one lock, which makes every trait method atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BatchCommit, IntegrationStore, RecordWrite, StoreError, StoreResult};
use crate::models::{
    CanonicalRecord, ConflictFilter, ConflictStatus, DataSource, Pipeline, PipelineResult, QueuedConflict,
    SourceFilter, SyncResult, TargetSchema,
};

#[derive(Default)]
struct Inner {
    schemas: HashMap<String, TargetSchema>,
    sources: HashMap<Uuid, DataSource>,
    sync_results: HashMap<Uuid, SyncResult>,
    /// Keyed by entity, then logical key
    records: HashMap<String, HashMap<String, CanonicalRecord>>,
    conflicts: HashMap<Uuid, QueuedConflict>,
    pipelines: HashMap<Uuid, Pipeline>,
    pipeline_results: HashMap<Uuid, PipelineResult>,
}

impl Inner {
    fn check_write(&self, entity: &str, write: &RecordWrite) -> StoreResult<()> {
        let current = self
            .records
            .get(entity)
            .and_then(|records| records.get(&write.record.logical_key))
            .map(|r| r.content_hash.as_str());
        if current != write.expected_hash.as_deref() {
            return Err(StoreError::StaleWrite(write.record.logical_key.clone()));
        }
        Ok(())
    }

    fn check_progress(&self, result: &SyncResult) -> StoreResult<()> {
        match self.sync_results.get(&result.id) {
            None => Err(StoreError::not_found("sync result", result.id)),
            Some(stored) if stored.is_finalized() => Err(StoreError::Finalized(result.id)),
            Some(_) => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn put_schema(&self, schema: &TargetSchema) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .schemas
            .insert(schema.entity.clone(), schema.clone());
        Ok(())
    }

    async fn get_schema(&self, entity: &str) -> StoreResult<Option<TargetSchema>> {
        Ok(self.inner.read().await.schemas.get(entity).cloned())
    }

    async fn list_schemas(&self) -> StoreResult<Vec<TargetSchema>> {
        let mut schemas: Vec<_> = self.inner.read().await.schemas.values().cloned().collect();
        schemas.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(schemas)
    }

    async fn insert_source(&self, source: &DataSource) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.sources.contains_key(&source.id) {
            return Err(StoreError::duplicate("data source", source.id));
        }
        inner.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn update_source(&self, source: &DataSource) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .sources
            .get_mut(&source.id)
            .ok_or_else(|| StoreError::not_found("data source", source.id))?;
        *stored = source.clone();
        Ok(())
    }

    async fn get_source(&self, id: Uuid) -> StoreResult<Option<DataSource>> {
        Ok(self.inner.read().await.sources.get(&id).cloned())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> StoreResult<Vec<DataSource>> {
        let mut sources: Vec<_> = self
            .inner
            .read()
            .await
            .sources
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.created_at);
        Ok(sources)
    }

    async fn record_source_sync(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        cursor: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let source = inner
            .sources
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("data source", id))?;
        source.record_sync(at);
        if cursor.is_some() {
            source.sync_cursor = cursor;
        }
        Ok(())
    }

    async fn set_next_sync(&self, id: Uuid, next: Option<DateTime<Utc>>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let source = inner
            .sources
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("data source", id))?;
        source.set_next_sync(next);
        Ok(())
    }

    async fn insert_sync_result(&self, result: &SyncResult) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.sync_results.contains_key(&result.id) {
            return Err(StoreError::duplicate("sync result", result.id));
        }
        inner.sync_results.insert(result.id, result.clone());
        Ok(())
    }

    async fn update_sync_result(&self, result: &SyncResult) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.check_progress(result)?;
        inner.sync_results.insert(result.id, result.clone());
        Ok(())
    }

    async fn get_sync_result(&self, id: Uuid) -> StoreResult<Option<SyncResult>> {
        Ok(self.inner.read().await.sync_results.get(&id).cloned())
    }

    async fn list_sync_results(&self, source_id: Uuid, limit: usize) -> StoreResult<Vec<SyncResult>> {
        let mut results: Vec<_> = self
            .inner
            .read()
            .await
            .sync_results
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        results.truncate(limit);
        Ok(results)
    }

    async fn list_unfinished_sync_results(&self) -> StoreResult<Vec<SyncResult>> {
        let mut results: Vec<_> = self
            .inner
            .read()
            .await
            .sync_results
            .values()
            .filter(|r| !r.is_finalized())
            .cloned()
            .collect();
        results.sort_by_key(|r| r.queued_at);
        Ok(results)
    }

    async fn get_records(
        &self,
        entity: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, CanonicalRecord>> {
        let inner = self.inner.read().await;
        let Some(records) = inner.records.get(entity) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| records.get(k).map(|r| (k.clone(), r.clone())))
            .collect())
    }

    async fn get_record(&self, entity: &str, key: &str) -> StoreResult<Option<CanonicalRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(entity)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn count_records(&self, entity: &str) -> StoreResult<usize> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(entity)
            .map_or(0, HashMap::len))
    }

    async fn commit_batch(&self, batch: BatchCommit) -> StoreResult<()> {
        let mut inner = self.inner.write().await;

        inner.check_progress(&batch.progress)?;
        for write in &batch.upserts {
            inner.check_write(&batch.entity, write)?;
        }
        for delete in &batch.deletes {
            let current = inner
                .records
                .get(&batch.entity)
                .and_then(|records| records.get(&delete.logical_key))
                .map(|r| r.content_hash.as_str());
            if current != Some(delete.expected_hash.as_str()) {
                return Err(StoreError::StaleWrite(delete.logical_key.clone()));
            }
        }

        let records = inner.records.entry(batch.entity.clone()).or_default();
        for write in batch.upserts {
            records.insert(write.record.logical_key.clone(), write.record);
        }
        for delete in &batch.deletes {
            records.remove(&delete.logical_key);
        }
        for conflict in batch.conflicts {
            match inner.conflicts.entry(conflict.id) {
                Entry::Occupied(mut slot) => {
                    // an entry already decided by a reviewer stays as is
                    let queued = slot.get_mut();
                    if queued.status == ConflictStatus::Pending {
                        queued.sync_id = conflict.sync_id;
                        queued.conflict = conflict.conflict;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(conflict);
                }
            }
        }
        inner.sync_results.insert(batch.progress.id, batch.progress);
        Ok(())
    }

    async fn list_conflicts(&self, filter: &ConflictFilter) -> StoreResult<Vec<QueuedConflict>> {
        let mut conflicts: Vec<_> = self
            .inner
            .read()
            .await
            .conflicts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.created_at);
        Ok(conflicts)
    }

    async fn get_conflict(&self, id: Uuid) -> StoreResult<Option<QueuedConflict>> {
        Ok(self.inner.read().await.conflicts.get(&id).cloned())
    }

    async fn resolve_conflict(
        &self,
        conflict: &QueuedConflict,
        entity: &str,
        write: Option<RecordWrite>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.conflicts.contains_key(&conflict.id) {
            return Err(StoreError::not_found("conflict", conflict.id));
        }
        if let Some(write) = write {
            inner.check_write(entity, &write)?;
            inner
                .records
                .entry(entity.to_string())
                .or_default()
                .insert(write.record.logical_key.clone(), write.record);
        }
        inner.conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.pipelines.contains_key(&pipeline.id) {
            return Err(StoreError::duplicate("pipeline", pipeline.id));
        }
        inner.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .pipelines
            .get_mut(&pipeline.id)
            .ok_or_else(|| StoreError::not_found("pipeline", pipeline.id))?;
        *stored = pipeline.clone();
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> StoreResult<Option<Pipeline>> {
        Ok(self.inner.read().await.pipelines.get(&id).cloned())
    }

    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        let mut pipelines: Vec<_> = self.inner.read().await.pipelines.values().cloned().collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn insert_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .pipeline_results
            .insert(result.id, result.clone());
        Ok(())
    }

    async fn update_pipeline_result(&self, result: &PipelineResult) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .pipeline_results
            .get_mut(&result.id)
            .ok_or_else(|| StoreError::not_found("pipeline result", result.id))?;
        *stored = result.clone();
        Ok(())
    }

    async fn latest_pipeline_result(&self, pipeline_id: Uuid) -> StoreResult<Option<PipelineResult>> {
        Ok(self
            .inner
            .read()
            .await
            .pipeline_results
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .max_by_key(|r| r.started_at)
            .cloned())
    }
}
