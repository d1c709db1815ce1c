//! Dependency-ordered execution of pipeline stages
//!
//! Stage dependencies must form a DAG; [`execution_waves`] checks that with Kahn's
//! algorithm and is run when a pipeline is created. At run time a stage starts as soon
//! as all of its dependencies completed, so independent branches run concurrently
//! under the same global permits as plain syncs. A failed stage fails the pipeline and
//! every stage downstream of it is skipped; unrelated branches still finish.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{IntegrationError, Result};
use crate::models::{
    Pipeline, PipelineResult, PipelineRunStatus, PipelineState, PipelineStatusReport, Stage,
    StageOutcome, StageStatus, SyncCounts, SyncOptions, SyncResult, SyncStatus, SyncTrigger,
};
use crate::sync::Synchronizer;

/// Group stages into waves; every stage depends only on stages of earlier waves
///
/// Rejects empty pipelines, duplicate stage ids, unknown or self dependencies and cycles.
pub fn execution_waves(stages: &[Stage]) -> Result<Vec<Vec<String>>> {
    if stages.is_empty() {
        return Err(IntegrationError::InvalidPipeline(
            "a pipeline needs at least one stage".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for stage in stages {
        if !ids.insert(stage.id.as_str()) {
            return Err(IntegrationError::InvalidPipeline(format!(
                "duplicate stage id '{}'",
                stage.id
            )));
        }
    }

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in stages {
        let unique: BTreeSet<&str> = stage.dependencies.iter().map(String::as_str).collect();
        for dep in &unique {
            if *dep == stage.id {
                return Err(IntegrationError::InvalidPipeline(format!(
                    "stage '{}' depends on itself",
                    stage.id
                )));
            }
            if !ids.contains(dep) {
                return Err(IntegrationError::InvalidPipeline(format!(
                    "stage '{}' depends on unknown stage '{dep}'",
                    stage.id
                )));
            }
            dependents.entry(dep).or_default().push(&stage.id);
        }
        indegree.insert(&stage.id, unique.len());
    }

    let mut waves = Vec::new();
    let mut ready: Vec<&str> = stages
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        placed += ready.len();
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        waves.push(ready.iter().map(|id| id.to_string()).collect());
        ready = next;
    }

    if placed < stages.len() {
        let cyclic: Vec<&str> = stages
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| indegree.get(id).is_some_and(|n| *n > 0))
            .collect();
        return Err(IntegrationError::InvalidPipeline(format!(
            "stage dependencies form a cycle through {}",
            cyclic.join(", ")
        )));
    }

    Ok(waves)
}

pub fn validate_stages(stages: &[Stage]) -> Result<()> {
    execution_waves(stages).map(|_| ())
}

/// Runs pipelines and keeps the live state of the ones in flight
pub struct PipelineOrchestrator {
    synchronizer: Synchronizer,
    live: Mutex<HashMap<Uuid, PipelineResult>>,
}

impl PipelineOrchestrator {
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self {
            synchronizer,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<Uuid, PipelineResult>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_stage(&self, pipeline_id: Uuid, stage_id: &str, update: impl FnOnce(&mut StageOutcome)) {
        if let Some(outcome) = self
            .live()
            .get_mut(&pipeline_id)
            .and_then(|run| run.stages.iter_mut().find(|s| s.stage_id == stage_id))
        {
            update(outcome);
        }
    }

    fn snapshot(&self, pipeline_id: Uuid) -> Option<PipelineResult> {
        self.live().get(&pipeline_id).cloned()
    }

    /// Execute every stage of an active pipeline and wait for the outcome
    #[instrument(skip(self, pipeline), fields(pipeline_id = %pipeline.id))]
    pub async fn run(&self, pipeline: &Pipeline) -> Result<PipelineResult> {
        if pipeline.state != PipelineState::Active {
            return Err(IntegrationError::PipelineInactive(pipeline.id));
        }
        validate_stages(&pipeline.stages)?;

        let result = PipelineResult {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            status: PipelineRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            stages: pipeline
                .stages
                .iter()
                .map(|s| StageOutcome::pending(s.id.clone()))
                .collect(),
            totals: SyncCounts::default(),
        };
        {
            let mut live = self.live();
            if live.contains_key(&pipeline.id) {
                return Err(IntegrationError::InvalidInput(format!(
                    "pipeline {} is already running",
                    pipeline.id
                )));
            }
            live.insert(pipeline.id, result.clone());
        }

        let store = &self.synchronizer.context().store;
        if let Err(e) = store.insert_pipeline_result(&result).await {
            self.live().remove(&pipeline.id);
            return Err(e.into());
        }
        info!(pipeline = %pipeline.name, stages = pipeline.stages.len(), "pipeline started");

        self.execute(pipeline).await;

        let mut finished = self.live().remove(&pipeline.id).unwrap_or(result);
        let failed = finished
            .stages
            .iter()
            .any(|s| s.status == StageStatus::Failed);
        finished.status = if failed {
            PipelineRunStatus::Failed
        } else {
            PipelineRunStatus::Completed
        };
        finished.completed_at = Some(Utc::now());
        store.update_pipeline_result(&finished).await?;

        info!(
            pipeline = %pipeline.name,
            status = ?finished.status,
            processed = finished.totals.records_processed,
            "pipeline finished"
        );
        Ok(finished)
    }

    async fn execute(&self, pipeline: &Pipeline) {
        let mut waiting: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&Stage>> = HashMap::new();
        for stage in &pipeline.stages {
            let unique: BTreeSet<&str> = stage.dependencies.iter().map(String::as_str).collect();
            for dep in &unique {
                dependents.entry(dep).or_default().push(stage);
            }
            waiting.insert(&stage.id, unique.len());
        }

        let mut running = FuturesUnordered::new();
        for stage in pipeline.stages.iter().filter(|s| waiting.get(s.id.as_str()) == Some(&0)) {
            running.push(self.run_stage(pipeline.id, stage));
        }

        while let Some((stage_id, outcome)) = running.next().await {
            let succeeded = self.record_stage(pipeline.id, &stage_id, outcome);
            let downstream = dependents.get(stage_id.as_str()).cloned().unwrap_or_default();

            if succeeded {
                for stage in downstream {
                    if let Some(count) = waiting.get_mut(stage.id.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            running.push(self.run_stage(pipeline.id, stage));
                        }
                    }
                }
            } else {
                self.skip_downstream(pipeline.id, &stage_id, &dependents, &mut waiting);
            }

            if let Some(progress) = self.snapshot(pipeline.id) {
                if let Err(e) = self
                    .synchronizer
                    .context()
                    .store
                    .update_pipeline_result(&progress)
                    .await
                {
                    warn!(pipeline_id = %pipeline.id, error = %e, "failed to persist pipeline progress");
                }
            }
        }
    }

    async fn run_stage(&self, pipeline_id: Uuid, stage: &Stage) -> (String, Result<SyncResult>) {
        let outcome: Result<SyncResult> = async {
            let options = SyncOptions {
                force: true,
                mode: stage.mode,
                max_pages: None,
                trigger: SyncTrigger::Pipeline,
            };
            let sync_id = self.synchronizer.start(stage.source_id, options).await?;
            self.update_stage(pipeline_id, &stage.id, |s| {
                s.status = StageStatus::Running;
                s.sync_id = Some(sync_id);
                s.started_at = Some(Utc::now());
            });

            self.synchronizer.wait(sync_id).await;
            self.synchronizer
                .context()
                .store
                .get_sync_result(sync_id)
                .await?
                .ok_or(IntegrationError::SyncNotFound(sync_id))
        }
        .await;
        (stage.id.clone(), outcome)
    }

    /// Fold a finished stage into the live result; `true` when it completed
    fn record_stage(&self, pipeline_id: Uuid, stage_id: &str, outcome: Result<SyncResult>) -> bool {
        let mut live = self.live();
        let Some(run) = live.get_mut(&pipeline_id) else {
            return false;
        };

        let (status, error) = match &outcome {
            Ok(result) => {
                run.totals.merge(&result.counts);
                match result.status {
                    SyncStatus::Completed => (StageStatus::Completed, None),
                    other => (
                        StageStatus::Failed,
                        Some(
                            result
                                .errors
                                .last()
                                .map(|e| e.message.clone())
                                .unwrap_or_else(|| format!("sync ended {}", other.as_str())),
                        ),
                    ),
                }
            }
            Err(e) => (StageStatus::Failed, Some(e.to_string())),
        };

        if let Some(stage) = run.stages.iter_mut().find(|s| s.stage_id == stage_id) {
            stage.status = status;
            stage.error = error.clone();
            stage.completed_at = Some(Utc::now());
            if let Ok(result) = &outcome {
                stage.sync_id = Some(result.id);
                stage.started_at = stage.started_at.or(result.started_at);
            }
        }
        if let Some(error) = error {
            warn!(%pipeline_id, stage = stage_id, %error, "pipeline stage failed");
        }
        status == StageStatus::Completed
    }

    fn skip_downstream(
        &self,
        pipeline_id: Uuid,
        failed: &str,
        dependents: &HashMap<&str, Vec<&Stage>>,
        waiting: &mut HashMap<&str, usize>,
    ) {
        let mut frontier = vec![failed.to_string()];
        while let Some(id) = frontier.pop() {
            for stage in dependents.get(id.as_str()).into_iter().flatten() {
                // Removing the entry keeps the stage from ever being launched
                if waiting.remove(stage.id.as_str()).is_some() {
                    self.update_stage(pipeline_id, &stage.id, |s| {
                        s.status = StageStatus::Skipped;
                        s.error = Some(format!("upstream stage '{failed}' did not complete"));
                    });
                    frontier.push(stage.id.clone());
                }
            }
        }
    }

    /// Live run when one is in flight, the latest persisted run otherwise
    pub async fn status(&self, pipeline: &Pipeline) -> Result<PipelineStatusReport> {
        let latest_run = match self.snapshot(pipeline.id) {
            Some(run) => Some(run),
            None => {
                self.synchronizer
                    .context()
                    .store
                    .latest_pipeline_result(pipeline.id)
                    .await?
            }
        };
        Ok(PipelineStatusReport {
            pipeline_id: pipeline.id,
            name: pipeline.name.clone(),
            state: pipeline.state,
            latest_run,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stage(id: &str, deps: &[&str]) -> Stage {
        Stage {
            id: id.to_string(),
            name: None,
            source_id: Uuid::new_v4(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            mode: None,
        }
    }

    #[test]
    fn test_diamond_waves() {
        let waves = execution_waves(&[
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["a"]),
            stage("d", &["b", "c"]),
        ])
        .unwrap();

        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["a"]);
        let mut middle = waves[1].clone();
        middle.sort();
        assert_eq!(middle, vec!["b", "c"]);
        assert_eq!(waves[2], vec!["d"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = execution_waves(&[
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidPipeline(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_malformed_graphs_rejected() {
        assert!(execution_waves(&[]).is_err());
        assert!(execution_waves(&[stage("a", &[]), stage("a", &[])]).is_err());
        assert!(execution_waves(&[stage("a", &["a"])]).is_err());
        assert!(execution_waves(&[stage("a", &["ghost"])]).is_err());
    }

    #[test]
    fn test_repeated_dependency_counted_once() {
        let waves = execution_waves(&[stage("a", &[]), stage("b", &["a", "a"])]).unwrap();
        assert_eq!(waves, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }
}
