//! Pipelines of dependency-ordered sync stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::source::SyncMode;
use super::sync::SyncCounts;

/// Definition lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Draft,
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source_id: Uuid,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub mode: Option<SyncMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
    pub state: PipelineState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn from_request(request: CreatePipeline) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            stages: request.stages,
            state: PipelineState::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_id: String,
    pub status: StageStatus,
    pub sync_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            sync_id: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Running,
    Completed,
    Failed,
}

/// One execution of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: PipelineRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageOutcome>,
    /// Sum of the counts of every stage run that actually ran
    pub totals: SyncCounts,
}

impl PipelineResult {
    pub fn stage(&self, id: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage_id == id)
    }
}

/// Answer to `monitor_pipeline`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatusReport {
    pub pipeline_id: Uuid,
    pub name: String,
    pub state: PipelineState,
    /// Live run, or the most recent finished one
    pub latest_run: Option<PipelineResult>,
}
