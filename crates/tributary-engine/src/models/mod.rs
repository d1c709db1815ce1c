//! Data model for sources, runs, mappings, conflicts and pipelines

pub mod conflict;
pub mod mapping;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod sync;

pub use conflict::{
    Conflict, ConflictCandidate, ConflictFilter, ConflictStatus, ConflictStrategy,
    DuplicateDetection, QueuedConflict,
};
pub use mapping::{
    AggregateFn, DataMapping, FieldMapping, FieldType, RuleCheck, TargetField, TargetSchema,
    Transformation, ValidationRule, ValueOp,
};
pub use pipeline::{
    CreatePipeline, Pipeline, PipelineResult, PipelineRunStatus, PipelineState,
    PipelineStatusReport, Stage, StageOutcome, StageStatus,
};
pub use record::{CanonicalRecord, FieldValue, IngestOrigin, MappedRecord, RawRecord, StreamEvent};
pub use source::{
    Authentication, CreateDataSource, DataFormat, DataSource, DataSourcePatch, DataSourceType,
    DatabaseConfig, FileConfig, GraphqlConfig, MessageFeedConfig, OAuth2Config, RateLimits,
    RestApiConfig, ScheduleRequest, ScheduleSpec, SourceConfiguration, SourceFilter, SourceStatus, SyncFrequency,
    SyncMode, SyncSettings, WebhookConfig,
};
pub use sync::{
    DataQualityReport, PerformanceMetrics, SyncCounts, SyncOptions, SyncProgress, SyncResult,
    SyncStatus, SyncTrigger,
};
