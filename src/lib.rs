//! Orchestration engine that turns structured game records into
//! SEO-ready articles through a three-stage generation pipeline:
//! format analysis, content generation and format validation.
//!
//! The [`ContentEngine`] is the entry point. It runs any number of
//! concurrent flows, each driving its configured game records through the
//! pipeline under per-flow item limits and an engine-wide stage cap, with
//! bounded retries, pause/resume/cancel and a typed event stream.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod storage;

pub use config::GenerationFlowConfig;
pub use engine::{ContentEngine, EngineSettings, engine, init_engine};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, FlowEvent};
pub use generation::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResponse, GenerationUsage,
    HttpGenerationClient, HttpGenerationClientConfig,
};
pub use models::{
    ArticleContent, DraftContent, FlowCheckpoint, FlowErrorInfo, FlowSnapshot, FlowStatus,
    FormatRules, GameRecord, ItemResult, ItemSnapshot, ItemStatus, QualityMetrics, QueueStatus,
    StageState, StageStatus,
};
pub use pipeline::{FlowController, FlowRegistry, StageKind};
pub use storage::{GameRecordStore, InMemoryGameRecordStore};
