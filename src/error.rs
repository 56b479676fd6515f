use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide error type.
///
/// Stage-level retryable errors are consumed internally by the retry policy
/// and only surface here once the retry budget is exhausted.
#[derive(Error, Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Retryable stage error: {0}")]
    RetryableStage(String),

    #[error("Fatal stage error: {0}")]
    FatalStage(String),

    #[error("Item timed out: {0}")]
    ItemTimeout(String),

    #[error("Flow timed out: {0}")]
    FlowTimeout(String),

    #[error("Internal scheduling error: {0}")]
    InternalScheduling(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Generation API error: {0}")]
    GenerationApi(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Short machine-readable kind, used in the `error` event payload.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidConfiguration(_) => "invalidConfiguration",
            EngineError::RetryableStage(_) => "retryableStageError",
            EngineError::FatalStage(_) => "fatalStageError",
            EngineError::ItemTimeout(_) => "itemTimeoutError",
            EngineError::FlowTimeout(_) => "flowTimeoutError",
            EngineError::InternalScheduling(_) => "internalSchedulingError",
            EngineError::FlowNotFound(_) => "flowNotFound",
            EngineError::RecordNotFound(_) => "recordNotFound",
            EngineError::GenerationApi(_) => "generationApiError",
            EngineError::Serialization(_) => "serializationError",
            EngineError::Storage(_) => "storageError",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
