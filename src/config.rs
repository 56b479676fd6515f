use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Immutable input to a generation flow. Validated once at `start_flow`;
/// an invalid configuration fails flow creation before any work starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFlowConfig {
    /// Identifier of the article workflow (prompt templates etc.) to run.
    pub workflow_id: String,
    /// Game records to generate articles for, in submission order.
    pub game_record_ids: Vec<String>,
    #[serde(default)]
    pub content: ContentSettings,
    #[serde(default)]
    pub structured_data: StructuredDataSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

/// Content and quality settings injected into stage prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSettings {
    pub target_word_count: u32,
    pub tone: String,
    pub seo_keywords: Vec<String>,
    /// When set, the flow completes as long as at least one item succeeded.
    /// When clear, any permanently failed item fails the whole flow.
    pub allow_partial_completion: bool,
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            target_word_count: 800,
            tone: "editorial".to_string(),
            seo_keywords: Vec::new(),
            allow_partial_completion: true,
        }
    }
}

/// Schema.org options forwarded verbatim into stage prompts. The field
/// mapping itself is performed by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StructuredDataSettings {
    pub emit_schema_org: bool,
    pub article_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencySettings {
    /// Items concurrently in a non-terminal stage, per flow.
    pub max_concurrent_items: usize,
    /// Stage executions in flight at once, shared across flows.
    pub max_concurrent_stages: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_items: 3,
            max_concurrent_stages: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSettings {
    /// Bounds one stage attempt (one generation API call).
    pub per_item_ms: u64,
    /// Hard ceiling for the whole flow.
    pub total_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            per_item_ms: 120_000,
            total_ms: 1_800_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySettings {
    /// Re-queue retryably-exhausted items at their last incomplete stage.
    pub enable_auto_recovery: bool,
    /// Emit best-effort checkpoint snapshots for the host to persist.
    pub save_checkpoints: bool,
    /// Recovery attempts per flow, shared between auto and manual retry.
    pub max_recovery_attempts: u32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enable_auto_recovery: false,
            save_checkpoints: false,
            max_recovery_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    /// Minimum interval between `progress` events, in milliseconds.
    pub progress_update_interval_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            progress_update_interval_ms: 500,
        }
    }
}

impl GenerationFlowConfig {
    pub fn new(workflow_id: impl Into<String>, game_record_ids: Vec<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            game_record_ids,
            content: ContentSettings::default(),
            structured_data: StructuredDataSettings::default(),
            concurrency: ConcurrencySettings::default(),
            timeout: TimeoutSettings::default(),
            retry: RetrySettings::default(),
            recovery: RecoverySettings::default(),
            notifications: NotificationSettings::default(),
        }
    }

    /// Validate the configuration. Called once at flow creation; a failure
    /// here means no flow is registered and no side effects occurred.
    pub fn validate(&self) -> EngineResult<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "workflowId must not be empty".to_string(),
            ));
        }
        if self.game_record_ids.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "gameRecordIds must not be empty".to_string(),
            ));
        }
        if self.game_record_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(EngineError::InvalidConfiguration(
                "gameRecordIds must not contain empty ids".to_string(),
            ));
        }
        if self.concurrency.max_concurrent_items == 0 {
            return Err(EngineError::InvalidConfiguration(
                "maxConcurrentItems must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_concurrent_stages == 0 {
            return Err(EngineError::InvalidConfiguration(
                "maxConcurrentStages must be at least 1".to_string(),
            ));
        }
        if self.timeout.per_item_ms == 0 || self.timeout.total_ms == 0 {
            return Err(EngineError::InvalidConfiguration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(EngineError::InvalidConfiguration(
                "backoffFactor must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}
