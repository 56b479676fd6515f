use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;

/// Raw game data consumed by the format-analysis stage. The engine treats
/// the payload as opaque JSON supplied by the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub id: String,
    pub title: String,
    pub payload: serde_json::Value,
}

/// Output of the format-analysis stage, fed into content generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatRules {
    pub outline: Vec<String>,
    pub heading_style: String,
    pub required_sections: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Draft produced by the content-generation stage, fed into validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftContent {
    pub title: String,
    pub body: String,
    pub meta_description: Option<String>,
}

/// Final validated article with quality metrics, produced by stage 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleContent {
    pub title: String,
    pub body: String,
    pub meta_description: Option<String>,
    pub quality: QualityMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub word_count: u32,
    pub keyword_coverage: f32,
    pub readability_score: f32,
}

/// Overall status of one flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FlowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

/// Overall status of one work item (one game record).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

/// Status of a single stage execution for one item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-stage bookkeeping kept by the item state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Terminal result for one item, reported through the `completed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    pub article: Option<ArticleContent>,
    pub error: Option<FlowErrorInfo>,
    pub tokens_sent: u64,
    pub tokens_received: u64,
}

/// Error information as surfaced to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowErrorInfo {
    pub message: String,
    pub kind: String,
}

impl From<&EngineError> for FlowErrorInfo {
    fn from(err: &EngineError) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

/// Read-only snapshot of one item, embedded in flow snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub item_id: String,
    pub status: ItemStatus,
    pub current_stage: Option<String>,
    pub stages: HashMap<String, StageState>,
    pub error: Option<FlowErrorInfo>,
}

/// Consistent, read-only snapshot of one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub workflow_id: String,
    pub status: FlowStatus,
    pub progress: u8,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub items: Vec<ItemSnapshot>,
    pub errors: Vec<FlowErrorInfo>,
}

impl FlowSnapshot {
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut running = 0;
        let mut queued = 0;
        let mut completed = 0;
        let mut failed = 0;
        for item in &self.items {
            match item.status {
                ItemStatus::Running => running += 1,
                ItemStatus::Pending | ItemStatus::Paused => queued += 1,
                ItemStatus::Completed => completed += 1,
                ItemStatus::Failed | ItemStatus::Cancelled => failed += 1,
            }
        }
        (running, queued, completed, failed)
    }
}

/// Aggregate counters across all registered flows.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub total: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Best-effort snapshot emitted when `saveCheckpoints` is enabled. The host
/// application may persist it; the core never reads checkpoints back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowCheckpoint {
    pub flow_id: String,
    pub taken_at: i64,
    pub snapshot: FlowSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn terminal_statuses() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Cancelled.is_terminal());
        assert!(!FlowStatus::Paused.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Running.is_terminal());
    }

    #[test]
    fn snapshot_counts_classify_items() {
        let item = |status| ItemSnapshot {
            item_id: "g".to_string(),
            status,
            current_stage: None,
            stages: HashMap::new(),
            error: None,
        };
        let snapshot = FlowSnapshot {
            flow_id: "f".to_string(),
            workflow_id: "w".to_string(),
            status: FlowStatus::Running,
            progress: 50,
            created_at: 0,
            started_at: None,
            completed_at: None,
            items: vec![
                item(ItemStatus::Running),
                item(ItemStatus::Pending),
                item(ItemStatus::Completed),
                item(ItemStatus::Cancelled),
            ],
            errors: vec![],
        };
        assert_eq!(snapshot.counts(), (1, 1, 1, 1));
    }

    #[test]
    fn error_info_carries_kind() {
        let err = EngineError::FlowTimeout("flow exceeded 10s".to_string());
        let info = FlowErrorInfo::from(&err);
        assert_eq!(info.kind, "flowTimeoutError");
        assert!(info.message.contains("10s"));
    }
}
