use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{FlowCheckpoint, FlowErrorInfo, ItemResult};

/// Typed event stream exposed to observers. Payload shapes are part of the
/// public contract and mirror what the UI layer renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum FlowEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        flow_id: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_stage: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        flow_id: String,
        results: Vec<ItemResult>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        flow_id: String,
        error: FlowErrorInfo,
    },
    #[serde(rename_all = "camelCase")]
    Checkpoint(FlowCheckpoint),
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for flow events. Emission is fire-and-forget: with no
/// subscribers attached the event is dropped, never an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FlowEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers attached, event dropped");
        }
    }
}

/// Throttles progress emission to the configured update interval. Terminal
/// progress (100) always passes through.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval_ms: u64,
    last_emitted_at: Option<i64>,
    last_value: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_emitted_at: None,
            last_value: None,
        }
    }

    /// Returns true if a progress event with this value should be emitted now.
    pub fn should_emit(&mut self, progress: u8, now_ms: i64) -> bool {
        if self.last_value == Some(progress) {
            return false;
        }
        let due = match self.last_emitted_at {
            None => true,
            Some(last) => progress >= 100 || now_ms - last >= self.interval_ms as i64,
        };
        if due {
            self.last_emitted_at = Some(now_ms);
            self.last_value = Some(progress);
        }
        due
    }
}
