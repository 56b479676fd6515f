use log::{info, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};

use crate::config::GenerationFlowConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, FlowEvent};
use crate::generation::GenerationClient;
use crate::models::{FlowSnapshot, QueueStatus};
use crate::pipeline::flow::FlowController;
use crate::pipeline::registry::FlowRegistry;
use crate::storage::GameRecordStore;

/// Engine-level knobs, independent of any single flow.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Stage executions in flight at once, across all flows.
    pub max_concurrent_stages: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 4,
        }
    }
}

/// Entry point of the crate: owns the flow registry, the shared stage
/// permit pool and the event bus, and exposes the flow lifecycle API.
pub struct ContentEngine {
    store: Arc<dyn GameRecordStore>,
    client: Arc<dyn GenerationClient>,
    registry: FlowRegistry,
    stage_permits: Arc<Semaphore>,
    events: EventBus,
}

impl ContentEngine {
    pub fn new(store: Arc<dyn GameRecordStore>, client: Arc<dyn GenerationClient>) -> Self {
        Self::with_settings(store, client, EngineSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn GameRecordStore>,
        client: Arc<dyn GenerationClient>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            client,
            registry: FlowRegistry::new(),
            stage_permits: Arc::new(Semaphore::new(settings.max_concurrent_stages.max(1))),
            events: EventBus::new(),
        }
    }

    /// Subscribe to the event stream of every flow this engine runs.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Validate the configuration and start a new flow. On a validation
    /// error no flow is registered and no side effects occurred.
    pub async fn start_flow(&self, config: GenerationFlowConfig) -> EngineResult<String> {
        config.validate()?;
        let flow_id = uuid::Uuid::new_v4().to_string();
        let flow = FlowController::start(
            flow_id.clone(),
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.events.clone(),
            Some(Arc::clone(&self.stage_permits)),
        )
        .await?;
        self.registry.insert(flow).await;
        info!("Registered flow {}", flow_id);
        Ok(flow_id)
    }

    async fn flow(&self, flow_id: &str) -> EngineResult<Arc<FlowController>> {
        self.registry
            .get(flow_id)
            .await
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))
    }

    /// Pause a running flow. Returns false when the flow was not running.
    pub async fn pause_flow(&self, flow_id: &str) -> EngineResult<bool> {
        Ok(self.flow(flow_id).await?.pause().await)
    }

    /// Resume a paused flow.
    pub async fn resume_flow(&self, flow_id: &str) -> EngineResult<bool> {
        Ok(self.flow(flow_id).await?.resume().await)
    }

    /// Cancel a flow. Idempotent: a second cancel returns false.
    pub async fn cancel_flow(&self, flow_id: &str) -> EngineResult<bool> {
        Ok(self.flow(flow_id).await?.cancel().await)
    }

    /// Re-queue a flow's failed items within their recovery budget.
    /// Returns the number of items re-queued.
    pub async fn retry_flow(&self, flow_id: &str) -> EngineResult<usize> {
        Ok(self.flow(flow_id).await?.retry_failed().await)
    }

    pub async fn flow_status(&self, flow_id: &str) -> EngineResult<FlowSnapshot> {
        Ok(self.flow(flow_id).await?.snapshot().await)
    }

    pub async fn all_flow_statuses(&self) -> Vec<FlowSnapshot> {
        let flows = self.registry.list().await;
        let mut snapshots =
            futures::future::join_all(flows.iter().map(|flow| flow.snapshot())).await;
        snapshots.sort_by_key(|snapshot| snapshot.created_at);
        snapshots
    }

    /// Aggregate item counters across every registered flow.
    pub async fn queue_status(&self) -> QueueStatus {
        let mut status = QueueStatus::default();
        for snapshot in self.all_flow_statuses().await {
            let (running, queued, completed, failed) = snapshot.counts();
            status.total += snapshot.items.len();
            status.running += running;
            status.queued += queued;
            status.completed += completed;
            status.failed += failed;
        }
        status
    }

    /// Drop a flow from the registry and stop its scheduler. Returns false
    /// when no such flow exists.
    pub async fn remove_flow(&self, flow_id: &str) -> bool {
        match self.registry.remove(flow_id).await {
            Some(flow) => {
                flow.shutdown();
                true
            }
            None => false,
        }
    }
}

static ENGINE: OnceCell<Arc<ContentEngine>> = OnceCell::new();

/// Install a process-wide engine. Later calls are ignored.
pub fn init_engine(engine: Arc<ContentEngine>) {
    if ENGINE.set(engine).is_err() {
        warn!("Content engine already initialized, ignoring");
    }
}

pub fn engine() -> Option<Arc<ContentEngine>> {
    ENGINE.get().cloned()
}
