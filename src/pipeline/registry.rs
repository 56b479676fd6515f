use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::pipeline::flow::FlowController;

/// Registry of live flow controllers, keyed by flow id. Flows stay
/// registered after they reach a terminal status so their results remain
/// queryable until explicitly removed.
#[derive(Default)]
pub struct FlowRegistry {
    flows: Mutex<HashMap<String, Arc<FlowController>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, flow: Arc<FlowController>) {
        let mut flows = self.flows.lock().await;
        flows.insert(flow.flow_id().to_string(), flow);
    }

    pub async fn get(&self, flow_id: &str) -> Option<Arc<FlowController>> {
        let flows = self.flows.lock().await;
        flows.get(flow_id).cloned()
    }

    /// Detach a flow. The caller is responsible for shutting the
    /// controller down.
    pub async fn remove(&self, flow_id: &str) -> Option<Arc<FlowController>> {
        let mut flows = self.flows.lock().await;
        let removed = flows.remove(flow_id);
        if removed.is_some() {
            debug!("Flow {} removed from registry", flow_id);
        }
        removed
    }

    pub async fn list(&self) -> Vec<Arc<FlowController>> {
        let flows = self.flows.lock().await;
        flows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let flows = self.flows.lock().await;
        flows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
