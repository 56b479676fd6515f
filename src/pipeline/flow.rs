use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};

use crate::config::GenerationFlowConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, FlowEvent, ProgressThrottle};
use crate::generation::GenerationClient;
use crate::models::{
    FlowCheckpoint, FlowErrorInfo, FlowSnapshot, FlowStatus, GameRecord, ItemResult, ItemSnapshot,
    ItemStatus,
};
use crate::pipeline::item::ItemStateMachine;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::scheduler::{ConcurrencyScheduler, SchedulerHandle, SchedulerNotice};
use crate::pipeline::stage::StageRunner;

/// Flow-level bookkeeping behind one lock. Item state lives in the
/// scheduler task and is reached through message round-trips.
struct FlowState {
    status: FlowStatus,
    progress: u8,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    errors: Vec<FlowErrorInfo>,
    throttle: ProgressThrottle,
    terminal_items: usize,
    /// Set once the terminal transition for the current run is claimed;
    /// exactly one terminal event follows per run.
    finalized: bool,
    /// Item snapshots frozen together with the terminal status, so a
    /// terminal flow snapshot never mixes with live item state.
    final_items: Option<Vec<ItemSnapshot>>,
}

/// Drives one generation flow from creation to its terminal event:
/// dispatch through the scheduler, lifecycle commands, the flow-level
/// timeout and event emission.
pub struct FlowController {
    flow_id: String,
    config: Arc<GenerationFlowConfig>,
    scheduler: SchedulerHandle,
    events: EventBus,
    state: Mutex<FlowState>,
}

impl FlowController {
    /// Validate the configuration, load the game records and start
    /// dispatching. Returns the running controller; an error here means
    /// nothing was started.
    ///
    /// `stage_permits` shares a stage-execution cap across flows; pass
    /// `None` to run with a cap of the flow's own configured size.
    pub async fn start(
        flow_id: String,
        config: GenerationFlowConfig,
        store: Arc<dyn crate::storage::GameRecordStore>,
        client: Arc<dyn GenerationClient>,
        events: EventBus,
        stage_permits: Option<Arc<Semaphore>>,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let records = store.batch_get(&config.game_record_ids).await?;
        let by_id: HashMap<String, GameRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();
        let items: Vec<ItemStateMachine> = config
            .game_record_ids
            .iter()
            .map(|id| ItemStateMachine::new(id.clone(), by_id.get(id).cloned()))
            .collect();

        let policy = RetryPolicy::from_settings(&config.retry, &config.timeout);
        let runner = Arc::new(StageRunner::new(client, policy));
        let permits = stage_permits.unwrap_or_else(|| {
            Arc::new(Semaphore::new(config.concurrency.max_concurrent_stages))
        });
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let scheduler = ConcurrencyScheduler::spawn(
            flow_id.clone(),
            items,
            Arc::clone(&config),
            runner,
            permits,
            notice_tx,
        );

        let now = Utc::now().timestamp_millis();
        let controller = Arc::new(Self {
            flow_id: flow_id.clone(),
            config: Arc::clone(&config),
            scheduler,
            events,
            state: Mutex::new(FlowState {
                status: FlowStatus::Running,
                progress: 0,
                created_at: now,
                started_at: Some(now),
                completed_at: None,
                errors: Vec::new(),
                throttle: ProgressThrottle::new(config.notifications.progress_update_interval_ms),
                terminal_items: 0,
                finalized: false,
                final_items: None,
            }),
        });

        Self::spawn_notice_loop(Arc::downgrade(&controller), notice_rx);
        Self::spawn_total_timeout(Arc::downgrade(&controller), config.timeout.total_ms);
        info!(
            "Flow {} started: {} item(s), workflow {}",
            flow_id,
            config.game_record_ids.len(),
            config.workflow_id
        );
        controller.scheduler.begin();
        Ok(controller)
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn config(&self) -> &GenerationFlowConfig {
        &self.config
    }

    fn spawn_notice_loop(
        weak: Weak<Self>,
        mut notices: mpsc::UnboundedReceiver<SchedulerNotice>,
    ) {
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.on_notice(notice).await;
            }
        });
    }

    fn spawn_total_timeout(weak: Weak<Self>, total_ms: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(total_ms)).await;
            if let Some(controller) = weak.upgrade() {
                controller.on_total_timeout().await;
            }
        });
    }

    async fn on_notice(&self, notice: SchedulerNotice) {
        match notice {
            SchedulerNotice::StageCompleted { item_id, stage } => {
                debug!(
                    "Flow {}: stage {} completed for item {}",
                    self.flow_id, stage, item_id
                );
                self.emit_progress(Some(stage.as_str().to_string())).await;
            }
            SchedulerNotice::ItemTerminal { item_id, status } => {
                self.on_item_terminal(&item_id, status).await;
            }
            SchedulerNotice::Parked => {
                debug!("Flow {}: all in-flight work parked", self.flow_id);
            }
            SchedulerNotice::Drained => self.finalize().await,
        }
    }

    async fn on_item_terminal(&self, item_id: &str, status: ItemStatus) {
        let total = self.config.game_record_ids.len().max(1);
        let finalized = {
            let mut state = self.state.lock().await;
            state.terminal_items += 1;
            let pct = ((state.terminal_items * 100) / total).min(100) as u8;
            if pct > state.progress {
                state.progress = pct;
            }
            state.finalized
        };
        debug!(
            "Flow {}: item {} reached terminal status {:?}",
            self.flow_id, item_id, status
        );
        // Late notices, e.g. the drain after a flow timeout, emit nothing
        // past the terminal event.
        if finalized {
            return;
        }
        self.emit_progress(None).await;

        if self.config.recovery.save_checkpoints {
            let snapshot = self.snapshot().await;
            self.events.emit(FlowEvent::Checkpoint(FlowCheckpoint {
                flow_id: self.flow_id.clone(),
                taken_at: Utc::now().timestamp_millis(),
                snapshot,
            }));
        }
    }

    /// Progress is monotonic per run; the throttle additionally drops
    /// unchanged and too-frequent values.
    async fn emit_progress(&self, current_stage: Option<String>) {
        let now = Utc::now().timestamp_millis();
        let (progress, due) = {
            let mut state = self.state.lock().await;
            if state.finalized {
                return;
            }
            let progress = state.progress;
            let due = state.throttle.should_emit(progress, now);
            (progress, due)
        };
        if due {
            self.events.emit(FlowEvent::Progress {
                flow_id: self.flow_id.clone(),
                progress,
                current_stage,
            });
        }
    }

    /// All items are terminal: pick the flow's terminal status, then emit
    /// exactly one terminal event for this run.
    async fn finalize(&self) {
        let results = self.scheduler.results().await;
        let items = self.scheduler.snapshots().await;
        let now = Utc::now().timestamp_millis();

        let (status, emit_full_progress, error) = {
            let mut state = self.state.lock().await;
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.completed_at = Some(now);
            state.progress = 100;
            // Frozen in the same critical section that publishes the
            // terminal status: snapshots never pair a terminal flow with
            // live item state.
            state.final_items = Some(items);
            let emit_full_progress = state.throttle.should_emit(100, now);

            let failed: Vec<&ItemResult> = results
                .iter()
                .filter(|r| r.status == ItemStatus::Failed)
                .collect();
            let any_completed = results.iter().any(|r| r.status == ItemStatus::Completed);
            for result in &failed {
                if let Some(error) = &result.error {
                    state.errors.push(error.clone());
                }
            }

            let status = if failed.is_empty() {
                FlowStatus::Completed
            } else if self.config.content.allow_partial_completion && any_completed {
                FlowStatus::Completed
            } else {
                FlowStatus::Failed
            };
            state.status = status;

            let error = if status == FlowStatus::Failed {
                Some(failed.iter().find_map(|r| r.error.clone()).unwrap_or(
                    FlowErrorInfo {
                        message: format!("{} item(s) failed", failed.len()),
                        kind: EngineError::InternalScheduling(String::new())
                            .kind()
                            .to_string(),
                    },
                ))
            } else {
                None
            };
            (status, emit_full_progress, error)
        };

        if emit_full_progress {
            self.events.emit(FlowEvent::Progress {
                flow_id: self.flow_id.clone(),
                progress: 100,
                current_stage: None,
            });
        }
        match error {
            Some(error) => {
                warn!("Flow {} failed: {}", self.flow_id, error.message);
                self.events.emit(FlowEvent::Error {
                    flow_id: self.flow_id.clone(),
                    error,
                });
            }
            None => {
                info!("Flow {} finished with status {:?}", self.flow_id, status);
                self.events.emit(FlowEvent::Completed {
                    flow_id: self.flow_id.clone(),
                    results,
                });
            }
        }
    }

    /// Flow-level deadline. Claims the terminal transition first so the
    /// late drain emits nothing, then fails the items and emits a single
    /// error event.
    async fn on_total_timeout(&self) {
        let error = EngineError::FlowTimeout(format!(
            "Flow exceeded the configured total timeout of {}ms",
            self.config.timeout.total_ms
        ));
        let info = FlowErrorInfo::from(&error);
        {
            let mut state = self.state.lock().await;
            if state.finalized || state.status.is_terminal() {
                return;
            }
            state.finalized = true;
        }
        warn!("Flow {} timed out", self.flow_id);
        self.scheduler.fail_all(error);
        // Scheduler replies are ordered behind the failure, so these
        // snapshots already show every item failed.
        let items = self.scheduler.snapshots().await;
        {
            let mut state = self.state.lock().await;
            state.status = FlowStatus::Failed;
            state.completed_at = Some(Utc::now().timestamp_millis());
            state.progress = 100;
            state.errors.push(info.clone());
            state.final_items = Some(items);
        }
        self.events.emit(FlowEvent::Error {
            flow_id: self.flow_id.clone(),
            error: info,
        });
    }

    /// Pause dispatch at stage boundaries. Returns false when the flow is
    /// not running, including when it reached a terminal status during the
    /// scheduler round-trip.
    pub async fn pause(&self) -> bool {
        {
            let state = self.state.lock().await;
            if state.status != FlowStatus::Running || state.finalized {
                return false;
            }
        }
        if !self.scheduler.pause().await {
            return false;
        }
        let mut state = self.state.lock().await;
        if state.status == FlowStatus::Running && !state.finalized {
            state.status = FlowStatus::Paused;
            true
        } else {
            false
        }
    }

    /// Resume a paused flow; parked items re-enter the ready queue in
    /// their original order.
    pub async fn resume(&self) -> bool {
        {
            let state = self.state.lock().await;
            if state.status != FlowStatus::Paused || state.finalized {
                return false;
            }
        }
        if !self.scheduler.resume().await {
            return false;
        }
        let mut state = self.state.lock().await;
        if state.status == FlowStatus::Paused && !state.finalized {
            state.status = FlowStatus::Running;
            true
        } else {
            false
        }
    }

    /// Cancel the flow: every pending and in-flight item is marked
    /// cancelled, late stage results are discarded and the terminal event
    /// is emitted here. Idempotent: a repeat cancel returns false and
    /// changes nothing.
    pub async fn cancel(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.finalized || state.status.is_terminal() {
                return false;
            }
            // Claim the terminal transition; the drain that follows the
            // scheduler-side cancel then emits nothing of its own.
            state.finalized = true;
        }
        self.scheduler.cancel().await;
        let items = self.scheduler.snapshots().await;
        let results = self.scheduler.results().await;
        {
            let mut state = self.state.lock().await;
            state.status = FlowStatus::Cancelled;
            state.completed_at = Some(Utc::now().timestamp_millis());
            state.progress = 100;
            state.final_items = Some(items);
        }
        info!("Flow {} cancelled", self.flow_id);
        self.events.emit(FlowEvent::Completed {
            flow_id: self.flow_id.clone(),
            results,
        });
        true
    }

    /// Re-queue failed items within the recovery budget. Returns how many
    /// items were re-queued; the flow returns to running when any were.
    pub async fn retry_failed(&self) -> usize {
        {
            let state = self.state.lock().await;
            if !matches!(state.status, FlowStatus::Failed | FlowStatus::Completed) {
                return 0;
            }
        }
        let requeued = self.scheduler.retry_failed().await;
        if requeued > 0 {
            let mut state = self.state.lock().await;
            state.status = FlowStatus::Running;
            state.finalized = false;
            state.final_items = None;
            state.completed_at = None;
            state.terminal_items = state.terminal_items.saturating_sub(requeued);
            let total = self.config.game_record_ids.len().max(1);
            state.progress = ((state.terminal_items * 100) / total).min(100) as u8;
            // New run, new throttle baseline.
            state.throttle =
                ProgressThrottle::new(self.config.notifications.progress_update_interval_ms);
            info!("Flow {}: re-queued {} failed item(s)", self.flow_id, requeued);
        }
        requeued
    }

    /// Consistent point-in-time view of the flow and all of its items.
    /// Once the flow is terminal the items come from the frozen set, never
    /// from a live scheduler round-trip.
    pub async fn snapshot(&self) -> FlowSnapshot {
        let live_items = self.scheduler.snapshots().await;
        let state = self.state.lock().await;
        let items = state.final_items.clone().unwrap_or(live_items);
        FlowSnapshot {
            flow_id: self.flow_id.clone(),
            workflow_id: self.config.workflow_id.clone(),
            status: state.status,
            progress: state.progress,
            created_at: state.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            items,
            errors: state.errors.clone(),
        }
    }

    pub async fn results(&self) -> Vec<ItemResult> {
        self.scheduler.results().await
    }

    /// Stop the scheduler loop. Called when the flow is removed from the
    /// registry; the controller stops answering queries afterwards.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        // The scheduler loop holds a clone of its own sender, so it only
        // ends on an explicit shutdown message.
        self.scheduler.shutdown();
    }
}
