use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::config::GenerationFlowConfig;
use crate::error::EngineError;
use crate::models::{ItemResult, ItemSnapshot, ItemStatus};
use crate::pipeline::item::ItemStateMachine;
use crate::pipeline::retry::RetryFailure;
use crate::pipeline::stage::{StageKind, StageResult, StageRunner};

/// Control and completion messages consumed by the scheduler loop.
pub(crate) enum SchedulerMessage {
    /// Seed the ready queue with all items and start dispatching.
    Begin,
    StageFinished {
        item_id: String,
        stage: StageKind,
        outcome: Result<(StageResult, u32), RetryFailure>,
    },
    Pause {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    /// Mark every non-terminal item failed with this error and stop
    /// dispatching. Used for flow-level timeouts.
    FailAll {
        error: EngineError,
    },
    /// Re-queue failed items whose recovery budget remains. Replies with
    /// the number of items re-queued.
    RetryFailed {
        reply: oneshot::Sender<usize>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<ItemSnapshot>>,
    },
    Results {
        reply: oneshot::Sender<Vec<ItemResult>>,
    },
    Shutdown,
}

/// Notifications the scheduler pushes to its flow controller.
#[derive(Debug, Clone)]
pub(crate) enum SchedulerNotice {
    StageCompleted {
        item_id: String,
        stage: StageKind,
    },
    /// The item reached a terminal status (completed, failed or cancelled).
    ItemTerminal {
        item_id: String,
        status: ItemStatus,
    },
    /// Pause took effect: nothing is in flight anymore.
    Parked,
    /// All items are terminal and nothing is in flight.
    Drained,
}

/// Cheap cloneable handle for talking to a running scheduler loop.
#[derive(Clone)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
}

impl SchedulerHandle {
    fn send(&self, message: SchedulerMessage) {
        if self.tx.send(message).is_err() {
            debug!("Scheduler loop already stopped, message dropped");
        }
    }

    pub fn begin(&self) {
        self.send(SchedulerMessage::Begin);
    }

    pub async fn pause(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Pause { reply });
        rx.await.unwrap_or(false)
    }

    pub async fn resume(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Resume { reply });
        rx.await.unwrap_or(false)
    }

    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Cancel { reply });
        rx.await.unwrap_or(false)
    }

    pub fn fail_all(&self, error: EngineError) {
        self.send(SchedulerMessage::FailAll { error });
    }

    pub async fn retry_failed(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::RetryFailed { reply });
        rx.await.unwrap_or(0)
    }

    pub async fn snapshots(&self) -> Vec<ItemSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Snapshots { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn results(&self) -> Vec<ItemResult> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerMessage::Results { reply });
        rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        self.send(SchedulerMessage::Shutdown);
    }
}

/// Per-flow dispatcher. Owns the item state machines and a FIFO ready
/// queue; bounds work with the per-flow item limit and the shared stage
/// permit semaphore. Runs as a single task, so item state needs no lock.
pub(crate) struct ConcurrencyScheduler {
    flow_id: String,
    items: HashMap<String, ItemStateMachine>,
    /// Submission order, used for stable snapshots and results.
    order: Vec<String>,
    ready: VecDeque<String>,
    in_flight: usize,
    paused: bool,
    cancelled: bool,
    drained_notified: bool,
    parked_notified: bool,
    recovery_attempts: HashMap<String, u32>,
    config: Arc<GenerationFlowConfig>,
    runner: Arc<StageRunner>,
    stage_permits: Arc<Semaphore>,
    self_tx: mpsc::UnboundedSender<SchedulerMessage>,
    notice_tx: mpsc::UnboundedSender<SchedulerNotice>,
}

impl ConcurrencyScheduler {
    pub fn spawn(
        flow_id: String,
        items: Vec<ItemStateMachine>,
        config: Arc<GenerationFlowConfig>,
        runner: Arc<StageRunner>,
        stage_permits: Arc<Semaphore>,
        notice_tx: mpsc::UnboundedSender<SchedulerNotice>,
    ) -> SchedulerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let order: Vec<String> = items.iter().map(|m| m.item_id().to_string()).collect();
        let items = items
            .into_iter()
            .map(|m| (m.item_id().to_string(), m))
            .collect();

        let mut core = Self {
            flow_id,
            items,
            order,
            ready: VecDeque::new(),
            in_flight: 0,
            paused: false,
            cancelled: false,
            drained_notified: false,
            parked_notified: false,
            recovery_attempts: HashMap::new(),
            config,
            runner,
            stage_permits,
            self_tx: tx.clone(),
            notice_tx,
        };

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if core.handle(message) {
                    break;
                }
            }
            debug!("Scheduler loop for flow {} stopped", core.flow_id);
        });

        SchedulerHandle { tx }
    }

    /// Returns true when the loop should stop.
    fn handle(&mut self, message: SchedulerMessage) -> bool {
        match message {
            SchedulerMessage::Begin => self.on_begin(),
            SchedulerMessage::StageFinished {
                item_id,
                stage,
                outcome,
            } => self.on_stage_finished(&item_id, stage, outcome),
            SchedulerMessage::Pause { reply } => {
                let changed = !self.paused && !self.cancelled;
                if changed {
                    self.on_pause();
                }
                let _ = reply.send(changed);
            }
            SchedulerMessage::Resume { reply } => {
                let changed = self.paused && !self.cancelled;
                if changed {
                    self.on_resume();
                }
                let _ = reply.send(changed);
            }
            SchedulerMessage::Cancel { reply } => {
                let changed = !self.cancelled;
                if changed {
                    self.on_cancel();
                }
                let _ = reply.send(changed);
            }
            SchedulerMessage::FailAll { error } => self.on_fail_all(error),
            SchedulerMessage::RetryFailed { reply } => {
                let _ = reply.send(self.on_retry_failed());
            }
            SchedulerMessage::Snapshots { reply } => {
                let snapshots = self
                    .order
                    .iter()
                    .filter_map(|id| self.items.get(id))
                    .map(ItemStateMachine::snapshot)
                    .collect();
                let _ = reply.send(snapshots);
            }
            SchedulerMessage::Results { reply } => {
                let results = self
                    .order
                    .iter()
                    .filter_map(|id| self.items.get(id))
                    .map(ItemStateMachine::result)
                    .collect();
                let _ = reply.send(results);
            }
            SchedulerMessage::Shutdown => return true,
        }
        self.check_idle();
        false
    }

    fn notify(&self, notice: SchedulerNotice) {
        if self.notice_tx.send(notice).is_err() {
            debug!("Flow controller for {} is gone, notice dropped", self.flow_id);
        }
    }

    fn on_begin(&mut self) {
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            if machine.record().is_none() {
                // Missing record fails only this item, the rest proceed.
                machine.fail_item(EngineError::RecordNotFound(format!(
                    "Game record not found: {}",
                    id
                )));
                warn!("Flow {}: item {} has no game record", self.flow_id, id);
                self.notify(SchedulerNotice::ItemTerminal {
                    item_id: id,
                    status: ItemStatus::Failed,
                });
            } else {
                self.ready.push_back(id);
            }
        }
        self.pump();
    }

    /// Dispatch ready items until the per-flow item limit is reached.
    fn pump(&mut self) {
        while !self.paused
            && !self.cancelled
            && self.in_flight < self.config.concurrency.max_concurrent_items
        {
            let Some(item_id) = self.ready.pop_front() else {
                break;
            };
            let Some(machine) = self.items.get_mut(&item_id) else {
                continue;
            };
            if machine.status().is_terminal() || machine.status() == ItemStatus::Paused {
                continue;
            }
            let Some(stage) = machine.next_incomplete_stage() else {
                continue;
            };
            let Some(record) = machine.record().cloned() else {
                machine.fail_item(EngineError::RecordNotFound(format!(
                    "Game record not found: {}",
                    item_id
                )));
                self.notify(SchedulerNotice::ItemTerminal {
                    item_id,
                    status: ItemStatus::Failed,
                });
                continue;
            };
            if let Err(err) = machine.dispatch(stage) {
                machine.fail_item(err);
                self.notify(SchedulerNotice::ItemTerminal {
                    item_id,
                    status: ItemStatus::Failed,
                });
                continue;
            }

            let partials = machine.partials().clone();
            self.in_flight += 1;
            debug!(
                "Flow {}: dispatching stage {} for item {} ({} in flight)",
                self.flow_id, stage, item_id, self.in_flight
            );

            let permits = Arc::clone(&self.stage_permits);
            let runner = Arc::clone(&self.runner);
            let config = Arc::clone(&self.config);
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                // The stage cap bounds executions, not queue occupancy, so
                // the permit is taken here rather than at enqueue time.
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let outcome = runner.run_stage(stage, &record, &partials, &config).await;
                let _ = tx.send(SchedulerMessage::StageFinished {
                    item_id,
                    stage,
                    outcome,
                });
            });
        }
    }

    fn on_stage_finished(
        &mut self,
        item_id: &str,
        stage: StageKind,
        outcome: Result<(StageResult, u32), RetryFailure>,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Some(machine) = self.items.get_mut(item_id) else {
            return;
        };
        // Results arriving after a cancel or an external failure are
        // discarded.
        if self.cancelled || machine.status().is_terminal() {
            debug!(
                "Flow {}: discarding stage {} result for item {}",
                self.flow_id, stage, item_id
            );
            return;
        }

        match outcome {
            Ok((result, attempts)) => {
                match machine.complete_stage(stage, result.output, &result.usage, attempts) {
                    Ok(Some(_next)) => {
                        // While paused, mid-pipeline items park here and the
                        // resume re-queues them.
                        let park_failed = if self.paused {
                            machine.park().map_err(|err| machine.fail_item(err)).is_err()
                        } else {
                            false
                        };
                        self.notify(SchedulerNotice::StageCompleted {
                            item_id: item_id.to_string(),
                            stage,
                        });
                        if park_failed {
                            self.notify(SchedulerNotice::ItemTerminal {
                                item_id: item_id.to_string(),
                                status: ItemStatus::Failed,
                            });
                        } else if !self.paused {
                            self.ready.push_back(item_id.to_string());
                        }
                    }
                    Ok(None) => {
                        info!("Flow {}: item {} completed", self.flow_id, item_id);
                        self.notify(SchedulerNotice::StageCompleted {
                            item_id: item_id.to_string(),
                            stage,
                        });
                        self.notify(SchedulerNotice::ItemTerminal {
                            item_id: item_id.to_string(),
                            status: ItemStatus::Completed,
                        });
                    }
                    Err(err) => {
                        machine.fail_item(err);
                        self.notify(SchedulerNotice::ItemTerminal {
                            item_id: item_id.to_string(),
                            status: ItemStatus::Failed,
                        });
                    }
                }
            }
            Err(failure) => self.on_stage_failed(item_id, stage, failure),
        }
        self.pump();
    }

    fn on_stage_failed(&mut self, item_id: &str, stage: StageKind, failure: RetryFailure) {
        let Some(machine) = self.items.get_mut(item_id) else {
            return;
        };
        if let Err(err) = machine.fail_stage(stage, failure.error.clone(), failure.attempts) {
            machine.fail_item(err);
            self.notify(SchedulerNotice::ItemTerminal {
                item_id: item_id.to_string(),
                status: ItemStatus::Failed,
            });
            return;
        }

        let recovery = &self.config.recovery;
        let attempts_used = *self.recovery_attempts.get(item_id).unwrap_or(&0);
        let recoverable = !failure.fatal
            && recovery.enable_auto_recovery
            && attempts_used < recovery.max_recovery_attempts;

        if recoverable {
            match machine.requeue_for_recovery() {
                Ok(next_stage) => {
                    *self.recovery_attempts.entry(item_id.to_string()).or_insert(0) += 1;
                    warn!(
                        "Flow {}: auto-recovery {}/{} for item {} at stage {}",
                        self.flow_id,
                        attempts_used + 1,
                        recovery.max_recovery_attempts,
                        item_id,
                        next_stage
                    );
                    self.ready.push_back(item_id.to_string());
                    return;
                }
                Err(err) => {
                    machine.fail_item(err);
                }
            }
        }

        warn!(
            "Flow {}: item {} failed permanently at stage {}: {}",
            self.flow_id, item_id, stage, failure.error
        );
        self.notify(SchedulerNotice::ItemTerminal {
            item_id: item_id.to_string(),
            status: ItemStatus::Failed,
        });
    }

    fn on_pause(&mut self) {
        self.paused = true;
        info!("Flow {}: pausing, {} stage(s) in flight", self.flow_id, self.in_flight);
        // Queued and not-yet-started items park immediately; in-flight
        // stages finish first and park in on_stage_finished.
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            let queued = machine.status() == ItemStatus::Pending
                || (machine.status() == ItemStatus::Running && self.ready.contains(&id));
            if queued {
                if let Err(err) = machine.park() {
                    machine.fail_item(err);
                    self.notify(SchedulerNotice::ItemTerminal {
                        item_id: id,
                        status: ItemStatus::Failed,
                    });
                }
            }
        }
    }

    fn on_resume(&mut self) {
        self.paused = false;
        self.parked_notified = false;
        info!("Flow {}: resuming", self.flow_id);
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            if machine.status() != ItemStatus::Paused {
                continue;
            }
            if let Err(err) = machine.unpark() {
                machine.fail_item(err);
                self.notify(SchedulerNotice::ItemTerminal {
                    item_id: id,
                    status: ItemStatus::Failed,
                });
                continue;
            }
            if !self.ready.contains(&id) {
                self.ready.push_back(id);
            }
        }
        self.drained_notified = false;
        self.pump();
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        self.ready.clear();
        info!("Flow {}: cancelling, {} stage(s) in flight", self.flow_id, self.in_flight);
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            if machine.cancel() {
                self.notify(SchedulerNotice::ItemTerminal {
                    item_id: id,
                    status: ItemStatus::Cancelled,
                });
            }
        }
    }

    fn on_fail_all(&mut self, error: EngineError) {
        self.cancelled = true;
        self.ready.clear();
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            if machine.status().is_terminal() {
                continue;
            }
            machine.fail_item(error.clone());
            self.notify(SchedulerNotice::ItemTerminal {
                item_id: id,
                status: ItemStatus::Failed,
            });
        }
    }

    fn on_retry_failed(&mut self) -> usize {
        if self.cancelled {
            return 0;
        }
        let mut requeued = 0;
        for id in self.order.clone() {
            let Some(machine) = self.items.get_mut(&id) else {
                continue;
            };
            if machine.status() != ItemStatus::Failed {
                continue;
            }
            let attempts_used = *self.recovery_attempts.get(&id).unwrap_or(&0);
            if attempts_used >= self.config.recovery.max_recovery_attempts {
                debug!(
                    "Flow {}: item {} out of recovery budget, not re-queued",
                    self.flow_id, id
                );
                continue;
            }
            match machine.requeue_for_recovery() {
                Ok(_) => {
                    *self.recovery_attempts.entry(id.clone()).or_insert(0) += 1;
                    self.ready.push_back(id);
                    requeued += 1;
                }
                Err(err) => {
                    warn!("Flow {}: could not re-queue item {}: {}", self.flow_id, id, err);
                }
            }
        }
        if requeued > 0 {
            self.drained_notified = false;
            self.pump();
        }
        requeued
    }

    fn check_idle(&mut self) {
        if self.in_flight > 0 {
            return;
        }
        if self.paused && !self.cancelled {
            if !self.parked_notified {
                self.parked_notified = true;
                self.notify(SchedulerNotice::Parked);
            }
            return;
        }
        let all_settled = self
            .items
            .values()
            .all(|machine| machine.status().is_terminal());
        if (all_settled || self.cancelled) && !self.drained_notified {
            self.drained_notified = true;
            self.notify(SchedulerNotice::Drained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::client::testing::{MockGenerationClient, MockOutcome};
    use crate::generation::GenerationError;
    use crate::models::GameRecord;
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::stage::test_fixtures;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn record(id: &str) -> GameRecord {
        GameRecord {
            id: id.to_string(),
            title: format!("Game {}", id),
            payload: json!({ "homeScore": 2, "awayScore": 2 }),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 5,
            attempt_timeout_ms: 2_000,
        }
    }

    /// Scripts a full three-stage success for one item.
    async fn script_success(client: &MockGenerationClient, id: &str) {
        client
            .script(
                &format!("{}:formatAnalysis", id),
                vec![MockOutcome::Succeed(test_fixtures::rules_json())],
            )
            .await;
        client
            .script(
                &format!("{}:contentGeneration", id),
                vec![MockOutcome::Succeed(test_fixtures::draft_json())],
            )
            .await;
        client
            .script(
                &format!("{}:formatValidation", id),
                vec![MockOutcome::Succeed(test_fixtures::article_json())],
            )
            .await;
    }

    struct Harness {
        handle: SchedulerHandle,
        notices: mpsc::UnboundedReceiver<SchedulerNotice>,
    }

    fn start(
        client: Arc<MockGenerationClient>,
        config: GenerationFlowConfig,
        records: Vec<Option<GameRecord>>,
    ) -> Harness {
        let config = Arc::new(config);
        let items = config
            .game_record_ids
            .iter()
            .zip(records)
            .map(|(id, record)| ItemStateMachine::new(id.clone(), record))
            .collect();
        let runner = Arc::new(StageRunner::new(client, fast_policy()));
        let permits = Arc::new(Semaphore::new(config.concurrency.max_concurrent_stages));
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let handle = ConcurrencyScheduler::spawn(
            "flow-test".to_string(),
            items,
            config,
            runner,
            permits,
            notice_tx,
        );
        Harness { handle, notices }
    }

    async fn wait_for_drained(harness: &mut Harness) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), harness.notices.recv()).await {
                Ok(Some(SchedulerNotice::Drained)) => return,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("scheduler never drained"),
            }
        }
    }

    #[tokio::test]
    async fn runs_all_items_to_completion() {
        let client = MockGenerationClient::new("");
        script_success(&client, "g1").await;
        script_success(&client, "g2").await;
        let config = GenerationFlowConfig::new("wf", vec!["g1".to_string(), "g2".to_string()]);
        let mut harness = start(
            client,
            config,
            vec![Some(record("g1")), Some(record("g2"))],
        );

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        let results = harness.handle.results().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ItemStatus::Completed));
        assert!(results.iter().all(|r| r.article.is_some()));
    }

    #[tokio::test]
    async fn stage_concurrency_never_exceeds_cap() {
        let client = MockGenerationClient::with_delay("", Duration::from_millis(30));
        let ids: Vec<String> = (1..=6).map(|i| format!("g{}", i)).collect();
        for id in &ids {
            script_success(&client, id).await;
        }
        let mut config = GenerationFlowConfig::new("wf", ids.clone());
        config.concurrency.max_concurrent_items = 6;
        config.concurrency.max_concurrent_stages = 2;
        let records = ids.iter().map(|id| Some(record(id))).collect();
        let mut harness = start(Arc::clone(&client), config, records);

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        assert!(client.peak_in_flight() <= 2);
        let results = harness.handle.results().await;
        assert!(results.iter().all(|r| r.status == ItemStatus::Completed));
    }

    #[tokio::test]
    async fn item_cap_bounds_concurrent_items() {
        let client = MockGenerationClient::with_delay("", Duration::from_millis(20));
        for id in ["g1", "g2", "g3"] {
            script_success(&client, id).await;
        }
        let mut config = GenerationFlowConfig::new(
            "wf",
            vec!["g1".to_string(), "g2".to_string(), "g3".to_string()],
        );
        config.concurrency.max_concurrent_items = 1;
        config.concurrency.max_concurrent_stages = 8;
        let mut harness = start(
            Arc::clone(&client),
            config,
            vec![Some(record("g1")), Some(record("g2")), Some(record("g3"))],
        );

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        // One item at a time means one stage call at a time.
        assert!(client.peak_in_flight() <= 1);
    }

    #[tokio::test]
    async fn missing_record_fails_only_that_item() {
        let client = MockGenerationClient::new("");
        script_success(&client, "g1").await;
        let config = GenerationFlowConfig::new("wf", vec!["g1".to_string(), "gone".to_string()]);
        let mut harness = start(client, config, vec![Some(record("g1")), None]);

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Completed);
        assert_eq!(results[1].status, ItemStatus::Failed);
        let error = results[1].error.as_ref().unwrap();
        assert_eq!(error.kind, "recordNotFound");
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let client = MockGenerationClient::new("");
        client
            .script(
                "g1:formatAnalysis",
                vec![MockOutcome::Fail(GenerationError::Auth(
                    "invalid key".to_string(),
                ))],
            )
            .await;
        let config = GenerationFlowConfig::new("wf", vec!["g1".to_string()]);
        let mut harness = start(Arc::clone(&client), config, vec![Some(record("g1"))]);

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        assert_eq!(client.total_calls(), 1);
        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Failed);
        assert_eq!(results[0].error.as_ref().unwrap().kind, "fatalStageError");
    }

    #[tokio::test]
    async fn pause_withholds_dispatch_and_resume_continues() {
        let client = MockGenerationClient::with_delay("", Duration::from_millis(20));
        script_success(&client, "g1").await;
        let mut config = GenerationFlowConfig::new("wf", vec!["g1".to_string()]);
        config.concurrency.max_concurrent_items = 1;
        let mut harness = start(Arc::clone(&client), config, vec![Some(record("g1"))]);

        harness.handle.begin();
        assert!(harness.handle.pause().await);
        assert!(!harness.handle.pause().await);

        // Wait for the in-flight stage to finish and the item to park.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), harness.notices.recv()).await {
                Ok(Some(SchedulerNotice::Parked)) => break,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => panic!("scheduler never parked"),
            }
        }
        let calls_while_paused = client.total_calls();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(client.total_calls(), calls_while_paused);

        let snapshots = harness.handle.snapshots().await;
        assert_eq!(snapshots[0].status, ItemStatus::Paused);

        assert!(harness.handle.resume().await);
        wait_for_drained(&mut harness).await;
        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Completed);
        // Completed stages were not re-run after the resume.
        assert_eq!(client.total_calls(), 3);
    }

    #[tokio::test]
    async fn cancel_discards_in_flight_results() {
        let client = MockGenerationClient::with_delay("", Duration::from_millis(50));
        script_success(&client, "g1").await;
        script_success(&client, "g2").await;
        let config = GenerationFlowConfig::new("wf", vec!["g1".to_string(), "g2".to_string()]);
        let mut harness = start(
            Arc::clone(&client),
            config,
            vec![Some(record("g1")), Some(record("g2"))],
        );

        harness.handle.begin();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(harness.handle.cancel().await);
        assert!(!harness.handle.cancel().await);

        wait_for_drained(&mut harness).await;
        let results = harness.handle.results().await;
        assert!(results.iter().all(|r| r.status == ItemStatus::Cancelled));
        assert!(results.iter().all(|r| r.article.is_none()));
    }

    #[tokio::test]
    async fn auto_recovery_requeues_exhausted_item() {
        let client = MockGenerationClient::new("");
        // First run of stage 1 exhausts the retry budget (3 attempts),
        // the recovery run succeeds.
        client
            .script(
                "g1:formatAnalysis",
                vec![
                    MockOutcome::Fail(GenerationError::Server("flaky".to_string())),
                    MockOutcome::Fail(GenerationError::Server("flaky".to_string())),
                    MockOutcome::Fail(GenerationError::Server("flaky".to_string())),
                    MockOutcome::Succeed(test_fixtures::rules_json()),
                ],
            )
            .await;
        client
            .script(
                "g1:contentGeneration",
                vec![MockOutcome::Succeed(test_fixtures::draft_json())],
            )
            .await;
        client
            .script(
                "g1:formatValidation",
                vec![MockOutcome::Succeed(test_fixtures::article_json())],
            )
            .await;
        let mut config = GenerationFlowConfig::new("wf", vec!["g1".to_string()]);
        config.recovery.enable_auto_recovery = true;
        config.recovery.max_recovery_attempts = 1;
        let mut harness = start(client, config, vec![Some(record("g1"))]);

        harness.handle.begin();
        wait_for_drained(&mut harness).await;

        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn manual_retry_respects_recovery_budget() {
        let client = MockGenerationClient::new("");
        client
            .script(
                "g1:formatAnalysis",
                vec![
                    MockOutcome::Fail(GenerationError::Server("down".to_string())),
                    MockOutcome::Fail(GenerationError::Server("down".to_string())),
                    MockOutcome::Fail(GenerationError::Server("down".to_string())),
                    MockOutcome::Succeed(test_fixtures::rules_json()),
                ],
            )
            .await;
        client
            .script(
                "g1:contentGeneration",
                vec![MockOutcome::Succeed(test_fixtures::draft_json())],
            )
            .await;
        client
            .script(
                "g1:formatValidation",
                vec![MockOutcome::Succeed(test_fixtures::article_json())],
            )
            .await;
        let mut config = GenerationFlowConfig::new("wf", vec!["g1".to_string()]);
        config.recovery.max_recovery_attempts = 1;
        let mut harness = start(client, config, vec![Some(record("g1"))]);

        harness.handle.begin();
        wait_for_drained(&mut harness).await;
        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Failed);

        assert_eq!(harness.handle.retry_failed().await, 1);
        wait_for_drained(&mut harness).await;
        let results = harness.handle.results().await;
        assert_eq!(results[0].status, ItemStatus::Completed);

        // Nothing is failed anymore, a second retry re-queues nothing.
        assert_eq!(harness.handle.retry_failed().await, 0);
    }
}
