use log::error;
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::generation::GenerationUsage;
use crate::models::{
    ArticleContent, FlowErrorInfo, GameRecord, ItemResult, ItemSnapshot, ItemStatus, StageState,
    StageStatus,
};
use crate::pipeline::stage::{StageKind, StageOutput, StagePartials};

/// Owns the lifecycle of one work item (one game record) as it moves
/// through the pipeline. All mutation goes through transition operations;
/// invalid transitions are reported as internal errors, never swallowed.
#[derive(Debug, Clone)]
pub struct ItemStateMachine {
    item_id: String,
    record: Option<GameRecord>,
    status: ItemStatus,
    current_stage: Option<StageKind>,
    stages: HashMap<StageKind, StageState>,
    partials: StagePartials,
    article: Option<ArticleContent>,
    error: Option<EngineError>,
    tokens_sent: u64,
    tokens_received: u64,
}

impl ItemStateMachine {
    pub fn new(item_id: String, record: Option<GameRecord>) -> Self {
        let stages = StageKind::all()
            .into_iter()
            .map(|stage| (stage, StageState::default()))
            .collect();
        Self {
            item_id,
            record,
            status: ItemStatus::Pending,
            current_stage: None,
            stages,
            partials: StagePartials::default(),
            article: None,
            error: None,
            tokens_sent: 0,
            tokens_received: 0,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn record(&self) -> Option<&GameRecord> {
        self.record.as_ref()
    }

    pub fn partials(&self) -> &StagePartials {
        &self.partials
    }

    /// First stage that has not yet completed. `None` once all three are
    /// done. Used both for normal dispatch and for recovery re-queues.
    pub fn next_incomplete_stage(&self) -> Option<StageKind> {
        StageKind::all().into_iter().find(|stage| {
            self.stages
                .get(stage)
                .map(|s| s.status != StageStatus::Completed)
                .unwrap_or(true)
        })
    }

    fn invalid(&self, transition: &str) -> EngineError {
        let err = EngineError::InternalScheduling(format!(
            "Invalid transition '{}' for item {} in status {:?}",
            transition, self.item_id, self.status
        ));
        error!("{}", err);
        err
    }

    /// Scheduler dispatches the item's next stage.
    pub fn dispatch(&mut self, stage: StageKind) -> EngineResult<()> {
        let valid_status = matches!(self.status, ItemStatus::Pending | ItemStatus::Running);
        if !valid_status || Some(stage) != self.next_incomplete_stage() {
            return Err(self.invalid(&format!("dispatch {}", stage)));
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.status = ItemStatus::Running;
        self.current_stage = Some(stage);
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Running;
            state.started_at = Some(now);
            state.error = None;
        }
        Ok(())
    }

    /// Stage success. Stores the stage output (feeding later stages) and
    /// returns the next stage to queue, or `None` when the item completed.
    pub fn complete_stage(
        &mut self,
        stage: StageKind,
        output: StageOutput,
        usage: &GenerationUsage,
        attempts: u32,
    ) -> EngineResult<Option<StageKind>> {
        if self.status != ItemStatus::Running || self.current_stage != Some(stage) {
            return Err(self.invalid(&format!("complete {}", stage)));
        }
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Completed;
            state.completed_at = Some(now);
            state.attempts = attempts;
        }
        self.tokens_sent += usage.prompt_tokens;
        self.tokens_received += usage.completion_tokens;

        match output {
            StageOutput::Rules(rules) => self.partials.format_rules = Some(rules),
            StageOutput::Draft(draft) => self.partials.draft = Some(draft),
            StageOutput::Article(article) => self.article = Some(article),
        }

        match stage.next() {
            Some(next) => {
                self.current_stage = Some(next);
                Ok(Some(next))
            }
            None => {
                self.status = ItemStatus::Completed;
                self.current_stage = None;
                Ok(None)
            }
        }
    }

    /// Terminal stage failure (retry budget exhausted or fatal error).
    pub fn fail_stage(
        &mut self,
        stage: StageKind,
        error: EngineError,
        attempts: u32,
    ) -> EngineResult<()> {
        if self.status != ItemStatus::Running || self.current_stage != Some(stage) {
            return Err(self.invalid(&format!("fail {}", stage)));
        }
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Failed;
            state.completed_at = Some(now);
            state.attempts = attempts;
            state.error = Some(error.to_string());
        }
        self.status = ItemStatus::Failed;
        self.error = Some(error);
        Ok(())
    }

    /// Fail the item without a stage attempt, e.g. a missing record or a
    /// flow-level timeout. No-op on terminal items.
    pub fn fail_item(&mut self, error: EngineError) {
        if self.status.is_terminal() {
            return;
        }
        if let Some(stage) = self.current_stage {
            if let Some(state) = self.stages.get_mut(&stage) {
                if state.status == StageStatus::Running {
                    state.status = StageStatus::Failed;
                    state.completed_at = Some(chrono::Utc::now().timestamp_millis());
                    state.error = Some(error.to_string());
                }
            }
        }
        self.status = ItemStatus::Failed;
        self.error = Some(error);
    }

    /// Flow-level pause parks the item once no stage is in flight.
    pub fn park(&mut self) -> EngineResult<()> {
        match self.status {
            ItemStatus::Pending | ItemStatus::Running => {
                self.status = ItemStatus::Paused;
                Ok(())
            }
            _ => Err(self.invalid("park")),
        }
    }

    /// Flow resume: the item re-enters the ready queue. Items that never
    /// started a stage go back to `pending`, others to `running`.
    pub fn unpark(&mut self) -> EngineResult<()> {
        if self.status != ItemStatus::Paused {
            return Err(self.invalid("unpark"));
        }
        let any_started = self
            .stages
            .values()
            .any(|state| state.status != StageStatus::Pending);
        self.status = if any_started {
            ItemStatus::Running
        } else {
            ItemStatus::Pending
        };
        Ok(())
    }

    /// Flow cancel. Returns true if the item changed state; cancelling an
    /// already-terminal item is a no-op.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ItemStatus::Cancelled;
        self.current_stage = None;
        true
    }

    /// Recovery re-queue: a failed item goes back to `running` at its last
    /// incomplete stage, keeping completed stage outputs.
    pub fn requeue_for_recovery(&mut self) -> EngineResult<StageKind> {
        if self.status != ItemStatus::Failed {
            return Err(self.invalid("requeueForRecovery"));
        }
        let stage = self.next_incomplete_stage().ok_or_else(|| {
            EngineError::InternalScheduling(format!(
                "Failed item {} has no incomplete stage",
                self.item_id
            ))
        })?;
        if let Some(state) = self.stages.get_mut(&stage) {
            state.status = StageStatus::Pending;
            state.error = None;
        }
        self.status = ItemStatus::Running;
        self.current_stage = Some(stage);
        self.error = None;
        Ok(stage)
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            item_id: self.item_id.clone(),
            status: self.status,
            current_stage: self.current_stage.map(|s| s.as_str().to_string()),
            stages: self
                .stages
                .iter()
                .map(|(stage, state)| (stage.as_str().to_string(), state.clone()))
                .collect(),
            error: self.error.as_ref().map(FlowErrorInfo::from),
        }
    }

    pub fn result(&self) -> ItemResult {
        ItemResult {
            item_id: self.item_id.clone(),
            status: self.status,
            article: self.article.clone(),
            error: self.error.as_ref().map(FlowErrorInfo::from),
            tokens_sent: self.tokens_sent,
            tokens_received: self.tokens_received,
        }
    }
}
