//! Run engine
//!
//! Drives one run through the stage graph: persist-then-dispatch for every
//! transition, snapshot after every stage, bounded retries with backoff,
//! suspension at human validation, cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, eyre};
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterSet, BoardApi};
use crate::config::Config;
use crate::domain::{
    QueueStatus, Run, RunContext, RunStatus, StageExecution, StageName, Task, TaskStatus,
    ValidationRequest,
};
use crate::queue::{DispatchMessage, QueueManager};
use crate::signature::sign_comment;
use crate::state::StateManager;
use crate::validation::{AbandonKind, ValidationCoordinator, ValidationOutcome, message};

use super::graph::{self, GraphLimits, Next};
use super::slots::{RunScheduler, RunSlot};

/// Attempts per stage on retryable failure, beyond the first call
const MAX_STAGE_RETRIES: u32 = 2;

/// Exponential backoff with jitter for stage retries
fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = base_secs.saturating_mul(1u64 << attempt.min(6));
    let capped = exp.min(cap_secs);
    let jitter_ms: u64 = {
        use rand::Rng;
        rand::rng().random_range(0..1000)
    };
    Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
}

enum Step {
    Stage(StageName),
    Validate,
    Done,
}

/// The run engine
pub struct RunEngine {
    state: StateManager,
    queue: Arc<QueueManager>,
    adapters: Arc<AdapterSet>,
    coordinator: Arc<ValidationCoordinator>,
    board: Arc<dyn BoardApi>,
    slots: Arc<RunScheduler>,
    config: Config,
}

impl RunEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        queue: Arc<QueueManager>,
        adapters: Arc<AdapterSet>,
        coordinator: Arc<ValidationCoordinator>,
        board: Arc<dyn BoardApi>,
        slots: Arc<RunScheduler>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            queue,
            adapters,
            coordinator,
            board,
            slots,
            config,
        })
    }

    fn limits(&self) -> GraphLimits {
        GraphLimits {
            max_debug_attempts: self.config.orchestrator.max_debug_attempts,
        }
    }

    /// Execute one dispatched workflow to a terminal state
    pub async fn execute(self: &Arc<Self>, dispatch: DispatchMessage) -> Result<()> {
        let entry = self
            .state
            .get_queue_entry(&dispatch.queue_id)
            .await
            .map_err(|e| eyre!("Queue entry lookup failed: {}", e))?
            .ok_or_else(|| eyre!("Queue entry not found: {}", dispatch.queue_id))?;

        if entry.is_terminal() {
            debug!(queue_id = %entry.id, "Entry already terminal, nothing to do");
            return Ok(());
        }

        let task_id = entry
            .task_id
            .clone()
            .ok_or_else(|| eyre!("Queue entry {} has no task", entry.id))?;
        let mut task = self
            .state
            .get_task_required(&task_id)
            .await
            .map_err(|e| eyre!("{}", e))?;

        // Reactivations arrive with a pre-created run; fresh tasks get one here
        let run = match &entry.run_id {
            Some(run_id) => self.state.get_run_required(run_id).await.map_err(|e| eyre!("{}", e))?,
            None => {
                let run = Run::new(&task.id);
                self.state
                    .create_run(run.clone())
                    .await
                    .map_err(|e| eyre!("Failed to create run: {}", e))?;
                let mut updated = entry.clone();
                updated.run_id = Some(run.id.clone());
                self.state
                    .upsert_queue_entry(updated)
                    .await
                    .map_err(|e| eyre!("Failed to attach run to entry: {}", e))?;
                run
            }
        };

        if run.is_terminal() {
            debug!(run_id = %run.id, "Run already terminal, releasing entry");
            self.queue
                .finish(entry.external_item_id, &entry.id, QueueStatus::Completed, None)
                .await;
            return Ok(());
        }

        let mut slot = Some(self.slots.acquire(&run.id).await);
        self.queue
            .mark_running(entry.external_item_id, &entry.id, &dispatch.queue_id)
            .await;

        self.set_run_status(&run.id, RunStatus::Running, None).await?;
        task.set_status(TaskStatus::InProgress);
        task.set_last_run(&run.id);
        self.persist_task(&mut task).await?;
        self.set_board_status(&mut task, self.config.board.status_working.clone()).await;

        // Resume from the last successful snapshot, or start fresh
        let (mut ctx, mut ordinal, mut step) = self.resume_point(&task, &run).await?;

        let mut parent_request: Option<ValidationRequest> = None;
        info!(run_id = %run.id, item_id = task.external_item_id, "Run started");

        loop {
            // Cancellation is cooperative: checked between stages
            let fresh = self.state.get_run_required(&run.id).await.map_err(|e| eyre!("{}", e))?;
            if fresh.cancel_requested {
                info!(run_id = %run.id, "Cancel requested, abandoning run");
                self.finish_abandoned(&entry, &mut task, &run.id, "cancelled by request").await?;
                return Ok(());
            }

            match step {
                Step::Stage(stage) => {
                    match self.run_stage(&run.id, stage, &mut ctx, &mut ordinal).await {
                        Ok(()) => {
                            step = match graph::next_stage(stage, &ctx, &self.limits()) {
                                Next::Stage(next) => Step::Stage(next),
                                Next::AwaitValidation => Step::Validate,
                                Next::Complete => {
                                    self.finish_success(&entry, &mut task, &run.id, &ctx).await?;
                                    Step::Done
                                }
                            };
                        }
                        Err(e) => {
                            self.finish_failure(&entry, &mut task, &run.id, stage, &e.to_string()).await?;
                            return Ok(());
                        }
                    }
                }
                Step::Validate => {
                    step = self
                        .handle_validation(&entry, &mut task, &run.id, &mut ctx, &mut ordinal, &mut slot, &mut parent_request)
                        .await?;
                }
                Step::Done => break,
            }
        }

        Ok(())
    }

    /// Load the latest successful snapshot and compute where to re-enter
    async fn resume_point(&self, task: &Task, run: &Run) -> Result<(RunContext, u32, Step)> {
        if let Ok(Some(snapshot)) = self.state.latest_snapshot(&run.id).await
            && let Some(ctx) = RunContext::from_snapshot(&snapshot.output)
        {
            // Effects of the snapshotted stage are durable; re-enter at its
            // successor (validation is re-requested, never replayed)
            let step = match graph::next_stage(snapshot.stage, &ctx, &self.limits()) {
                Next::Stage(stage) => Step::Stage(stage),
                Next::AwaitValidation => Step::Validate,
                Next::Complete => Step::Done,
            };
            info!(
                run_id = %run.id,
                resumed_after = %snapshot.stage,
                ordinal = snapshot.ordinal,
                "Resuming run from snapshot"
            );
            return Ok((ctx, snapshot.ordinal + 1, step));
        }

        Ok((
            RunContext::from_task_run(task, run),
            1,
            Step::Stage(graph::initial_stage()),
        ))
    }

    /// Invoke one stage with persistence, timeout, and bounded retries
    async fn run_stage(
        &self,
        run_id: &str,
        stage: StageName,
        ctx: &mut RunContext,
        ordinal: &mut u32,
    ) -> Result<()> {
        let adapter = self
            .adapters
            .get(stage)
            .ok_or_else(|| eyre!("No adapter registered for stage {}", stage))?;
        let budget = adapter.timeout().min(self.config.orchestrator.stage_timeout());

        let mut attempt = 0u32;
        loop {
            let mut exec = StageExecution::started(run_id, stage, *ordinal, ctx.snapshot());
            *ordinal += 1;
            self.state
                .create_stage(exec.clone())
                .await
                .map_err(|e| eyre!("Failed to persist stage start: {}", e))?;

            let result = tokio::time::timeout(budget, adapter.invoke(ctx)).await;
            match result {
                Ok(Ok(output)) => {
                    output.apply_to(ctx);
                    exec.succeed(ctx.snapshot());
                    self.state
                        .update_stage(exec)
                        .await
                        .map_err(|e| eyre!("Failed to persist stage result: {}", e))?;
                    debug!(run_id, stage = %stage, "Stage succeeded");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    exec.fail(e.to_string());
                    self.state
                        .update_stage(exec)
                        .await
                        .map_err(|pe| eyre!("Failed to persist stage failure: {}", pe))?;

                    if e.is_retryable() && attempt < MAX_STAGE_RETRIES {
                        let delay = backoff_delay(
                            attempt,
                            self.config.orchestrator.retry_backoff_base_secs,
                            self.config.orchestrator.retry_backoff_cap_secs,
                        );
                        warn!(run_id, stage = %stage, attempt, ?delay, error = %e, "Stage failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(eyre!("Stage {} failed: {}", stage, e));
                }
                Err(_) => {
                    exec.fail(format!("Timed out after {:?}", budget));
                    self.state
                        .update_stage(exec)
                        .await
                        .map_err(|pe| eyre!("Failed to persist stage timeout: {}", pe))?;

                    if attempt < MAX_STAGE_RETRIES {
                        let delay = backoff_delay(
                            attempt,
                            self.config.orchestrator.retry_backoff_base_secs,
                            self.config.orchestrator.retry_backoff_cap_secs,
                        );
                        warn!(run_id, stage = %stage, attempt, "Stage timed out, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(eyre!("Stage {} timed out after {:?}", stage, budget));
                }
            }
        }
    }

    /// Suspend at human validation and act on the verdict
    #[allow(clippy::too_many_arguments)]
    async fn handle_validation(
        &self,
        entry: &crate::domain::QueueEntry,
        task: &mut Task,
        run_id: &str,
        ctx: &mut RunContext,
        ordinal: &mut u32,
        slot: &mut Option<RunSlot>,
        parent_request: &mut Option<ValidationRequest>,
    ) -> Result<Step> {
        let mut exec = StageExecution::started(run_id, StageName::HumanValidation, *ordinal, ctx.snapshot());
        *ordinal += 1;
        self.state
            .create_stage(exec.clone())
            .await
            .map_err(|e| eyre!("Failed to persist validation stage: {}", e))?;

        // Free the per-item slot and the global slot; the run holds no
        // worker while a human decides
        self.queue.mark_waiting_validation(entry.external_item_id, &entry.id).await;
        self.set_run_status(run_id, RunStatus::WaitingValidation, None).await?;
        task.set_status(TaskStatus::WaitingValidation);
        self.persist_task(task).await?;
        slot.take();

        let posted = match self.coordinator.request_validation(ctx, task, parent_request.as_ref()).await {
            Ok(posted) => posted,
            Err(e) => {
                exec.fail(e.to_string());
                let _ = self.state.update_stage(exec).await;
                self.finish_failure(entry, task, run_id, StageName::HumanValidation, &e.to_string()).await?;
                return Ok(Step::Done);
            }
        };
        let mut request = posted.request;

        let outcome = if posted.permissions_failure {
            if ctx.pr.is_some() {
                // The work itself succeeded; only the prompt could not be
                // posted - let the flow proceed to merge
                self.coordinator
                    .auto_approve(&mut request, "validation prompt rejected by board permissions")
                    .await?
            } else {
                exec.fail("validation prompt rejected and no pull request to fall back on");
                let _ = self.state.update_stage(exec).await;
                self.finish_failure(
                    entry,
                    task,
                    run_id,
                    StageName::HumanValidation,
                    "board permissions rejected the validation prompt",
                )
                .await?;
                return Ok(Step::Done);
            }
        } else {
            self.coordinator
                .await_response(&mut request, task, self.config.orchestrator.validation_timeout())
                .await?
        };

        *parent_request = Some(request.clone());
        self.publish_validation_event(run_id, &request, &outcome).await;

        match outcome {
            ValidationOutcome::Approved | ValidationOutcome::AutoApproved { .. } => {
                exec.succeed(ctx.snapshot());
                self.state.update_stage(exec).await.map_err(|e| eyre!("{}", e))?;
                self.reclaim(entry, task, run_id, slot).await?;
                Ok(Step::Stage(StageName::Merge))
            }
            ValidationOutcome::Rejected {
                instructions,
                rejection_count,
            } => {
                if let Some(instructions) = instructions {
                    ctx.add_modification_instructions(instructions);
                }
                ctx.rejection_count = rejection_count;
                // Not a successful snapshot: a crash here must resume by
                // re-requesting validation, never by merging
                exec.skip("rejected, re-entering implementation");
                self.state.update_stage(exec).await.map_err(|e| eyre!("{}", e))?;

                info!(run_id, rejection_count, "Rejected with instructions, re-entering implementation");
                self.reclaim(entry, task, run_id, slot).await?;
                Ok(Step::Stage(graph::rejection_reentry()))
            }
            ValidationOutcome::Abandoned { kind } => {
                exec.succeed(ctx.snapshot());
                self.state.update_stage(exec).await.map_err(|e| eyre!("{}", e))?;

                let reason = match kind {
                    AbandonKind::Explicit => "abandon requested by the reviewer".to_string(),
                    AbandonKind::RejectionLimit => {
                        message::rejection_limit_reason(&task.user_language, self.config.orchestrator.max_rejections)
                    }
                };
                self.finish_abandoned(entry, task, run_id, &reason).await?;
                Ok(Step::Done)
            }
            ValidationOutcome::Expired => {
                exec.fail("validation expired");
                let _ = self.state.update_stage(exec).await;

                let minutes = self.config.orchestrator.validation_timeout_secs / 60;
                self.post_comment(task, &message::timeout_comment(&task.user_language, minutes)).await;
                self.set_run_status(run_id, RunStatus::Failed, Some("validation expired".into())).await?;
                task.set_status(TaskStatus::Failed);
                self.persist_task(task).await?;
                self.set_board_status(task, self.config.board.status_failed.clone()).await;
                self.queue
                    .finish(
                        entry.external_item_id,
                        &entry.id,
                        QueueStatus::Failed,
                        Some("validation expired".into()),
                    )
                    .await;
                Ok(Step::Done)
            }
        }
    }

    /// Re-take the per-item slot and a global slot after validation
    async fn reclaim(
        &self,
        entry: &crate::domain::QueueEntry,
        task: &mut Task,
        run_id: &str,
        slot: &mut Option<RunSlot>,
    ) -> Result<()> {
        *slot = Some(self.slots.acquire(run_id).await);
        while !self.queue.resume_running(entry.external_item_id, &entry.id).await {
            debug!(run_id, "Waiting for the per-item slot to resume");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.set_run_status(run_id, RunStatus::Running, None).await?;
        task.set_status(TaskStatus::InProgress);
        self.persist_task(task).await?;
        Ok(())
    }

    async fn finish_success(
        &self,
        entry: &crate::domain::QueueEntry,
        task: &mut Task,
        run_id: &str,
        ctx: &RunContext,
    ) -> Result<()> {
        let pr_url = ctx.pr.as_ref().map(|pr| pr.url.clone()).unwrap_or_default();

        let mut run = self.state.get_run_required(run_id).await.map_err(|e| eyre!("{}", e))?;
        run.last_merged_pr_url = Some(pr_url.clone());
        run.set_status(RunStatus::Completed);
        self.state.update_run(run).await.map_err(|e| eyre!("{}", e))?;

        task.set_status(TaskStatus::Completed);
        self.persist_task(task).await?;
        self.set_board_status(task, self.config.board.status_done.clone()).await;
        self.post_comment(task, &message::merged_comment(&task.user_language, &pr_url)).await;

        self.queue
            .finish(entry.external_item_id, &entry.id, QueueStatus::Completed, None)
            .await;
        info!(run_id, item_id = task.external_item_id, "Run completed, pull request merged");
        Ok(())
    }

    async fn finish_failure(
        &self,
        entry: &crate::domain::QueueEntry,
        task: &mut Task,
        run_id: &str,
        stage: StageName,
        reason: &str,
    ) -> Result<()> {
        error!(run_id, stage = %stage, reason, "Run failed");

        self.set_run_status(run_id, RunStatus::Failed, Some(reason.to_string())).await?;
        task.set_status(TaskStatus::Failed);
        self.persist_task(task).await?;
        self.set_board_status(task, self.config.board.status_failed.clone()).await;
        self.post_comment(
            task,
            &message::failure_comment(&task.user_language, &stage.to_string(), reason),
        )
        .await;

        self.queue
            .finish(
                entry.external_item_id,
                &entry.id,
                QueueStatus::Failed,
                Some(reason.to_string()),
            )
            .await;
        Ok(())
    }

    /// Abandonment leaves the task failed, which keeps it
    /// reactivation-eligible
    async fn finish_abandoned(
        &self,
        entry: &crate::domain::QueueEntry,
        task: &mut Task,
        run_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.set_run_status(run_id, RunStatus::Abandoned, Some(reason.to_string())).await?;
        task.set_status(TaskStatus::Failed);
        self.persist_task(task).await?;
        self.set_board_status(task, self.config.board.status_failed.clone()).await;
        self.post_comment(task, &message::abandoned_comment(&task.user_language, reason)).await;

        self.queue
            .finish(
                entry.external_item_id,
                &entry.id,
                QueueStatus::Cancelled,
                Some(reason.to_string()),
            )
            .await;
        info!(run_id, reason, "Run abandoned");
        Ok(())
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus, error: Option<String>) -> Result<()> {
        let mut run = self.state.get_run_required(run_id).await.map_err(|e| eyre!("{}", e))?;
        if let Some(error) = error {
            run.set_error(error);
        }
        run.set_status(status);
        self.state.update_run(run).await.map_err(|e| eyre!("{}", e))?;
        Ok(())
    }

    async fn persist_task(&self, task: &mut Task) -> Result<()> {
        self.state
            .update_task(task.clone())
            .await
            .map_err(|e| eyre!("Failed to persist task: {}", e))?;
        Ok(())
    }

    /// Comment failures never fail the run; they are logged and the
    /// durable state remains the source of truth
    async fn post_comment(&self, task: &Task, body: &str) {
        if let Err(e) = self
            .board
            .post_update(task.external_item_id, &sign_comment(body))
            .await
        {
            warn!(item_id = task.external_item_id, error = %e, "Failed to post board comment");
        }
    }

    async fn set_board_status(&self, task: &mut Task, label: String) {
        match self.board.set_status_column(task.external_item_id, &label).await {
            Ok(()) => {
                task.set_board_status(&label);
                let _ = self.state.update_task(task.clone()).await;
            }
            Err(e) => {
                warn!(item_id = task.external_item_id, error = %e, "Failed to update board status column");
            }
        }
    }

    async fn publish_validation_event(
        &self,
        run_id: &str,
        request: &ValidationRequest,
        outcome: &ValidationOutcome,
    ) {
        let verdict = match outcome {
            ValidationOutcome::Approved => "approved",
            ValidationOutcome::AutoApproved { .. } => "auto_approved",
            ValidationOutcome::Rejected { .. } => "rejected",
            ValidationOutcome::Abandoned { .. } => "abandoned",
            ValidationOutcome::Expired => "expired",
        };
        self.queue
            .broker()
            .publish(
                crate::broker::VALIDATIONS,
                crate::broker::BrokerMessage::new(
                    serde_json::json!({
                        "run_id": run_id,
                        "validation_id": request.id,
                        "verdict": verdict,
                    }),
                    5,
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = 5;
        let cap = 60;

        let first = backoff_delay(0, base, cap);
        assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(6));

        let second = backoff_delay(1, base, cap);
        assert!(second >= Duration::from_secs(10) && second < Duration::from_secs(11));

        // Far attempts are capped
        let far = backoff_delay(10, base, cap);
        assert!(far >= Duration::from_secs(60) && far < Duration::from_secs(61));
    }
}
