//! Checkpointed workflow execution.
//!
//! A [`DurableWorkflow`] wraps a caller-supplied workflow id. Every step result
//! is written to the [`CheckpointStore`] before the step returns, so a process
//! that crashes and reopens the same id skips the steps that already completed
//! and continues from the first one that did not.
//!
//! Delivery is at-least-once: a crash after a step's side effect but before its
//! `Completed` checkpoint re-runs the step on recovery. Handlers that call
//! non-idempotent services should pass [`DurableWorkflow::idempotency_key`] to
//! them.

use crate::retry::StepOptions;
use chrono::Utc;
use conductor_checkpoint::{
    CheckpointStore, StepCheckpoint, StepStatus, WorkflowCheckpoint, WorkflowStatus,
};
use conductor_core::{
    notify_detached, ApprovalChannel, ApprovalRequest, ApprovalStatus, ConductorError,
    ConductorResult, Notification, NotificationKind, Notifier, Payload,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) const PAUSE_REASON: &str = "pause_reason";
pub(crate) const APPROVAL_ID: &str = "approval_id";
pub(crate) const RESUMED_AT: &str = "resumed_at";
const RESULT: &str = "result";
const CANCEL_REASON: &str = "cancel_reason";

/// Leave a suspended state: drop the suspension keys and stamp `resumed_at`.
pub(crate) fn apply_resume(checkpoint: &mut WorkflowCheckpoint) -> ConductorResult<()> {
    if !checkpoint.status.is_suspended() {
        return Err(ConductorError::StateConflict(format!(
            "Workflow '{}' cannot resume from {}",
            checkpoint.workflow_id, checkpoint.status
        )));
    }
    checkpoint.context.remove(PAUSE_REASON);
    checkpoint.context.remove(APPROVAL_ID);
    checkpoint
        .context
        .insert(RESUMED_AT.into(), Value::String(Utc::now().to_rfc3339()));
    checkpoint.transition(WorkflowStatus::InProgress);
    Ok(())
}

/// Handle on one durable workflow instance.
///
/// Steps take `&mut self`, so they run strictly one after another.
pub struct DurableWorkflow {
    store: Arc<dyn CheckpointStore>,
    checkpoint: WorkflowCheckpoint,
    defaults: StepOptions,
    notifier: Option<Arc<dyn Notifier>>,
    resumed: bool,
}

impl DurableWorkflow {
    /// Load `workflow_id` from the store, or create it.
    ///
    /// A new workflow is persisted as `Pending` and then `InProgress`. An
    /// existing one keeps its status, except a `Pending` leftover from a crash
    /// during creation, which moves on to `InProgress`.
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        workflow_id: &str,
        workflow_type: &str,
    ) -> ConductorResult<Self> {
        let (checkpoint, resumed) = match store.get_workflow(workflow_id).await? {
            Some(mut existing) => {
                info!(
                    workflow_id = %workflow_id,
                    status = %existing.status,
                    step = existing.current_step.as_deref().unwrap_or("<none>"),
                    steps_completed = existing.steps_completed,
                    "Resuming workflow"
                );
                if existing.status == WorkflowStatus::Pending {
                    existing.transition(WorkflowStatus::InProgress);
                    store.save_workflow(&existing).await?;
                }
                (existing, true)
            }
            None => {
                let mut fresh = WorkflowCheckpoint::new(workflow_id, workflow_type);
                store.save_workflow(&fresh).await?;
                fresh.transition(WorkflowStatus::InProgress);
                store.save_workflow(&fresh).await?;
                info!(workflow_id = %workflow_id, workflow_type, "Started workflow");
                (fresh, false)
            }
        };

        Ok(Self {
            store,
            checkpoint,
            defaults: StepOptions::default(),
            notifier: None,
            resumed,
        })
    }

    /// Step options used by [`DurableWorkflow::step`].
    pub fn with_defaults(mut self, defaults: StepOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Escalation target for failed workflows and timed-out steps.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Id this handle was opened with.
    pub fn workflow_id(&self) -> &str {
        &self.checkpoint.workflow_id
    }

    /// Current workflow status.
    pub fn status(&self) -> WorkflowStatus {
        self.checkpoint.status
    }

    /// The in-memory copy of the persisted record.
    pub fn checkpoint(&self) -> &WorkflowCheckpoint {
        &self.checkpoint
    }

    /// Persisted workflow context.
    pub fn context(&self) -> &Payload {
        &self.checkpoint.context
    }

    /// Whether `open` found an existing checkpoint.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Stable key for de-duplicating a step's external side effects.
    pub fn idempotency_key(&self, step_name: &str) -> String {
        format!("{}:{}", self.checkpoint.workflow_id, step_name)
    }

    /// Declare how many steps the workflow has, for progress reporting.
    pub async fn set_steps_total(&mut self, total: u32) -> ConductorResult<()> {
        self.checkpoint.steps_total = total;
        self.persist().await
    }

    /// Fraction of declared steps completed, `0.0` when no total is set.
    pub fn progress(&self) -> f64 {
        if self.checkpoint.steps_total == 0 {
            return 0.0;
        }
        (self.checkpoint.steps_completed as f64 / self.checkpoint.steps_total as f64).min(1.0)
    }

    /// Run a step with the workflow's default [`StepOptions`].
    pub async fn step<F, Fut>(&mut self, name: &str, input: Payload, f: F) -> ConductorResult<Payload>
    where
        F: FnMut(Payload) -> Fut,
        Fut: Future<Output = ConductorResult<Payload>>,
    {
        let options = self.defaults.clone();
        self.step_with(name, input, options, f).await
    }

    /// Run a step, or return its cached output if it already completed.
    pub async fn step_with<F, Fut>(
        &mut self,
        name: &str,
        input: Payload,
        options: StepOptions,
        mut f: F,
    ) -> ConductorResult<Payload>
    where
        F: FnMut(Payload) -> Fut,
        Fut: Future<Output = ConductorResult<Payload>>,
    {
        if self.checkpoint.status != WorkflowStatus::InProgress {
            return Err(ConductorError::StateConflict(format!(
                "Workflow '{}' is {}, step '{name}' cannot run",
                self.checkpoint.workflow_id, self.checkpoint.status
            )));
        }

        let workflow_id = self.checkpoint.workflow_id.clone();
        let mut step = match self.store.get_step(&workflow_id, name).await? {
            Some(existing) if existing.is_completed() => {
                debug!(workflow_id = %workflow_id, step = name, "Step already completed, using checkpoint");
                return Ok(existing.output.unwrap_or_default());
            }
            Some(mut existing) => {
                if existing.status == StepStatus::Running {
                    // The process stopped mid-attempt; that attempt is spent.
                    existing.retry_count += 1;
                }
                existing.input = input.clone();
                existing.max_retries = options.max_retries;
                existing
            }
            None => {
                let sequence = self.next_sequence().await?;
                StepCheckpoint::new(&workflow_id, name, sequence, input.clone(), options.max_retries)
            }
        };

        // Attempts spent before a restart count against the budget.
        let attempts = options.attempts();
        let first = step.retry_count;
        if first >= attempts {
            let cause = ConductorError::Handler(
                step.error
                    .clone()
                    .unwrap_or_else(|| "interrupted before completing".into()),
            );
            return Err(self.fail_step(step, first, cause).await?);
        }
        if first > 0 {
            info!(
                workflow_id = %workflow_id,
                step = name,
                attempts_spent = first,
                max_retries = attempts,
                "Resuming step retries"
            );
        }

        for attempt in first..attempts {
            step.mark_running();
            self.store.save_step(&step).await?;

            let outcome = match tokio::time::timeout(options.timeout(), f(input.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ConductorError::Timeout(options.timeout())),
            };

            match outcome {
                Ok(output) => {
                    step.mark_completed(output.clone());
                    self.checkpoint.steps_completed += 1;
                    self.checkpoint.current_step = Some(name.to_string());
                    self.checkpoint.updated_at = Utc::now();
                    self.store.save_transition(&self.checkpoint, &step).await?;
                    info!(
                        workflow_id = %workflow_id,
                        step = name,
                        attempt = attempt + 1,
                        "Step completed"
                    );
                    return Ok(output);
                }
                Err(e) if e.is_permanent() || attempt + 1 >= attempts => {
                    return Err(self.fail_step(step, attempt + 1, e).await?);
                }
                Err(e) => {
                    step.mark_retrying(e.to_string());
                    self.store.save_step(&step).await?;
                    let delay = options.backoff_delay(attempt);
                    warn!(
                        workflow_id = %workflow_id,
                        step = name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(ConductorError::StateConflict(format!(
            "Step '{name}' of workflow '{workflow_id}' has no attempts left"
        )))
    }

    /// Record a step as failed and fail the workflow. Returns the error to
    /// hand back to the caller, or a storage error if persisting failed.
    async fn fail_step(
        &mut self,
        mut step: StepCheckpoint,
        attempts: u32,
        cause: ConductorError,
    ) -> ConductorResult<ConductorError> {
        let timed_out = matches!(cause, ConductorError::Timeout(_));
        let last_error = cause.to_string();
        step.mark_failed(&last_error);
        self.checkpoint.current_step = Some(step.step_name.clone());
        self.checkpoint.error = Some(last_error.clone());
        self.checkpoint.transition(WorkflowStatus::Failed);
        self.store.save_transition(&self.checkpoint, &step).await?;

        error!(
            workflow_id = %self.checkpoint.workflow_id,
            step = %step.step_name,
            attempts,
            error = %last_error,
            "Step exhausted retries, workflow failed"
        );

        let kind = if timed_out {
            NotificationKind::StepTimedOut
        } else {
            NotificationKind::WorkflowFailed
        };
        self.escalate(
            Notification::new(kind, &self.checkpoint.workflow_id, &last_error)
                .with_step(&step.step_name, attempts),
        );

        Ok(ConductorError::StepFailed {
            workflow_id: self.checkpoint.workflow_id.clone(),
            step: step.step_name,
            attempts,
            last_error,
        })
    }

    async fn next_sequence(&self) -> ConductorResult<u64> {
        let steps = self.store.list_steps(&self.checkpoint.workflow_id).await?;
        Ok(steps.iter().map(|s| s.sequence).max().unwrap_or(0) + 1)
    }

    /// Suspend until an external `resume`.
    pub async fn pause(&mut self, reason: &str) -> ConductorResult<()> {
        self.suspend(WorkflowStatus::Paused, PAUSE_REASON, reason)
            .await?;
        info!(workflow_id = %self.checkpoint.workflow_id, reason, "Workflow paused");
        Ok(())
    }

    /// Suspend until the approval identified by `approval_id` is decided.
    pub async fn await_approval(&mut self, approval_id: &str) -> ConductorResult<()> {
        self.suspend(WorkflowStatus::AwaitingApproval, APPROVAL_ID, approval_id)
            .await?;
        info!(workflow_id = %self.checkpoint.workflow_id, approval_id, "Workflow awaiting approval");
        Ok(())
    }

    async fn suspend(&mut self, status: WorkflowStatus, key: &str, value: &str) -> ConductorResult<()> {
        if self.checkpoint.status != WorkflowStatus::InProgress {
            return Err(ConductorError::StateConflict(format!(
                "Workflow '{}' cannot move from {} to {}",
                self.checkpoint.workflow_id, self.checkpoint.status, status
            )));
        }
        self.checkpoint
            .context
            .insert(key.to_string(), Value::String(value.to_string()));
        self.checkpoint.transition(status);
        self.persist().await
    }

    /// Leave `Paused` or `AwaitingApproval`.
    pub async fn resume(&mut self) -> ConductorResult<()> {
        apply_resume(&mut self.checkpoint)?;
        self.persist().await?;
        info!(workflow_id = %self.checkpoint.workflow_id, "Workflow resumed");
        Ok(())
    }

    /// Ask the approval collaborator before a risky action.
    ///
    /// `Approved` leaves the workflow running, `Rejected` fails it and
    /// `Pending` parks it in `AwaitingApproval`.
    pub async fn request_approval(
        &mut self,
        channel: &dyn ApprovalChannel,
        request: ApprovalRequest,
    ) -> ConductorResult<ApprovalStatus> {
        if self.checkpoint.status != WorkflowStatus::InProgress {
            return Err(ConductorError::StateConflict(format!(
                "Workflow '{}' is {}, cannot request approval",
                self.checkpoint.workflow_id, self.checkpoint.status
            )));
        }
        let action = request.action_type.clone();
        let status = channel.request_approval(request).await?;
        match &status {
            ApprovalStatus::Approved => {
                info!(workflow_id = %self.checkpoint.workflow_id, action = %action, "Action approved");
            }
            ApprovalStatus::Rejected { reason } => {
                let reason = reason.as_deref().unwrap_or("no reason given");
                self.fail(&format!("Approval for '{action}' rejected: {reason}"))
                    .await?;
            }
            ApprovalStatus::Pending { approval_id } => {
                self.await_approval(approval_id).await?;
            }
        }
        Ok(status)
    }

    /// Mark the workflow completed, storing `result` in its context.
    pub async fn complete(&mut self, result: Payload) -> ConductorResult<()> {
        if self.checkpoint.status != WorkflowStatus::InProgress {
            return Err(ConductorError::StateConflict(format!(
                "Workflow '{}' cannot complete from {}",
                self.checkpoint.workflow_id, self.checkpoint.status
            )));
        }
        self.checkpoint
            .context
            .insert(RESULT.into(), Value::Object(result));
        self.checkpoint.current_step = None;
        self.checkpoint.transition(WorkflowStatus::Completed);
        self.persist().await?;
        info!(
            workflow_id = %self.checkpoint.workflow_id,
            steps_completed = self.checkpoint.steps_completed,
            "Workflow completed"
        );
        Ok(())
    }

    /// Fail the workflow with an explicit error.
    pub async fn fail(&mut self, reason: &str) -> ConductorResult<()> {
        self.ensure_not_terminal("fail")?;
        self.checkpoint.error = Some(reason.to_string());
        self.checkpoint.transition(WorkflowStatus::Failed);
        self.persist().await?;
        error!(workflow_id = %self.checkpoint.workflow_id, error = reason, "Workflow failed");
        self.escalate(Notification::new(
            NotificationKind::WorkflowFailed,
            &self.checkpoint.workflow_id,
            reason,
        ));
        Ok(())
    }

    /// Stop the workflow, recording `reason` in its context.
    pub async fn cancel(&mut self, reason: &str) -> ConductorResult<()> {
        self.ensure_not_terminal("cancel")?;
        self.checkpoint
            .context
            .insert(CANCEL_REASON.into(), Value::String(reason.to_string()));
        self.checkpoint.transition(WorkflowStatus::Cancelled);
        self.persist().await?;
        info!(workflow_id = %self.checkpoint.workflow_id, reason, "Workflow cancelled");
        Ok(())
    }

    fn ensure_not_terminal(&self, action: &str) -> ConductorResult<()> {
        if self.checkpoint.status.is_terminal() {
            return Err(ConductorError::StateConflict(format!(
                "Workflow '{}' is already {}, cannot {action}",
                self.checkpoint.workflow_id, self.checkpoint.status
            )));
        }
        Ok(())
    }

    fn escalate(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notify_detached(Arc::clone(notifier), notification);
        }
    }

    async fn persist(&mut self) -> ConductorResult<()> {
        self.checkpoint.updated_at = Utc::now();
        self.store.save_workflow(&self.checkpoint).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_checkpoint::InMemoryCheckpointStore;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> Arc<dyn CheckpointStore> {
        Arc::new(InMemoryCheckpointStore::new())
    }

    fn fast() -> StepOptions {
        StepOptions::default()
            .with_timeout(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn open_creates_in_progress() {
        let store = store();
        let wf = DurableWorkflow::open(store.clone(), "wf-1", "demo").await.unwrap();
        assert_eq!(wf.status(), WorkflowStatus::InProgress);
        assert!(!wf.is_resumed());

        let again = DurableWorkflow::open(store, "wf-1", "demo").await.unwrap();
        assert!(again.is_resumed());
    }

    #[tokio::test]
    async fn sequence_follows_first_invocation() {
        let store = store();
        let mut wf = DurableWorkflow::open(store.clone(), "wf-1", "demo").await.unwrap();
        for name in ["a", "b", "c"] {
            wf.step(name, Payload::new(), |_| async { Ok(Payload::new()) })
                .await
                .unwrap();
        }
        let seqs: Vec<u64> = store
            .list_steps("wf-1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(wf.checkpoint().steps_completed, 3);
        assert_eq!(wf.checkpoint().current_step.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately() {
        let mut wf = DurableWorkflow::open(store(), "wf-1", "demo")
            .await
            .unwrap()
            .with_defaults(fast());
        let mut calls = 0;
        let err = wf
            .step("lookup", Payload::new(), |_| {
                calls += 1;
                async { Err(ConductorError::Permanent("lead was deleted".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        match err {
            ConductorError::StepFailed { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(wf.status(), WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn timeout_counts_as_attempt() {
        let store = store();
        let mut wf = DurableWorkflow::open(store.clone(), "wf-1", "demo")
            .await
            .unwrap();
        let opts = fast()
            .with_max_retries(2)
            .with_timeout(Duration::from_millis(20));
        let err = wf
            .step_with("slow", Payload::new(), opts, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Payload::new())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::StepFailed { attempts: 2, .. }));
        let step = store.get_step("wf-1", "slow").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.retry_count, 1);
    }

    #[tokio::test]
    async fn pause_and_resume_manage_context() {
        let mut wf = DurableWorkflow::open(store(), "wf-1", "demo").await.unwrap();
        wf.pause("waiting on data").await.unwrap();
        assert_eq!(wf.context()[PAUSE_REASON], json!("waiting on data"));

        let err = wf
            .step("x", Payload::new(), |_| async { Ok(Payload::new()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::StateConflict(_)));

        wf.resume().await.unwrap();
        assert_eq!(wf.status(), WorkflowStatus::InProgress);
        assert!(!wf.context().contains_key(PAUSE_REASON));
        assert!(wf.context().contains_key(RESUMED_AT));
        assert!(matches!(
            wf.resume().await.unwrap_err(),
            ConductorError::StateConflict(_)
        ));
    }

    #[tokio::test]
    async fn terminal_states_reject_transitions() {
        let mut wf = DurableWorkflow::open(store(), "wf-1", "demo").await.unwrap();
        wf.cancel("operator").await.unwrap();
        assert!(wf.fail("late").await.is_err());
        assert!(wf.complete(Payload::new()).await.is_err());
        assert!(wf.pause("late").await.is_err());
    }

    #[tokio::test]
    async fn progress_and_idempotency_key() {
        let mut wf = DurableWorkflow::open(store(), "wf-7", "demo").await.unwrap();
        wf.set_steps_total(4).await.unwrap();
        wf.step("one", Payload::new(), |_| async { Ok(Payload::new()) })
            .await
            .unwrap();
        assert!((wf.progress() - 0.25).abs() < f64::EPSILON);
        assert_eq!(wf.idempotency_key("send"), "wf-7:send");
    }
}
