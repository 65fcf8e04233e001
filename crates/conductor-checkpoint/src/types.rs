use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a durable workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet running.
    Pending,
    /// Running steps.
    InProgress,
    /// Suspended by the workflow itself.
    Paused,
    /// Suspended until an approval arrives.
    AwaitingApproval,
    /// Finished successfully.
    Completed,
    /// A step exhausted its retries or the workflow was failed explicitly.
    Failed,
    /// Stopped by a caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Name stored in the status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::AwaitingApproval => "awaiting_approval",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// No further steps may run once a workflow reaches one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Statuses picked up by crash recovery at process start.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::InProgress | WorkflowStatus::Paused | WorkflowStatus::AwaitingApproval
        )
    }

    /// Statuses that are suspended waiting for an external `resume`.
    pub fn is_suspended(&self) -> bool {
        matches!(self, WorkflowStatus::Paused | WorkflowStatus::AwaitingApproval)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "paused" => Ok(WorkflowStatus::Paused),
            "awaiting_approval" => Ok(WorkflowStatus::AwaitingApproval),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(ConductorError::Storage(format!(
                "Unknown workflow status '{other}'"
            ))),
        }
    }
}

/// Lifecycle of a single checkpointed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// An attempt is in flight.
    Running,
    /// Output is checkpointed.
    Completed,
    /// Out of attempts.
    Failed,
    /// Bypassed by the workflow.
    Skipped,
    /// Failed, waiting for the next attempt.
    Retrying,
}

impl StepStatus {
    /// Name stored in the status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one workflow, persisted under `workflow:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// Caller-chosen identifier.
    pub workflow_id: String,
    /// Free-form label used for listing.
    pub workflow_type: String,
    /// Current lifecycle state.
    pub status: WorkflowStatus,
    /// Last step that completed or failed.
    pub current_step: Option<String>,
    /// Steps with a checkpointed output.
    pub steps_completed: u32,
    /// Declared number of steps, `0` when unknown.
    pub steps_total: u32,
    /// Workflow-level state: pause reason, approval id, result.
    #[serde(default)]
    pub context: Payload,
    /// Last failure, if any.
    pub error: Option<String>,
    /// When the workflow was first opened.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// A fresh `Pending` record.
    pub fn new(workflow_id: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Pending,
            current_step: None,
            steps_completed: 0,
            steps_total: 0,
            context: Payload::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key of this record.
    pub fn key(&self) -> String {
        workflow_key(&self.workflow_id)
    }

    /// Move to `status`, stamping `updated_at`.
    pub fn transition(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Durable state of one step, persisted under `step:{workflowId}:{stepName}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    /// Owning workflow.
    pub workflow_id: String,
    /// Unique within the workflow.
    pub step_name: String,
    /// Current lifecycle state.
    pub status: StepStatus,
    /// Monotonic per workflow, reflects first-invocation order.
    pub sequence: u64,
    /// Attempts that failed or were interrupted so far.
    pub retry_count: u32,
    /// Attempt budget, the first attempt included.
    pub max_retries: u32,
    /// Input of the latest attempt.
    #[serde(default)]
    pub input: Payload,
    /// Present only once the step is `Completed`.
    pub output: Option<Payload>,
    /// Error of the latest failed attempt.
    pub error: Option<String>,
    /// First attempt start.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step completed or finally failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl StepCheckpoint {
    /// A `Pending` step with no attempts yet.
    pub fn new(
        workflow_id: impl Into<String>,
        step_name: impl Into<String>,
        sequence: u64,
        input: Payload,
        max_retries: u32,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Pending,
            sequence,
            retry_count: 0,
            max_retries,
            input,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Storage key of this record.
    pub fn key(&self) -> String {
        step_key(&self.workflow_id, &self.step_name)
    }

    /// Whether the output is checkpointed.
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Start an attempt.
    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = StepStatus::Running;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Record a failed attempt that will be retried.
    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Retrying;
        self.retry_count += 1;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Record the output.
    pub fn mark_completed(&mut self, output: Payload) {
        let now = Utc::now();
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record the final failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Key of a workflow record.
pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

/// Key of a step record.
pub fn step_key(workflow_id: &str, step_name: &str) -> String {
    format!("step:{workflow_id}:{step_name}")
}
