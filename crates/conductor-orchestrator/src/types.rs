use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, Payload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Functional area a task belongs to. Each category has its own agent pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Finding and qualifying prospects.
    LeadGen,
    /// Deal and pipeline upkeep.
    Pipeline,
    /// Calendars and meetings.
    Scheduling,
    /// Lookups and summaries.
    Research,
    /// Sign-offs routed to approvers.
    Approval,
    /// Housekeeping.
    System,
}

impl TaskCategory {
    /// Every category, in declaration order.
    pub const ALL: [TaskCategory; 6] = [
        TaskCategory::LeadGen,
        TaskCategory::Pipeline,
        TaskCategory::Scheduling,
        TaskCategory::Research,
        TaskCategory::Approval,
        TaskCategory::System,
    ];

    /// Name used in config and state keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::LeadGen => "lead_gen",
            TaskCategory::Pipeline => "pipeline",
            TaskCategory::Scheduling => "scheduling",
            TaskCategory::Research => "research",
            TaskCategory::Approval => "approval",
            TaskCategory::System => "system",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConductorError::Config(format!("Unknown task category '{s}'")))
    }
}

/// Scheduling priority. Declaration order gives `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Ahead of routine work.
    High,
    /// Served before anything else.
    Critical,
}

impl TaskPriority {
    /// Multiplier applied to routing rewards.
    pub fn reward_weight(&self) -> f64 {
        match self {
            TaskPriority::Low => 0.8,
            TaskPriority::Medium => 1.0,
            TaskPriority::High => 1.25,
            TaskPriority::Critical => 1.5,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Status of a task. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, or held waiting for an agent.
    Pending,
    /// Dispatched to an agent; stays here while re-routed.
    Running,
    /// An agent returned a result.
    Completed,
    /// Out of attempts, or undeliverable.
    Failed,
    /// Vetoed by consensus or cancelled by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `Pending -> Running -> Completed | Failed | Cancelled`; a pending task
    /// may also be cancelled, or failed when it cannot be delivered.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

/// What happened to one routing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// Handed to the agent, result not known yet.
    Dispatched,
    /// The agent returned a result.
    Succeeded,
    /// The agent returned an error.
    Failed,
    /// The agent missed the deadline.
    TimedOut,
    /// Consensus vetoed the task.
    Rejected,
}

/// One routing decision in a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Agent the task was handed to.
    pub agent: String,
    /// 1-based.
    pub attempt: u32,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// How the attempt ended.
    pub outcome: RoutingOutcome,
    /// Handler latency, once known.
    pub latency_ms: Option<u64>,
    /// Error of a failed attempt.
    pub error: Option<String>,
}

/// A unit of work submitted to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned at construction.
    pub id: Uuid,
    /// Free-form label, e.g. `"enrich_lead"`.
    pub task_type: String,
    /// Selects the agent pool.
    pub category: TaskCategory,
    /// Queue ordering.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Agent of the latest routing decision.
    pub assigned_agent: Option<String>,
    /// Handler input.
    #[serde(default)]
    pub params: Payload,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Consensus must approve before dispatch.
    #[serde(default)]
    pub requires_approval: bool,
    /// Construction time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Every routing decision, oldest first.
    #[serde(default)]
    pub routing_history: Vec<RoutingEvent>,
    /// Handler output once completed.
    pub result: Option<Payload>,
    /// Reason for failure or cancellation.
    pub error: Option<String>,
}

impl Task {
    /// A pending, medium-priority task.
    pub fn new(task_type: impl Into<String>, category: TaskCategory) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            category,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            params: Payload::new(),
            retry_count: 0,
            requires_approval: false,
            created_at: now,
            updated_at: now,
            routing_history: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the handler input.
    pub fn with_params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    /// Flag the task as risk-sensitive: consensus must approve it first.
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Move to `next`, rejecting backward or sideways moves.
    pub fn transition(&mut self, next: TaskStatus) -> ConductorResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(ConductorError::StateConflict(format!(
                "Task {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a routing decision and assign the task to `agent`.
    pub fn record_routing(&mut self, agent: &str) -> u32 {
        let attempt = self.routing_history.len() as u32 + 1;
        self.routing_history.push(RoutingEvent {
            agent: agent.to_string(),
            attempt,
            timestamp: Utc::now(),
            outcome: RoutingOutcome::Dispatched,
            latency_ms: None,
            error: None,
        });
        self.assigned_agent = Some(agent.to_string());
        self.updated_at = Utc::now();
        attempt
    }

    /// Fill in the outcome of the most recent routing decision.
    pub fn close_routing(
        &mut self,
        outcome: RoutingOutcome,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) {
        if let Some(event) = self.routing_history.last_mut() {
            event.outcome = outcome;
            event.latency_ms = latency_ms;
            event.error = error;
        }
        self.updated_at = Utc::now();
    }

    /// Agents whose routing attempt on this task did not succeed.
    pub fn failed_agents(&self) -> Vec<&str> {
        self.routing_history
            .iter()
            .filter(|e| matches!(e.outcome, RoutingOutcome::Failed | RoutingOutcome::TimedOut))
            .map(|e| e.agent.as_str())
            .collect()
    }
}

/// Health of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Taking work normally.
    Healthy,
    /// Taking work, but failing lately.
    Degraded,
    /// Failing too often to take work.
    Unhealthy,
    /// Missed too many heartbeats.
    Offline,
    /// Heartbeating again; one more beat makes it healthy.
    Recovering,
}

impl AgentStatus {
    /// Whether the router may hand new work to an agent in this status.
    pub fn is_eligible(&self) -> bool {
        matches!(self, AgentStatus::Healthy | AgentStatus::Degraded)
    }
}

/// Snapshot of one agent's health and load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent name.
    pub name: String,
    /// Current health.
    pub status: AgentStatus,
    /// Failures since the last success or heartbeat.
    pub consecutive_failures: u32,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// Number of tasks currently executing on this agent.
    pub active_tasks: u32,
    /// Tasks completed over the agent lifetime.
    pub total_successes: u64,
    /// Tasks failed over the agent lifetime.
    pub total_failures: u64,
}

impl AgentState {
    /// A healthy agent with no history.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::Healthy,
            consecutive_failures: 0,
            last_heartbeat: Utc::now(),
            active_tasks: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    /// Share of finished tasks that failed, `0.0` before any result.
    pub fn error_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            0.0
        } else {
            self.total_failures as f64 / total as f64
        }
    }
}

/// Load reported by an agent alongside its heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// Tasks the agent reports as running.
    pub active_tasks: u32,
}

/// An eligible agent offered to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    /// Agent name.
    pub name: String,
    /// Tasks currently running on it.
    pub load: u32,
}

impl Candidate {
    /// A candidate with the given load.
    pub fn new(name: impl Into<String>, load: u32) -> Self {
        Self {
            name: name.into(),
            load,
        }
    }
}
