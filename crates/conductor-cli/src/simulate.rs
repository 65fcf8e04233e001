//! Synthetic agents for `conductor simulate`.

use async_trait::async_trait;
use conductor_checkpoint::CheckpointStore;
use conductor_core::{ConductorError, ConductorResult, Payload};
use conductor_orchestrator::{
    estimate_units, BudgetZone, SessionBudgets, Task, TaskCategory, TaskHandler, TaskPriority,
};
use conductor_workflow::{DurableWorkflow, StepOptions};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// An agent that runs every task as a two-step durable workflow and fails
/// the `act` step at a fixed rate. `act` gets a single attempt; re-routing
/// is left to the scheduler.
pub struct SimulatedAgent {
    name: String,
    failure_rate: f64,
    store: Arc<dyn CheckpointStore>,
    budgets: Arc<SessionBudgets>,
    steps: StepOptions,
}

impl SimulatedAgent {
    pub fn new(
        name: impl Into<String>,
        failure_rate: f64,
        store: Arc<dyn CheckpointStore>,
        budgets: Arc<SessionBudgets>,
        steps: StepOptions,
    ) -> Self {
        Self {
            name: name.into(),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            store,
            budgets,
            steps,
        }
    }

    async fn gather(&self, input: Payload) -> ConductorResult<Payload> {
        let units = estimate_units(&serde_json::to_string(&input)?) * 500;
        if self.budgets.add(&self.name, units) == BudgetZone::Dumb {
            info!(agent = %self.name, "Compacting context");
            self.budgets.reset(&self.name);
        }
        jitter().await;
        let mut out = input;
        out.insert("units".into(), json!(units));
        Ok(out)
    }

    async fn act(&self, input: Payload) -> ConductorResult<Payload> {
        jitter().await;
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            return Err(ConductorError::Handler(format!("{} dropped the task", self.name)));
        }
        let mut out = Payload::new();
        out.insert("agent".into(), json!(self.name));
        out.insert("units".into(), input.get("units").cloned().unwrap_or(json!(0)));
        Ok(out)
    }
}

#[async_trait]
impl TaskHandler for SimulatedAgent {
    async fn handle(&self, task: &Task) -> ConductorResult<Payload> {
        // One workflow per routing attempt, so a re-routed task starts fresh.
        let workflow_id = format!("{}-{}", task.id, task.routing_history.len());
        let mut wf = DurableWorkflow::open(self.store.clone(), &workflow_id, &task.task_type)
            .await?
            .with_defaults(self.steps.clone());
        wf.set_steps_total(2).await?;

        let gathered = wf
            .step("gather", task.params.clone(), |input| self.gather(input))
            .await?;
        let output = wf
            .step_with("act", gathered, self.steps.clone().with_max_retries(1), |input| {
                self.act(input)
            })
            .await
            // Report the agent's failure to the scheduler so it can re-route.
            .map_err(|e| ConductorError::Handler(e.to_string()))?;
        wf.complete(output.clone()).await?;
        Ok(output)
    }
}

async fn jitter() {
    let ms = rand::thread_rng().gen_range(2..12);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// The `seq`-th synthetic task: categories round-robin, priorities spread,
/// every tenth one flagged for consensus.
pub fn synthetic_task(seq: usize) -> Task {
    const PRIORITIES: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Medium,
        TaskPriority::High,
        TaskPriority::Critical,
    ];
    let category = TaskCategory::ALL[seq % TaskCategory::ALL.len()];
    let priority = PRIORITIES[(seq * 7) % PRIORITIES.len()];
    let mut params = Payload::new();
    params.insert("seq".into(), json!(seq));
    let task = Task::new(format!("{category}_job"), category)
        .with_priority(priority)
        .with_params(params);
    if seq % 10 == 9 {
        task.requiring_approval()
    } else {
        task
    }
}
