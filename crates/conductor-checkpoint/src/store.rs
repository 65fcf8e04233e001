use crate::types::{StepCheckpoint, WorkflowCheckpoint};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence boundary for workflow and step checkpoints.
///
/// Writes are upserts keyed by `workflow:{id}` and `step:{workflowId}:{stepName}`.
/// A step that is already `Completed` keeps its output: overwriting it with
/// different content is a [`ConductorError::StateConflict`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert a workflow record.
    async fn save_workflow(&self, workflow: &WorkflowCheckpoint) -> ConductorResult<()>;
    /// Load a workflow record.
    async fn get_workflow(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowCheckpoint>>;
    /// Upsert a step record keyed by workflow and step name.
    async fn save_step(&self, step: &StepCheckpoint) -> ConductorResult<()>;
    /// Load one step record.
    async fn get_step(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> ConductorResult<Option<StepCheckpoint>>;
    /// Steps of a workflow ordered by `sequence`.
    async fn list_steps(&self, workflow_id: &str) -> ConductorResult<Vec<StepCheckpoint>>;
    /// Workflows that crash recovery should pick up.
    async fn list_in_progress(&self) -> ConductorResult<Vec<WorkflowCheckpoint>>;
    /// Every stored workflow, oldest first.
    async fn list_workflows(&self) -> ConductorResult<Vec<WorkflowCheckpoint>>;
    /// Remove a workflow and all of its steps. Returns whether it existed.
    async fn delete_workflow(&self, workflow_id: &str) -> ConductorResult<bool>;

    /// Persist a step and its owning workflow together.
    ///
    /// Backends with transactions override this to make the pair atomic.
    async fn save_transition(
        &self,
        workflow: &WorkflowCheckpoint,
        step: &StepCheckpoint,
    ) -> ConductorResult<()> {
        self.save_step(step).await?;
        self.save_workflow(workflow).await
    }
}

/// Reject rewriting a completed step with different content.
pub(crate) fn check_completed_immutable(
    existing: Option<&StepCheckpoint>,
    incoming: &StepCheckpoint,
) -> ConductorResult<()> {
    match existing {
        Some(prev) if prev.is_completed() && prev != incoming => {
            Err(ConductorError::StateConflict(format!(
                "Step '{}' of workflow '{}' is already completed",
                incoming.step_name, incoming.workflow_id
            )))
        }
        _ => Ok(()),
    }
}

pub(crate) fn sort_workflows(workflows: &mut [WorkflowCheckpoint]) {
    workflows.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.workflow_id.cmp(&b.workflow_id))
    });
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, WorkflowCheckpoint>,
    /// workflow id -> step name -> checkpoint
    steps: HashMap<String, HashMap<String, StepCheckpoint>>,
}

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<Inner>,
}

impl InMemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_workflow(&self, workflow: &WorkflowCheckpoint) -> ConductorResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .workflows
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowCheckpoint>> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.get(workflow_id).cloned())
    }

    async fn save_step(&self, step: &StepCheckpoint) -> ConductorResult<()> {
        let mut inner = self.inner.write().await;
        let steps = inner.steps.entry(step.workflow_id.clone()).or_default();
        check_completed_immutable(steps.get(&step.step_name), step)?;
        steps.insert(step.step_name.clone(), step.clone());
        Ok(())
    }

    async fn get_step(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> ConductorResult<Option<StepCheckpoint>> {
        let inner = self.inner.read().await;
        Ok(inner
            .steps
            .get(workflow_id)
            .and_then(|steps| steps.get(step_name))
            .cloned())
    }

    async fn list_steps(&self, workflow_id: &str) -> ConductorResult<Vec<StepCheckpoint>> {
        let inner = self.inner.read().await;
        let mut steps: Vec<StepCheckpoint> = inner
            .steps
            .get(workflow_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }

    async fn list_in_progress(&self) -> ConductorResult<Vec<WorkflowCheckpoint>> {
        let inner = self.inner.read().await;
        let mut workflows: Vec<WorkflowCheckpoint> = inner
            .workflows
            .values()
            .filter(|w| w.status.is_recoverable())
            .cloned()
            .collect();
        sort_workflows(&mut workflows);
        Ok(workflows)
    }

    async fn list_workflows(&self) -> ConductorResult<Vec<WorkflowCheckpoint>> {
        let inner = self.inner.read().await;
        let mut workflows: Vec<WorkflowCheckpoint> = inner.workflows.values().cloned().collect();
        sort_workflows(&mut workflows);
        Ok(workflows)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> ConductorResult<bool> {
        let mut inner = self.inner.write().await;
        inner.steps.remove(workflow_id);
        Ok(inner.workflows.remove(workflow_id).is_some())
    }

    async fn save_transition(
        &self,
        workflow: &WorkflowCheckpoint,
        step: &StepCheckpoint,
    ) -> ConductorResult<()> {
        // Single write guard so readers never observe half of the pair.
        let mut inner = self.inner.write().await;
        let steps = inner.steps.entry(step.workflow_id.clone()).or_default();
        check_completed_immutable(steps.get(&step.step_name), step)?;
        steps.insert(step.step_name.clone(), step.clone());
        inner
            .workflows
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(())
    }
}
