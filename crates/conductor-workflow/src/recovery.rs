//! Process-start recovery and operator actions on stored workflows.
//!
//! These work directly against a [`CheckpointStore`] without an open
//! [`DurableWorkflow`](crate::DurableWorkflow) handle, which is what the CLI
//! needs.

use crate::durable::apply_resume;
use conductor_checkpoint::{CheckpointStore, StepCheckpoint, WorkflowCheckpoint};
use conductor_core::{ConductorError, ConductorResult};
use tracing::info;

/// Workflows left `InProgress`, `Paused` or `AwaitingApproval` by a previous run.
pub async fn recoverable(store: &dyn CheckpointStore) -> ConductorResult<Vec<WorkflowCheckpoint>> {
    let workflows = store.list_in_progress().await?;
    info!(count = workflows.len(), "Found recoverable workflows");
    Ok(workflows)
}

/// A workflow together with its steps in execution order.
pub async fn describe(
    store: &dyn CheckpointStore,
    workflow_id: &str,
) -> ConductorResult<(WorkflowCheckpoint, Vec<StepCheckpoint>)> {
    let workflow = load(store, workflow_id).await?;
    let steps = store.list_steps(workflow_id).await?;
    Ok((workflow, steps))
}

/// Resume a paused or approval-blocked workflow from outside its process.
///
/// The owning process picks it up again the next time it opens the id.
pub async fn force_resume(
    store: &dyn CheckpointStore,
    workflow_id: &str,
) -> ConductorResult<WorkflowCheckpoint> {
    let mut workflow = load(store, workflow_id).await?;
    apply_resume(&mut workflow)?;
    store.save_workflow(&workflow).await?;
    info!(workflow_id, "Workflow resumed by operator");
    Ok(workflow)
}

/// Delete a finished workflow and its steps.
pub async fn archive(store: &dyn CheckpointStore, workflow_id: &str) -> ConductorResult<()> {
    let workflow = load(store, workflow_id).await?;
    if !workflow.status.is_terminal() {
        return Err(ConductorError::StateConflict(format!(
            "Workflow '{workflow_id}' is {} and cannot be archived",
            workflow.status
        )));
    }
    store.delete_workflow(workflow_id).await?;
    info!(workflow_id, status = %workflow.status, "Workflow archived");
    Ok(())
}

async fn load(store: &dyn CheckpointStore, workflow_id: &str) -> ConductorResult<WorkflowCheckpoint> {
    store
        .get_workflow(workflow_id)
        .await?
        .ok_or_else(|| ConductorError::NotFound(format!("workflow '{workflow_id}'")))
}
