use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type shared by every Conductor crate.
///
/// Variants follow the operator-facing taxonomy: transient handler failures
/// (retried locally), terminal step failures, lookups that found nothing,
/// illegal state transitions, and routing exhaustion.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A step or task handler returned an error. Retryable.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A step or task handler did not finish within its deadline. Retryable.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A workflow step exhausted its retries.
    #[error("Step '{step}' of workflow '{workflow_id}' failed after {attempts} attempt(s): {last_error}")]
    StepFailed {
        /// Workflow the step belongs to.
        workflow_id: String,
        /// Name of the failed step.
        step: String,
        /// Attempts made, the first one included.
        attempts: u32,
        /// Message of the final attempt's error.
        last_error: String,
    },

    /// Unknown workflow, step, task, agent or decision id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested transition is not legal from the current state.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// No agent in the category is currently eligible.
    #[error("No eligible agent for category '{category}'")]
    RoutingExhausted {
        /// Category whose pool had no eligible agent.
        category: String,
    },

    /// The checkpoint backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure that another attempt cannot fix. Durable steps fail on the
    /// first one instead of retrying.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl ConductorError {
    /// Whether re-routing a task to another agent may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::Handler(_) | ConductorError::Timeout(_) | ConductorError::Io(_)
        )
    }

    /// Whether a durable step must stop retrying. Every other error a step
    /// returns is retried up to its attempt budget.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ConductorError::Permanent(_))
    }
}
