//! Durable, checkpointed workflows.
//!
//! A workflow is a sequence of named steps. Each completed step is persisted,
//! so re-opening a workflow after a crash skips finished work and retries the
//! rest with exponential backoff.

/// The workflow handle and its step runner.
pub mod durable;
/// Startup and operator helpers over a store.
pub mod recovery;
/// Per-step retry and timeout policy.
pub mod retry;

pub use durable::DurableWorkflow;
pub use recovery::{archive, describe, force_resume, recoverable};
pub use retry::StepOptions;
