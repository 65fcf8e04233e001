//! Checkpoint persistence for durable workflows.
//!
//! Provides the [`CheckpointStore`] trait with an in-memory backend for tests
//! and a SQLite backend that survives process restarts.

/// SQLite-backed store.
pub mod sqlite;
/// The store trait and its in-memory backend.
pub mod store;
/// Workflow and step checkpoint records.
pub mod types;

pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, InMemoryCheckpointStore};
pub use types::{
    step_key, workflow_key, StepCheckpoint, StepStatus, WorkflowCheckpoint, WorkflowStatus,
};
