//! Core types and error definitions for the Conductor workspace.
//!
//! This crate provides the foundational types shared by the checkpoint store,
//! the durable workflow engine and the scheduler.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Payload`] — Schema-less map exchanged with step functions and handlers.
//! - [`ApprovalChannel`] — Boundary to the human-approval collaborator.
//! - [`Notifier`] — Boundary to the escalation collaborator.

/// Approval types for human-in-the-loop workflows.
pub mod approval;
/// Error taxonomy.
pub mod error;
/// Escalation notifications.
pub mod notify;
/// Dynamic payload helpers.
pub mod payload;

pub use approval::{ApprovalChannel, ApprovalRequest, ApprovalStatus, RiskLevel};
pub use error::{ConductorError, ConductorResult};
pub use notify::{notify_detached, LogNotifier, Notification, NotificationKind, Notifier};
pub use payload::{from_payload, into_payload, to_payload, Payload};
