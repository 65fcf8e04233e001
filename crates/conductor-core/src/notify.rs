//! Fire-and-forget escalation of failed or stuck work.
//!
//! Delivery failures are logged and never propagate into workflow or task
//! state.

use crate::ConductorResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A workflow moved to `Failed`.
    WorkflowFailed,
    /// A step ran out of attempts on timeouts.
    StepTimedOut,
    /// A task failed on every agent it was routed to.
    TaskFailed,
    /// No agent could take a task before the hold expired.
    TaskUndeliverable,
}

/// An escalation carrying enough context to replay or debug the failure.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// What went wrong.
    pub kind: NotificationKind,
    /// Workflow id or task id the notification is about.
    pub subject: String,
    /// Step (or scheduler phase) that failed.
    pub step: Option<String>,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Last error message.
    pub error: String,
    /// When the notification was raised.
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// A notification without step context.
    pub fn new(kind: NotificationKind, subject: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            step: None,
            attempts: 0,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the failing step and the attempts spent on it.
    pub fn with_step(mut self, step: impl Into<String>, attempts: u32) -> Self {
        self.step = Some(step.into());
        self.attempts = attempts;
        self
    }
}

/// Outbound escalation channel (email, chat, pager...).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, notification: Notification) -> ConductorResult<()>;
}

/// Notifier that only writes a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> ConductorResult<()> {
        info!(
            kind = ?notification.kind,
            subject = %notification.subject,
            step = ?notification.step,
            attempts = notification.attempts,
            error = %notification.error,
            "escalation"
        );
        Ok(())
    }
}

/// Deliver a notification on a background task without awaiting it.
pub fn notify_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        let subject = notification.subject.clone();
        if let Err(e) = notifier.notify(notification).await {
            warn!(subject = %subject, error = %e, "Notification delivery failed");
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ConductorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingNotifier {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _notification: Notification) -> ConductorResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ConductorError::Handler("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn detached_failure_is_swallowed() {
        let notifier = Arc::new(FailingNotifier {
            calls: AtomicU32::new(0),
        });
        notify_detached(
            notifier.clone(),
            Notification::new(NotificationKind::WorkflowFailed, "wf-1", "boom").with_step("send", 3),
        );
        for _ in 0..50 {
            if notifier.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn log_notifier_succeeds() {
        let n = Notification::new(NotificationKind::TaskFailed, "task-1", "timeout");
        assert!(LogNotifier.notify(n).await.is_ok());
    }
}
