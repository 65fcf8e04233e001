//! Approval types for human-in-the-loop workflows.
//!
//! A workflow hands a risky action to an [`ApprovalChannel`]; if the channel
//! cannot decide synchronously it returns [`ApprovalStatus::Pending`] and the
//! workflow parks in `AwaitingApproval` until the channel's callback resumes it.

use crate::{ConductorResult, Payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Risk level attached to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or trivially reversible.
    Low,
    /// Reversible with some effort.
    Medium,
    /// Visible to customers or costly to undo.
    High,
    /// Irreversible or externally visible.
    Critical,
}

/// A request sent to the approval collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Kind of action awaiting approval, e.g. `"send_email"`.
    pub action_type: String,
    /// What the action would do, shown to the approver.
    pub payload: Payload,
    /// How careful the approver should be.
    pub risk: RiskLevel,
}

impl ApprovalRequest {
    /// Build a request for `action_type` at the given risk.
    pub fn new(action_type: impl Into<String>, payload: Payload, risk: RiskLevel) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            risk,
        }
    }
}

/// Answer returned by the approval collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// The decision will arrive later through a callback carrying this id.
    Pending {
        /// Id the approval callback will refer to.
        approval_id: String,
    },
    /// Go ahead.
    Approved,
    /// Do not proceed.
    Rejected {
        /// Why, if the approver said.
        reason: Option<String>,
    },
}

/// Channel through which approval requests are sent.
/// Implementations can be dashboards, chat bots, webhooks, etc.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Submit `request`; `Pending` means the answer arrives later.
    async fn request_approval(&self, request: ApprovalRequest) -> ConductorResult<ApprovalStatus>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::Medium > RiskLevel::Low);
        let parsed: RiskLevel = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(parsed, RiskLevel::High);
    }

    #[test]
    fn status_serializes_with_tag() {
        let pending = ApprovalStatus::Pending {
            approval_id: "apr-1".into(),
        };
        let json = serde_json::to_string(&pending).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        let back: ApprovalStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pending);
    }
}
