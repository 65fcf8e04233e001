//! Weighted-majority approval for risk-sensitive decisions.
//!
//! Each voter carries a static weight derived from its role. A decision is
//! approved when the weight of "yes" votes reaches `threshold` of the total
//! weight. Resolved decisions are immutable.

use crate::config::ConsensusConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Absorbs float error when the yes weight sits exactly on the threshold.
const WEIGHT_EPSILON: f64 = 1e-9;

/// A participant in consensus votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voter {
    /// Name passed to the ballot.
    pub name: String,
    /// Role the weight came from.
    pub role: String,
    /// Vote weight.
    pub weight: f64,
}

impl Voter {
    /// A voter with an explicit weight.
    pub fn new(name: impl Into<String>, role: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            weight,
        }
    }
}

/// Resolve configured voters to weighted [`Voter`]s.
pub fn voters_from_config(config: &ConsensusConfig) -> ConductorResult<Vec<Voter>> {
    config
        .voters
        .iter()
        .map(|v| {
            let weight = config.role_weights.get(&v.role).copied().ok_or_else(|| {
                ConductorError::Config(format!("Voter '{}' has unknown role '{}'", v.name, v.role))
            })?;
            Ok(Voter::new(v.name.clone(), v.role.clone(), weight))
        })
        .collect()
}

/// Source of individual votes (an agent, a rule engine, a human...).
#[async_trait]
pub trait Ballot: Send + Sync {
    /// Ask `voter` to approve `decision_id` put forward by `proposer`.
    async fn vote(&self, voter: &Voter, decision_id: &str, proposer: &str) -> ConductorResult<bool>;
}

/// Ballot with fixed answers per voter and a default for everyone else.
#[derive(Debug, Clone, Default)]
pub struct StaticBallot {
    default_vote: bool,
    votes: HashMap<String, bool>,
}

impl StaticBallot {
    /// Every voter answers `default_vote`.
    pub fn new(default_vote: bool) -> Self {
        Self {
            default_vote,
            votes: HashMap::new(),
        }
    }

    /// Fix the answer of one voter.
    pub fn with_vote(mut self, voter: impl Into<String>, approve: bool) -> Self {
        self.votes.insert(voter.into(), approve);
        self
    }
}

#[async_trait]
impl Ballot for StaticBallot {
    async fn vote(&self, voter: &Voter, _decision_id: &str, _proposer: &str) -> ConductorResult<bool> {
        Ok(self.votes.get(&voter.name).copied().unwrap_or(self.default_vote))
    }
}

/// One recorded vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Voter name.
    pub voter: String,
    /// Weight at the time of the vote.
    pub weight: f64,
    /// Whether it approved.
    pub approve: bool,
}

/// Result of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusOutcome {
    /// Yes weight reached the threshold.
    Approved,
    /// It did not.
    Rejected,
}

/// A resolved proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    /// Caller-chosen id, e.g. `task:{uuid}`.
    pub decision_id: String,
    /// Who proposed it.
    pub proposer: String,
    /// Every vote cast.
    pub votes: Vec<Vote>,
    /// Threshold in force.
    pub threshold: f64,
    /// Sum of approving weights.
    pub yes_weight: f64,
    /// Sum of all weights.
    pub total_weight: f64,
    /// Final outcome.
    pub outcome: ConsensusOutcome,
    /// When it was resolved.
    pub resolved_at: DateTime<Utc>,
}

impl ConsensusDecision {
    /// Whether the outcome is `Approved`.
    pub fn is_approved(&self) -> bool {
        self.outcome == ConsensusOutcome::Approved
    }
}

/// Counters over every proposal, pruned ones included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusStats {
    /// Proposals resolved.
    pub proposals: u64,
    /// Approved ones.
    pub approvals: u64,
    /// Rejected ones.
    pub rejections: u64,
    /// `approvals / proposals`, 0 with no proposals.
    pub approval_rate: f64,
}

/// Resolves decisions and keeps them until they are forgotten or pruned.
/// Counters cover every decision ever resolved.
pub struct ConsensusGate {
    threshold: f64,
    decisions: RwLock<HashMap<String, ConsensusDecision>>,
    proposals: AtomicU64,
    approvals: AtomicU64,
}

impl ConsensusGate {
    /// `threshold` is the share of total weight that must vote yes.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            decisions: RwLock::new(HashMap::new()),
            proposals: AtomicU64::new(0),
            approvals: AtomicU64::new(0),
        }
    }

    /// A gate using the configured threshold.
    pub fn from_config(config: &ConsensusConfig) -> Self {
        Self::new(config.threshold)
    }

    /// Threshold in force.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Collect one vote per voter and resolve `decision_id`.
    ///
    /// A voter whose ballot errors counts as a "no". Zero total weight
    /// rejects.
    pub async fn propose(
        &self,
        decision_id: &str,
        proposer: &str,
        voters: &[Voter],
        ballot: &dyn Ballot,
    ) -> ConductorResult<ConsensusDecision> {
        self.ensure_open(decision_id)?;

        let mut votes = Vec::with_capacity(voters.len());
        for voter in voters {
            let approve = match ballot.vote(voter, decision_id, proposer).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(decision_id, voter = %voter.name, error = %e, "Ballot failed, counting as no");
                    false
                }
            };
            votes.push(Vote {
                voter: voter.name.clone(),
                weight: voter.weight,
                approve,
            });
        }

        let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
        let yes_weight: f64 = votes.iter().filter(|v| v.approve).map(|v| v.weight).sum();
        let approved =
            total_weight > 0.0 && yes_weight + WEIGHT_EPSILON >= self.threshold * total_weight;

        let decision = ConsensusDecision {
            decision_id: decision_id.to_string(),
            proposer: proposer.to_string(),
            votes,
            threshold: self.threshold,
            yes_weight,
            total_weight,
            outcome: if approved {
                ConsensusOutcome::Approved
            } else {
                ConsensusOutcome::Rejected
            },
            resolved_at: Utc::now(),
        };

        {
            let mut decisions = self.decisions.write();
            if decisions.contains_key(decision_id) {
                return Err(already_resolved(decision_id));
            }
            decisions.insert(decision_id.to_string(), decision.clone());
        }
        self.proposals.fetch_add(1, Ordering::Relaxed);
        if approved {
            self.approvals.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            decision_id,
            proposer,
            yes_weight,
            total_weight,
            outcome = ?decision.outcome,
            "Consensus resolved"
        );
        Ok(decision)
    }

    /// A past decision, unless it was pruned.
    pub fn decision(&self, decision_id: &str) -> Option<ConsensusDecision> {
        self.decisions.read().get(decision_id).cloned()
    }

    /// Drop a resolved decision once its subject is gone. The id may then be
    /// proposed again.
    pub fn forget(&self, decision_id: &str) -> bool {
        self.decisions.write().remove(decision_id).is_some()
    }

    /// Drop decisions resolved before `cutoff`. Returns how many went.
    pub fn prune_resolved(&self, cutoff: DateTime<Utc>) -> usize {
        let mut decisions = self.decisions.write();
        let before = decisions.len();
        decisions.retain(|_, d| d.resolved_at >= cutoff);
        let pruned = before - decisions.len();
        if pruned > 0 {
            debug!(pruned, "Pruned resolved decisions");
        }
        pruned
    }

    /// Proposal counters.
    pub fn stats(&self) -> ConsensusStats {
        let proposals = self.proposals.load(Ordering::Relaxed);
        let approvals = self.approvals.load(Ordering::Relaxed);
        ConsensusStats {
            proposals,
            approvals,
            rejections: proposals - approvals,
            approval_rate: if proposals == 0 {
                0.0
            } else {
                approvals as f64 / proposals as f64
            },
        }
    }

    fn ensure_open(&self, decision_id: &str) -> ConductorResult<()> {
        if self.decisions.read().contains_key(decision_id) {
            return Err(already_resolved(decision_id));
        }
        Ok(())
    }
}

fn already_resolved(decision_id: &str) -> ConductorError {
    ConductorError::StateConflict(format!("Decision '{decision_id}' is already resolved"))
}
