use crate::config::RegistryConfig;
use crate::types::{AgentState, AgentStatus, Candidate, HeartbeatMetrics, TaskCategory};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Tracks health and load for every agent, grouped by task category.
pub struct AgentRegistry {
    categories: BTreeMap<TaskCategory, Vec<String>>,
    states: RwLock<HashMap<String, AgentState>>,
    config: RegistryConfig,
}

impl AgentRegistry {
    /// Build from a static `category -> agents` map. Every agent starts healthy.
    pub fn new(categories: BTreeMap<TaskCategory, Vec<String>>, config: RegistryConfig) -> Self {
        let mut states = HashMap::new();
        for name in categories.values().flatten() {
            states
                .entry(name.clone())
                .or_insert_with(|| AgentState::new(name.clone()));
        }
        Self {
            categories,
            states: RwLock::new(states),
            config,
        }
    }

    /// Names of agents in `category` whose status allows new work.
    pub fn eligible_agents(&self, category: TaskCategory) -> Vec<String> {
        self.candidates(category).into_iter().map(|c| c.name).collect()
    }

    /// Eligible agents of `category` with their current load.
    pub fn candidates(&self, category: TaskCategory) -> Vec<Candidate> {
        let Some(members) = self.categories.get(&category) else {
            return Vec::new();
        };
        let states = self.states.read();
        members
            .iter()
            .filter_map(|name| states.get(name))
            .filter(|s| s.status.is_eligible())
            .map(|s| Candidate::new(s.name.clone(), s.active_tasks))
            .collect()
    }

    /// Record a heartbeat: clears the failure streak and steps the agent back
    /// toward `Healthy`.
    pub fn heartbeat(&self, agent: &str, metrics: HeartbeatMetrics) -> ConductorResult<AgentStatus> {
        self.with_state(agent, |state| {
            let before = state.status;
            state.consecutive_failures = 0;
            state.active_tasks = metrics.active_tasks;
            state.last_heartbeat = Utc::now();
            state.status = match state.status {
                AgentStatus::Offline | AgentStatus::Unhealthy => AgentStatus::Recovering,
                AgentStatus::Recovering | AgentStatus::Degraded => AgentStatus::Healthy,
                AgentStatus::Healthy => AgentStatus::Healthy,
            };
            if before != state.status {
                info!(agent = %state.name, from = ?before, to = ?state.status, "Agent status changed");
            }
            state.status
        })
    }

    /// Count a failed task against `agent`, demoting it once the streak
    /// reaches the threshold (and again at twice the threshold).
    pub fn mark_failure(&self, agent: &str) -> ConductorResult<AgentStatus> {
        let threshold = self.config.failure_threshold;
        self.with_state(agent, |state| {
            state.consecutive_failures += 1;
            state.total_failures += 1;
            let before = state.status;
            if state.consecutive_failures >= threshold.saturating_mul(2) {
                if state.status != AgentStatus::Offline {
                    state.status = AgentStatus::Unhealthy;
                }
            } else if state.consecutive_failures >= threshold && state.status == AgentStatus::Healthy
            {
                state.status = AgentStatus::Degraded;
            }
            if before != state.status {
                warn!(
                    agent = %state.name,
                    failures = state.consecutive_failures,
                    to = ?state.status,
                    "Agent demoted"
                );
            }
            state.status
        })
    }

    /// Clear the failure streak and lift a degraded agent back to healthy.
    pub fn mark_success(&self, agent: &str) -> ConductorResult<AgentStatus> {
        self.with_state(agent, |state| {
            state.consecutive_failures = 0;
            state.total_successes += 1;
            if state.status == AgentStatus::Degraded {
                state.status = AgentStatus::Healthy;
                info!(agent = %state.name, "Agent recovered");
            }
            state.status
        })
    }

    /// Demote agents whose heartbeat is overdue as of `now`.
    ///
    /// Returns the agents whose status changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<(String, AgentStatus)> {
        let interval = self.config.heartbeat_interval_ms.max(1) as i64;
        let mut changed = Vec::new();
        let mut states = self.states.write();
        for state in states.values_mut() {
            let elapsed = (now - state.last_heartbeat).num_milliseconds().max(0);
            let missed = (elapsed / interval) as u32;
            let next = if missed >= self.config.offline_after_missed {
                AgentStatus::Offline
            } else if missed >= self.config.degraded_after_missed
                && matches!(state.status, AgentStatus::Healthy | AgentStatus::Recovering)
            {
                AgentStatus::Degraded
            } else {
                state.status
            };
            if next != state.status {
                warn!(agent = %state.name, missed, to = ?next, "Missed heartbeats");
                state.status = next;
                changed.push((state.name.clone(), next));
            }
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    /// An agent picked up a task.
    pub fn begin_task(&self, agent: &str) -> ConductorResult<()> {
        self.with_state(agent, |state| state.active_tasks += 1)
    }

    /// Decrement the load recorded by `begin_task`.
    pub fn finish_task(&self, agent: &str) -> ConductorResult<()> {
        self.with_state(agent, |state| {
            state.active_tasks = state.active_tasks.saturating_sub(1);
        })
    }

    /// Tasks currently running on `agent`.
    pub fn load(&self, agent: &str) -> ConductorResult<u32> {
        self.with_state(agent, |state| state.active_tasks)
    }

    /// Current health of `agent`.
    pub fn status(&self, agent: &str) -> ConductorResult<AgentStatus> {
        self.with_state(agent, |state| state.status)
    }

    /// Snapshot of one agent.
    pub fn get_state(&self, agent: &str) -> Option<AgentState> {
        self.states.read().get(agent).cloned()
    }

    /// All agents, sorted by name.
    pub fn snapshot(&self) -> Vec<AgentState> {
        let mut all: Vec<AgentState> = self.states.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// The category to agent pools this registry was built from.
    pub fn categories(&self) -> &BTreeMap<TaskCategory, Vec<String>> {
        &self.categories
    }

    /// Serialize the current state as JSON (for stats output).
    pub fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot();
        let healthy = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Healthy)
            .count();
        let total = agents.len();
        serde_json::json!({
            "agents": agents,
            "total": total,
            "healthy": healthy,
        })
    }

    fn with_state<R>(&self, agent: &str, f: impl FnOnce(&mut AgentState) -> R) -> ConductorResult<R> {
        let mut states = self.states.write();
        let state = states
            .get_mut(agent)
            .ok_or_else(|| ConductorError::NotFound(format!("agent '{agent}'")))?;
        Ok(f(state))
    }
}
