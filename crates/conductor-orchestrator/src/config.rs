//! `conductor.toml` configuration.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use crate::profiles::{default_agents, default_role_weights, default_voters};
use crate::types::TaskCategory;
use conductor_core::{ConductorError, ConductorResult};
use conductor_workflow::StepOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, one field per TOML section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Root for state files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Queue and worker settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Adaptive routing settings.
    #[serde(default)]
    pub router: RouterConfig,
    /// Agent health settings.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Context budget settings.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Voters and threshold for gated tasks.
    #[serde(default)]
    pub consensus: ConsensusConfig,
    /// Default step policy for durable workflows.
    #[serde(default)]
    pub workflow: StepOptions,
    /// Category name -> agent names.
    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, Vec<String>>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scheduler: SchedulerConfig::default(),
            router: RouterConfig::default(),
            registry: RegistryConfig::default(),
            budget: BudgetConfig::default(),
            consensus: ConsensusConfig::default(),
            workflow: StepOptions::default(),
            agents: default_agents(),
        }
    }
}

impl ConductorConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Location of the checkpoint database inside `data_dir`.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoints.db")
    }

    /// Location of the scheduler stats snapshot, unless overridden.
    pub fn stats_path(&self) -> PathBuf {
        self.scheduler
            .stats_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("stats.json"))
    }

    /// Agent pools keyed by parsed category.
    pub fn categories(&self) -> ConductorResult<BTreeMap<TaskCategory, Vec<String>>> {
        self.agents
            .iter()
            .map(|(name, members)| Ok((name.parse::<TaskCategory>()?, members.clone())))
            .collect()
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.scheduler.workers == 0 {
            return Err(ConductorError::Config("scheduler.workers must be > 0".into()));
        }
        if self.scheduler.max_task_attempts == 0 {
            return Err(ConductorError::Config(
                "scheduler.max_task_attempts must be > 0".into(),
            ));
        }
        let r = &self.router;
        if !(0.0..=1.0).contains(&r.learning_rate) || r.learning_rate == 0.0 {
            return Err(ConductorError::Config(
                "router.learning_rate must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.epsilon) || !(0.0..=1.0).contains(&r.epsilon_min) {
            return Err(ConductorError::Config(
                "router.epsilon and router.epsilon_min must be in [0, 1]".into(),
            ));
        }
        if r.epsilon_min > r.epsilon {
            return Err(ConductorError::Config(
                "router.epsilon_min must not exceed router.epsilon".into(),
            ));
        }
        if r.experience_capacity == 0 {
            return Err(ConductorError::Config(
                "router.experience_capacity must be > 0".into(),
            ));
        }
        if self.registry.failure_threshold == 0 {
            return Err(ConductorError::Config(
                "registry.failure_threshold must be > 0".into(),
            ));
        }
        if self.registry.offline_after_missed < self.registry.degraded_after_missed {
            return Err(ConductorError::Config(
                "registry.offline_after_missed must be >= degraded_after_missed".into(),
            ));
        }
        let b = &self.budget;
        if b.max_units == 0 {
            return Err(ConductorError::Config("budget.max_units must be > 0".into()));
        }
        if !(b.warning > 0.0 && b.warning < b.critical && b.critical <= 1.0) {
            return Err(ConductorError::Config(format!(
                "budget thresholds must satisfy 0 < warning < critical <= 1 (got {} / {})",
                b.warning, b.critical
            )));
        }
        let c = &self.consensus;
        if !(c.threshold > 0.0 && c.threshold <= 1.0) {
            return Err(ConductorError::Config(
                "consensus.threshold must be in (0, 1]".into(),
            ));
        }
        for voter in &c.voters {
            if !c.role_weights.contains_key(&voter.role) {
                return Err(ConductorError::Config(format!(
                    "Voter '{}' has unknown role '{}'",
                    voter.name, voter.role
                )));
            }
        }
        self.categories()?;
        Ok(())
    }
}

/// The `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Deadline for one handler call.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Routing attempts per task, the first one included.
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
    /// How long a task waits before routing is retried after exhaustion.
    #[serde(default = "default_hold_retry_ms")]
    pub hold_retry_ms: u64,
    /// A task held for longer than this is failed as undeliverable.
    #[serde(default = "default_undeliverable_after_ms")]
    pub undeliverable_after_ms: u64,
    /// Finished tasks older than this are dropped from memory; their counts
    /// stay in the stats.
    #[serde(default = "default_retain_finished_ms")]
    pub retain_finished_ms: u64,
    /// Where `conductor simulate` writes its snapshot. Defaults under `data_dir`.
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_ms: default_task_timeout_ms(),
            max_task_attempts: default_max_task_attempts(),
            hold_retry_ms: default_hold_retry_ms(),
            undeliverable_after_ms: default_undeliverable_after_ms(),
            retain_finished_ms: default_retain_finished_ms(),
            stats_path: None,
        }
    }
}

impl SchedulerConfig {
    /// `task_timeout_ms` as a `Duration`.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// `hold_retry_ms` as a `Duration`.
    pub fn hold_retry(&self) -> Duration {
        Duration::from_millis(self.hold_retry_ms)
    }

    /// `undeliverable_after_ms` as a `Duration`.
    pub fn undeliverable_after(&self) -> Duration {
        Duration::from_millis(self.undeliverable_after_ms)
    }

    /// `retain_finished_ms` as a `Duration`.
    pub fn retain_finished(&self) -> Duration {
        Duration::from_millis(self.retain_finished_ms)
    }
}

/// How the router picks among eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Random agent with probability epsilon, best known otherwise.
    #[default]
    EpsilonGreedy,
    /// Upper confidence bound over visit counts.
    Ucb,
}

/// The `[router]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Selection strategy.
    #[serde(default)]
    pub strategy: RoutingStrategy,
    /// Q update step size.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Initial exploration rate.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Multiplier applied at each decay.
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
    /// Floor for epsilon.
    #[serde(default = "default_epsilon_min")]
    pub epsilon_min: f64,
    /// Decay epsilon once every this many updates.
    #[serde(default = "default_decay_every")]
    pub decay_every: u64,
    /// Exploration constant for UCB.
    #[serde(default = "default_ucb_c")]
    pub ucb_c: f64,
    /// Experiences kept for replay.
    #[serde(default = "default_experience_capacity")]
    pub experience_capacity: usize,
    /// Latency at or above which a success earns no speed bonus.
    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: u64,
    /// Include `task_type` in the Q-table state key.
    #[serde(default)]
    pub per_task_type: bool,
    /// Fixed RNG seed for reproducible routing.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            learning_rate: default_learning_rate(),
            epsilon: default_epsilon(),
            epsilon_decay: default_epsilon_decay(),
            epsilon_min: default_epsilon_min(),
            decay_every: default_decay_every(),
            ucb_c: default_ucb_c(),
            experience_capacity: default_experience_capacity(),
            latency_target_ms: default_latency_target_ms(),
            per_task_type: false,
            seed: None,
        }
    }
}

/// The `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Consecutive failures that demote a healthy agent to degraded.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Expected time between heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before an agent is degraded.
    #[serde(default = "default_degraded_after_missed")]
    pub degraded_after_missed: u32,
    /// Missed heartbeats before an agent is offline.
    #[serde(default = "default_offline_after_missed")]
    pub offline_after_missed: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            degraded_after_missed: default_degraded_after_missed(),
            offline_after_missed: default_offline_after_missed(),
        }
    }
}

/// The `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Units per session.
    #[serde(default = "default_max_units")]
    pub max_units: u64,
    /// Usage fraction where the caution zone starts.
    #[serde(default = "default_warning")]
    pub warning: f64,
    /// Usage fraction where the dumb zone starts.
    #[serde(default = "default_critical")]
    pub critical: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_units: default_max_units(),
            warning: default_warning(),
            critical: default_critical(),
        }
    }
}

/// One entry of `[[consensus.voters]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterConfig {
    /// Voter name passed to the ballot.
    pub name: String,
    /// Role, looked up in `role_weights`.
    pub role: String,
}

/// The `[consensus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Fraction of total weight the "yes" votes must reach.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Weight per role; unknown roles weigh 1.0.
    #[serde(default = "default_role_weights")]
    pub role_weights: BTreeMap<String, f64>,
    /// Voters asked on every proposal.
    #[serde(default = "default_voter_configs")]
    pub voters: Vec<VoterConfig>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            role_weights: default_role_weights(),
            voters: default_voter_configs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_workers() -> usize {
    4
}
fn default_task_timeout_ms() -> u64 {
    30_000
}
fn default_max_task_attempts() -> u32 {
    3
}
fn default_hold_retry_ms() -> u64 {
    1_000
}
fn default_undeliverable_after_ms() -> u64 {
    60_000
}

fn default_retain_finished_ms() -> u64 {
    3_600_000
}

fn default_learning_rate() -> f64 {
    0.1
}
fn default_epsilon() -> f64 {
    0.2
}
fn default_epsilon_decay() -> f64 {
    0.995
}
fn default_epsilon_min() -> f64 {
    0.01
}
fn default_decay_every() -> u64 {
    10
}
fn default_ucb_c() -> f64 {
    std::f64::consts::SQRT_2
}
fn default_experience_capacity() -> usize {
    1_000
}
fn default_latency_target_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_degraded_after_missed() -> u32 {
    2
}
fn default_offline_after_missed() -> u32 {
    5
}
fn default_max_units() -> u64 {
    200_000
}
fn default_warning() -> f64 {
    0.40
}
fn default_critical() -> f64 {
    0.60
}
fn default_threshold() -> f64 {
    2.0 / 3.0
}
fn default_voter_configs() -> Vec<VoterConfig> {
    default_voters()
        .into_iter()
        .map(|(name, role)| VoterConfig { name, role })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ConductorConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.router.strategy, RoutingStrategy::EpsilonGreedy);
        assert!((config.budget.warning - 0.40).abs() < f64::EPSILON);
        assert_eq!(config.consensus.voters.len(), 3);
        assert_eq!(config.workflow.max_retries, 3);
        assert_eq!(config.categories().unwrap().len(), 6);
    }

    #[test]
    fn test_partial_sections() {
        let raw = r#"
            data_dir = "/tmp/conductor"

            [scheduler]
            workers = 2

            [router]
            strategy = "ucb"
            seed = 7

            [workflow]
            max_retries = 5
            backoff_base_ms = 250

            [agents]
            research = ["scout"]
        "#;
        let config = ConductorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.max_task_attempts, 3);
        assert_eq!(config.router.strategy, RoutingStrategy::Ucb);
        assert_eq!(config.router.seed, Some(7));
        assert_eq!(config.workflow.max_retries, 5);
        assert_eq!(config.workflow.timeout_ms, 30_000);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/tmp/conductor/checkpoints.db")
        );
    }

    #[test]
    fn test_invalid_budget_rejected() {
        let raw = "[budget]\nwarning = 0.7\ncritical = 0.6\n";
        assert!(matches!(
            ConductorConfig::from_toml_str(raw),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_category_rejected() {
        let raw = "[agents]\nmarketing = [\"x\"]\n";
        assert!(ConductorConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_unknown_voter_role_rejected() {
        let raw = r#"
            [consensus]
            voters = [{ name = "bob", role = "intern" }]
        "#;
        assert!(ConductorConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            ConductorConfig::from_toml_str("[scheduler\nworkers = 1"),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_sample_config_parses() {
        let raw = include_str!("../../../conductor.toml");
        let config = ConductorConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.categories().unwrap()[&TaskCategory::Research].len(), 2);
        assert_eq!(config.consensus.voters.len(), 3);
    }
}
