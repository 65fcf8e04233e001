//! Agent routing and task scheduling.
//!
//! Tasks are queued by priority and pulled by a fixed pool of workers. Each
//! task is routed to one agent of its category by a Q-learning router that
//! consults the health registry, optionally gated by a weighted consensus
//! vote. Outcomes flow back into the router as rewards and into the registry
//! as health signals.
//!
//! # Main types
//!
//! - [`TaskScheduler`] — Worker pool over the priority queue.
//! - [`AdaptiveRouter`] — Epsilon-greedy / UCB agent selection.
//! - [`AgentRegistry`] — Per-agent health, load and heartbeats.
//! - [`ConsensusGate`] — Weighted two-thirds vote for risky tasks.
//! - [`ContextBudget`] — Context-window usage zones.
//! - [`ConductorConfig`] — `conductor.toml` model.

/// Context-window budget zones.
pub mod budget;
/// TOML configuration.
pub mod config;
/// Weighted consensus voting.
pub mod consensus;
/// Default agent pools and voter roles.
pub mod profiles;
/// Agent health registry.
pub mod registry;
/// Q-learning router.
pub mod router;
/// Worker pool and task lifecycle.
pub mod scheduler;
/// Priority task queue.
pub mod task_queue;
/// Tasks, agents and routing history.
pub mod types;

pub use budget::{estimate_units, BudgetZone, ContextBudget, SessionBudgets};
pub use config::{
    BudgetConfig, ConductorConfig, ConsensusConfig, RegistryConfig, RouterConfig,
    RoutingStrategy, SchedulerConfig, VoterConfig,
};
pub use consensus::{
    voters_from_config, Ballot, ConsensusDecision, ConsensusGate, ConsensusOutcome,
    ConsensusStats, StaticBallot, Vote, Voter,
};
pub use profiles::{default_agents, default_role_weights, default_voters};
pub use registry::AgentRegistry;
pub use router::{AdaptiveRouter, RewardSignal, RouterStats, StateKey};
pub use scheduler::{SchedulerStats, StatsSnapshot, TaskEvent, TaskHandler, TaskScheduler};
pub use task_queue::PriorityTaskQueue;
pub use types::{
    AgentState, AgentStatus, Candidate, HeartbeatMetrics, RoutingEvent, RoutingOutcome, Task,
    TaskCategory, TaskPriority, TaskStatus,
};
