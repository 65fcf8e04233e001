//! Q-learning agent selection.
//!
//! The router keeps one value per `(state, agent)` pair, where the state is
//! the task's category and priority (optionally its type). Selection is
//! either epsilon-greedy or UCB; outcomes come back through
//! [`AdaptiveRouter::update`] as scalar rewards.

use crate::config::{RouterConfig, RoutingStrategy};
use crate::types::{Candidate, Task, TaskCategory, TaskPriority};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

/// Q-table row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StateKey {
    /// Task category.
    pub category: TaskCategory,
    /// Task priority.
    pub priority: TaskPriority,
    /// Task type, when `per_task_type` is on.
    pub task_type: Option<String>,
}

impl StateKey {
    /// Key for `task`; the task type is included only when `per_task_type` is set.
    pub fn for_task(task: &Task, per_task_type: bool) -> Self {
        Self {
            category: task.category,
            priority: task.priority,
            task_type: per_task_type.then(|| task.task_type.clone()),
        }
    }
}

/// One observed `(state, agent, reward)` triple.
#[derive(Debug, Clone, Serialize)]
pub struct Experience {
    /// Where the task was routed from.
    pub state: StateKey,
    /// Agent that ran it.
    pub agent: String,
    /// Shaped reward.
    pub reward: f64,
}

/// Raw outcome of a task execution, turned into a reward by
/// [`AdaptiveRouter::reward`].
#[derive(Debug, Clone, Copy)]
pub struct RewardSignal {
    /// Whether the handler returned a result.
    pub success: bool,
    /// Handler latency.
    pub latency: Duration,
    /// Recent error rate of the agent, in `[0, 1]`.
    pub error_rate: f64,
    /// Priority of the task; higher priorities weigh more.
    pub priority: TaskPriority,
}

/// Router counters for `conductor stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Routing decisions per agent.
    pub routes: BTreeMap<String, u64>,
    /// Decisions made at random.
    pub explorations: u64,
    /// Decisions made from the table.
    pub exploitations: u64,
    /// Q-value updates applied.
    pub updates: u64,
    /// Current exploration rate.
    pub epsilon: f64,
    /// Number of `(state, agent)` entries.
    pub table_size: usize,
    /// Experiences in the replay buffer.
    pub experiences: usize,
}

struct RouterState {
    q: HashMap<StateKey, HashMap<String, f64>>,
    visits: HashMap<StateKey, HashMap<String, u64>>,
    epsilon: f64,
    updates: u64,
    experience: VecDeque<Experience>,
    rng: StdRng,
    routes: BTreeMap<String, u64>,
    explorations: u64,
    exploitations: u64,
}

impl RouterState {
    fn q_value(&self, state: &StateKey, agent: &str) -> f64 {
        self.q
            .get(state)
            .and_then(|row| row.get(agent))
            .copied()
            .unwrap_or(0.0)
    }

    fn visits(&self, state: &StateKey, agent: &str) -> u64 {
        self.visits
            .get(state)
            .and_then(|row| row.get(agent))
            .copied()
            .unwrap_or(0)
    }

    fn apply(&mut self, state: &StateKey, agent: &str, reward: f64, alpha: f64) {
        let q = self
            .q
            .entry(state.clone())
            .or_default()
            .entry(agent.to_string())
            .or_insert(0.0);
        *q += alpha * (reward - *q);
        *self
            .visits
            .entry(state.clone())
            .or_default()
            .entry(agent.to_string())
            .or_insert(0) += 1;
    }
}

/// Highest score first, then lowest load, then name.
fn rank(a: (&Candidate, f64), b: (&Candidate, f64)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| a.0.load.cmp(&b.0.load))
        .then_with(|| a.0.name.cmp(&b.0.name))
}

/// Learns which agent handles which kind of task best.
pub struct AdaptiveRouter {
    config: RouterConfig,
    state: Mutex<RouterState>,
}

impl AdaptiveRouter {
    /// A router seeded from `config.seed`, or from entropy.
    pub fn new(config: RouterConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = RouterState {
            q: HashMap::new(),
            visits: HashMap::new(),
            epsilon: config.epsilon,
            updates: 0,
            experience: VecDeque::with_capacity(config.experience_capacity),
            rng,
            routes: BTreeMap::new(),
            explorations: 0,
            exploitations: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Q-table key for `task`.
    pub fn state_key(&self, task: &Task) -> StateKey {
        StateKey::for_task(task, self.config.per_task_type)
    }

    /// Pick one of `candidates` for `task`.
    pub fn select_agent(&self, task: &Task, candidates: &[Candidate]) -> ConductorResult<String> {
        if candidates.is_empty() {
            return Err(ConductorError::RoutingExhausted {
                category: task.category.to_string(),
            });
        }
        let key = self.state_key(task);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (chosen, explored) = match self.config.strategy {
            RoutingStrategy::EpsilonGreedy => {
                let roll: f64 = state.rng.gen();
                if roll < state.epsilon {
                    let idx = state.rng.gen_range(0..candidates.len());
                    (&candidates[idx], true)
                } else {
                    let best = candidates
                        .iter()
                        .map(|c| (c, state.q_value(&key, &c.name)))
                        .min_by(|a, b| rank(*a, *b))
                        .map(|(c, _)| c);
                    (best.unwrap_or(&candidates[0]), false)
                }
            }
            RoutingStrategy::Ucb => {
                let untried = candidates
                    .iter()
                    .filter(|c| state.visits(&key, &c.name) == 0)
                    .min_by(|a, b| rank((*a, 0.0), (*b, 0.0)));
                match untried {
                    Some(c) => (c, true),
                    None => {
                        let total: u64 = candidates
                            .iter()
                            .map(|c| state.visits(&key, &c.name))
                            .sum();
                        let ln_total = (total.max(1) as f64).ln();
                        let best = candidates
                            .iter()
                            .map(|c| {
                                let n = state.visits(&key, &c.name) as f64;
                                let bonus = self.config.ucb_c * (ln_total / n).sqrt();
                                (c, state.q_value(&key, &c.name) + bonus)
                            })
                            .min_by(|a, b| rank(*a, *b))
                            .map(|(c, _)| c);
                        (best.unwrap_or(&candidates[0]), false)
                    }
                }
            }
        };

        if explored {
            state.explorations += 1;
        } else {
            state.exploitations += 1;
        }
        *state.routes.entry(chosen.name.clone()).or_insert(0) += 1;
        debug!(
            task_id = %task.id,
            category = %task.category,
            agent = %chosen.name,
            explored,
            "Routed task"
        );
        Ok(chosen.name.clone())
    }

    /// Feed back the reward earned by `agent` on `task`.
    pub fn update(&self, task: &Task, agent: &str, reward: f64) {
        let key = self.state_key(task);
        let mut state = self.state.lock();
        state.apply(&key, agent, reward, self.config.learning_rate);

        if state.experience.len() == self.config.experience_capacity {
            state.experience.pop_front();
        }
        state.experience.push_back(Experience {
            state: key,
            agent: agent.to_string(),
            reward,
        });

        state.updates += 1;
        if self.config.decay_every > 0 && state.updates % self.config.decay_every == 0 {
            state.epsilon = (state.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
            trace!(epsilon = state.epsilon, "Epsilon decayed");
        }
    }

    /// Scalar reward for an execution outcome.
    ///
    /// Success earns `+1` plus up to `0.5` for speed and `0.5` for a clean
    /// error record; failure costs `-1` and up to `0.5` more for a poor error
    /// record. The result is scaled by the task priority.
    pub fn reward(&self, signal: RewardSignal) -> f64 {
        let error_rate = signal.error_rate.clamp(0.0, 1.0);
        let base = if signal.success {
            let target = self.config.latency_target_ms.max(1) as f64;
            let latency = signal.latency.as_millis() as f64;
            let speed = 0.5 * (1.0 - (latency / target).min(1.0));
            1.0 + speed + 0.5 * (1.0 - error_rate)
        } else {
            -1.0 - 0.5 * error_rate
        };
        base * signal.priority.reward_weight()
    }

    /// Re-apply `batch` randomly sampled experiences. Returns how many were
    /// replayed.
    pub fn replay(&self, batch: usize) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let len = state.experience.len();
        if len == 0 {
            return 0;
        }
        let samples: Vec<Experience> = (0..batch)
            .map(|_| state.experience[state.rng.gen_range(0..len)].clone())
            .collect();
        for exp in &samples {
            state.apply(&exp.state, &exp.agent, exp.reward, self.config.learning_rate);
        }
        samples.len()
    }

    /// Recompute the Q-table from scratch out of the experience buffer.
    pub fn rebuild(&self) {
        let mut state = self.state.lock();
        state.q.clear();
        state.visits.clear();
        let experiences: Vec<Experience> = state.experience.iter().cloned().collect();
        for exp in &experiences {
            state.apply(&exp.state, &exp.agent, exp.reward, self.config.learning_rate);
        }
        debug!(experiences = experiences.len(), "Rebuilt routing table");
    }

    /// Learned value of routing `task` to `agent`.
    pub fn q_value(&self, task: &Task, agent: &str) -> Option<f64> {
        let key = self.state_key(task);
        let state = self.state.lock();
        state.q.get(&key).and_then(|row| row.get(agent)).copied()
    }

    /// Current exploration rate.
    pub fn epsilon(&self) -> f64 {
        self.state.lock().epsilon
    }

    /// Counters for `conductor stats`.
    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock();
        RouterStats {
            routes: state.routes.clone(),
            explorations: state.explorations,
            exploitations: state.exploitations,
            updates: state.updates,
            epsilon: state.epsilon,
            table_size: state.q.values().map(HashMap::len).sum(),
            experiences: state.experience.len(),
        }
    }
}
