//! Worker pool that routes queued tasks to agents and learns from outcomes.
//!
//! A worker pops the highest-priority pending task, asks the router for an
//! agent among the eligible ones, runs the agent's handler under a deadline
//! and reports the outcome to both the router (reward) and the registry
//! (health). Failed executions are re-routed to another agent until the
//! attempt budget runs out.

use crate::config::SchedulerConfig;
use crate::consensus::{Ballot, ConsensusDecision, ConsensusGate, ConsensusStats, StaticBallot, Voter};
use crate::registry::AgentRegistry;
use crate::router::{AdaptiveRouter, RewardSignal, RouterStats};
use crate::task_queue::PriorityTaskQueue;
use crate::types::{
    AgentState, Candidate, RoutingOutcome, Task, TaskPriority, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    notify_detached, ConductorError, ConductorResult, LogNotifier, Notification,
    NotificationKind, Notifier, Payload,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const IDLE_POLL: Duration = Duration::from_millis(200);
const PRUNE_EVERY: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 256;

/// Executes tasks on behalf of one agent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run `task` and return its output. Errors that are retryable re-route the task.
    async fn handle(&self, task: &Task) -> ConductorResult<Payload>;
}

/// Lifecycle events broadcast to [`TaskScheduler::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Accepted into the queue.
    Submitted {
        /// Task id.
        task_id: Uuid,
        /// Queue priority.
        priority: TaskPriority,
    },
    /// Handed to an agent.
    Routed {
        /// Task id.
        task_id: Uuid,
        /// Chosen agent.
        agent: String,
        /// Zero-based attempt number.
        attempt: u32,
    },
    /// No eligible agent; the task waits and is retried later.
    Held {
        /// Task id.
        task_id: Uuid,
        /// Time on hold so far.
        held_ms: u64,
    },
    /// The agent returned a result.
    Completed {
        /// Task id.
        task_id: Uuid,
        /// Agent that finished it.
        agent: String,
        /// Handler latency.
        latency_ms: u64,
    },
    /// Out of attempts or undeliverable.
    Failed {
        /// Task id.
        task_id: Uuid,
        /// Last error.
        error: String,
    },
    /// Vetoed or cancelled.
    Cancelled {
        /// Task id.
        task_id: Uuid,
        /// Why.
        reason: String,
    },
}

/// Task counts. Pruned tasks stay counted under their final status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Every task ever submitted.
    pub submitted: usize,
    /// Waiting in the queue or on hold.
    pub pending: usize,
    /// Dispatched and not finished.
    pub running: usize,
    /// Finished with a result.
    pub completed: usize,
    /// Finished without one.
    pub failed: usize,
    /// Vetoed or cancelled.
    pub cancelled: usize,
    /// Executions that failed and were handed to another agent.
    pub rerouted: u64,
    /// Times a task could not be routed and was put on hold.
    pub holds: u64,
}

/// Everything `conductor stats` prints, as written by
/// [`TaskScheduler::write_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Task counts.
    pub tasks: SchedulerStats,
    /// One entry per registered agent.
    pub agents: Vec<AgentState>,
    /// Router counters.
    pub router: RouterStats,
    /// Consensus counters.
    pub consensus: ConsensusStats,
}

/// Routes queued tasks to agents and runs them on a worker pool.
pub struct TaskScheduler {
    config: SchedulerConfig,
    registry: Arc<AgentRegistry>,
    router: Arc<AdaptiveRouter>,
    consensus: Arc<ConsensusGate>,
    voters: Vec<Voter>,
    ballot: Arc<dyn Ballot>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    queue: Mutex<PriorityTaskQueue>,
    wake: Notify,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: AtomicBool,
    rerouted: AtomicU64,
    holds: AtomicU64,
    last_prune: Mutex<Instant>,
}

impl TaskScheduler {
    /// Without [`TaskScheduler::with_ballot`] there are no voters, so every
    /// task that requires approval is rejected.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<AgentRegistry>,
        router: Arc<AdaptiveRouter>,
        consensus: Arc<ConsensusGate>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry,
            router,
            consensus,
            voters: Vec::new(),
            ballot: Arc::new(StaticBallot::new(false)),
            handlers: RwLock::new(HashMap::new()),
            queue: Mutex::new(PriorityTaskQueue::new()),
            wake: Notify::new(),
            notifier: Arc::new(LogNotifier),
            events,
            shutdown: AtomicBool::new(false),
            rerouted: AtomicU64::new(0),
            holds: AtomicU64::new(0),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Send exhaustion and undeliverable notices to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Voters and ballot for tasks that require approval.
    pub fn with_ballot(mut self, voters: Vec<Voter>, ballot: Arc<dyn Ballot>) -> Self {
        self.voters = voters;
        self.ballot = ballot;
        self
    }

    /// Only agents with a handler are offered to the router.
    pub fn register_handler(&self, agent: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(agent.into(), handler);
    }

    /// Agent health.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Adaptive router.
    pub fn router(&self) -> &Arc<AdaptiveRouter> {
        &self.router
    }

    /// Consensus gate.
    pub fn consensus(&self) -> &Arc<ConsensusGate> {
        &self.consensus
    }

    /// Enqueue a task. Its status is reset to `Pending`.
    pub fn submit(&self, mut task: Task) -> Uuid {
        task.status = TaskStatus::Pending;
        let priority = task.priority;
        let id = self.queue.lock().add(task);
        debug!(task_id = %id, %priority, "Task submitted");
        self.emit(TaskEvent::Submitted {
            task_id: id,
            priority,
        });
        self.wake.notify_one();
        id
    }

    /// Spawn `workers` worker loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        info!(workers, "Starting scheduler");
        (0..workers)
            .map(|worker| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.worker_loop(worker).await })
            })
            .collect()
    }

    /// Ask workers to stop after their current task.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Cancel a task that has not started running.
    pub fn cancel(&self, id: Uuid) -> ConductorResult<()> {
        {
            let mut queue = self.queue.lock();
            let task = queue
                .get_mut(id)
                .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))?;
            if task.status != TaskStatus::Pending {
                return Err(ConductorError::StateConflict(format!(
                    "Task {id} is {:?}, only pending tasks can be cancelled",
                    task.status
                )));
            }
            task.transition(TaskStatus::Cancelled)?;
            queue.clear_hold(id);
        }
        info!(task_id = %id, "Task cancelled");
        self.emit(TaskEvent::Cancelled {
            task_id: id,
            reason: "cancelled by caller".to_string(),
        });
        Ok(())
    }

    /// Current state of a task, unless it was pruned.
    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.queue.lock().get(id).cloned()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Task counts.
    pub fn stats(&self) -> SchedulerStats {
        let queue = self.queue.lock();
        SchedulerStats {
            submitted: queue.total_count(),
            pending: queue.pending_count(),
            running: queue.count_status(TaskStatus::Running),
            completed: queue.completed_count(),
            failed: queue.count_status(TaskStatus::Failed),
            cancelled: queue.count_status(TaskStatus::Cancelled),
            rerouted: self.rerouted.load(Ordering::Relaxed),
            holds: self.holds.load(Ordering::Relaxed),
        }
    }

    /// Stats from every component.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            generated_at: Utc::now(),
            tasks: self.stats(),
            agents: self.registry.snapshot(),
            router: self.router.stats(),
            consensus: self.consensus.stats(),
        }
    }

    /// Write [`TaskScheduler::snapshot`] as pretty JSON.
    pub async fn write_stats(&self, path: &Path) -> ConductorResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        debug!(path = %path.display(), "Wrote scheduler stats");
        Ok(())
    }

    /// Forget finished tasks last updated more than `older_than` ago, along
    /// with their consensus decisions. Stats keep counting them.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let pruned = self.queue.lock().prune_finished(cutoff);
        for id in &pruned {
            self.consensus.forget(&decision_id(*id));
        }
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "Pruned finished tasks");
        }
        pruned.len()
    }

    /// Wait until every submitted task is terminal. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.lock().is_done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            self.prune_if_due();
            let next = self.queue.lock().pop_next();
            match next {
                Some(id) => self.process(id).await,
                None => {
                    let _ = tokio::time::timeout(IDLE_POLL, self.wake.notified()).await;
                }
            }
        }
        debug!(worker, "Worker stopped");
    }

    fn prune_if_due(&self) {
        {
            let mut last = self.last_prune.lock();
            if last.elapsed() < PRUNE_EVERY {
                return;
            }
            *last = Instant::now();
        }
        self.prune_finished(self.config.retain_finished());
    }

    async fn process(self: &Arc<Self>, id: Uuid) {
        loop {
            let Some(task) = self.task(id) else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }

            let candidates = self.candidates_for(&task);
            let agent = match self.router.select_agent(&task, &candidates) {
                Ok(agent) => agent,
                Err(e) => {
                    self.on_exhausted(id, e);
                    return;
                }
            };

            let attempt = {
                let mut queue = self.queue.lock();
                queue.clear_hold(id);
                match queue.get_mut(id) {
                    Some(t) => t.record_routing(&agent),
                    None => return,
                }
            };
            self.emit(TaskEvent::Routed {
                task_id: id,
                agent: agent.clone(),
                attempt,
            });

            if task.requires_approval && !self.approve(id, &agent).await {
                return;
            }

            let snapshot = match self.update_task(id, |t| {
                t.transition(TaskStatus::Running)?;
                Ok(t.clone())
            }) {
                Ok(t) => t,
                Err(e) => {
                    // Cancelled between pop and dispatch.
                    debug!(task_id = %id, error = %e, "Task no longer runnable");
                    return;
                }
            };

            if !self.execute(&snapshot, &agent).await {
                return;
            }
        }
    }

    /// Run one attempt on `agent`. Returns `true` when the task should be
    /// routed again.
    async fn execute(&self, task: &Task, agent: &str) -> bool {
        let handler = self.handlers.read().get(agent).cloned();
        self.registry_call(agent, self.registry.begin_task(agent));

        let timeout = self.config.task_timeout();
        let started = Instant::now();
        let result = match handler {
            Some(handler) => tokio::time::timeout(timeout, handler.handle(task))
                .await
                .unwrap_or(Err(ConductorError::Timeout(timeout))),
            None => Err(ConductorError::Handler(format!(
                "No handler registered for agent '{agent}'"
            ))),
        };
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;
        self.registry_call(agent, self.registry.finish_task(agent));

        let error_rate = self
            .registry
            .get_state(agent)
            .map(|s| s.error_rate())
            .unwrap_or(0.0);
        let reward = self.router.reward(RewardSignal {
            success: result.is_ok(),
            latency,
            error_rate,
            priority: task.priority,
        });
        self.router.update(task, agent, reward);

        match result {
            Ok(output) => {
                self.registry_call(agent, self.registry.mark_success(agent));
                let done = self.update_task(task.id, |t| {
                    t.close_routing(RoutingOutcome::Succeeded, Some(latency_ms), None);
                    t.result = Some(output);
                    t.transition(TaskStatus::Completed)
                });
                if let Err(e) = done {
                    warn!(task_id = %task.id, error = %e, "Could not record completion");
                    return false;
                }
                info!(task_id = %task.id, agent, latency_ms, reward, "Task completed");
                self.emit(TaskEvent::Completed {
                    task_id: task.id,
                    agent: agent.to_string(),
                    latency_ms,
                });
                false
            }
            Err(e) => {
                self.registry_call(agent, self.registry.mark_failure(agent));
                let outcome = if matches!(e, ConductorError::Timeout(_)) {
                    RoutingOutcome::TimedOut
                } else {
                    RoutingOutcome::Failed
                };
                let failures = self
                    .update_task(task.id, |t| {
                        t.close_routing(outcome, Some(latency_ms), Some(e.to_string()));
                        t.retry_count += 1;
                        Ok(t.retry_count)
                    })
                    .unwrap_or(u32::MAX);

                let budget = self.config.max_task_attempts.max(1);
                if e.is_retryable() && failures < budget {
                    warn!(
                        task_id = %task.id,
                        agent,
                        attempt = failures,
                        error = %e,
                        "Task attempt failed, re-routing"
                    );
                    self.rerouted.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    self.fail_task(task.id, &e, NotificationKind::TaskFailed, failures);
                    false
                }
            }
        }
    }

    /// Agents offered to the router: eligible, with a handler, and not one
    /// that already failed this task unless nobody else is left.
    fn candidates_for(&self, task: &Task) -> Vec<Candidate> {
        let handlers = self.handlers.read();
        let candidates: Vec<Candidate> = self
            .registry
            .candidates(task.category)
            .into_iter()
            .filter(|c| handlers.contains_key(&c.name))
            .collect();
        let failed = task.failed_agents();
        let fresh: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !failed.contains(&c.name.as_str()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            candidates
        } else {
            fresh
        }
    }

    /// Consensus for a risk-flagged task. A decision already on record for
    /// the task is reused.
    async fn approve(&self, id: Uuid, agent: &str) -> bool {
        let key = decision_id(id);
        let decision: Result<ConsensusDecision, ConductorError> =
            match self.consensus.decision(&key) {
                Some(d) => Ok(d),
                None => {
                    match self
                        .consensus
                        .propose(&key, agent, &self.voters, self.ballot.as_ref())
                        .await
                    {
                        Ok(d) => Ok(d),
                        Err(e) => self.consensus.decision(&key).ok_or(e),
                    }
                }
            };

        let reason = match decision {
            Ok(d) if d.is_approved() => return true,
            Ok(d) => format!(
                "rejected by consensus ({:.2} of {:.2} weight)",
                d.yes_weight, d.total_weight
            ),
            Err(e) => format!("consensus unavailable: {e}"),
        };

        warn!(task_id = %id, agent, reason = %reason, "Task vetoed");
        let cancelled = self.update_task(id, |t| {
            t.close_routing(RoutingOutcome::Rejected, None, Some(reason.clone()));
            t.error = Some(reason.clone());
            t.transition(TaskStatus::Cancelled)
        });
        if cancelled.is_ok() {
            self.emit(TaskEvent::Cancelled {
                task_id: id,
                reason,
            });
        }
        false
    }

    /// No eligible agent. The task is held and routing is retried later,
    /// until an agent recovers or the task becomes undeliverable. A task
    /// waiting to be re-routed after a failed attempt stays `Running`.
    fn on_exhausted(self: &Arc<Self>, id: Uuid, err: ConductorError) {
        let (held, attempts) = {
            let mut queue = self.queue.lock();
            let held = queue.hold(id, Instant::now());
            let attempts = queue.get(id).map(|t| t.retry_count).unwrap_or(0);
            (held, attempts)
        };
        if held >= self.config.undeliverable_after() {
            self.queue.lock().clear_hold(id);
            self.fail_task(id, &err, NotificationKind::TaskUndeliverable, attempts);
            return;
        }

        self.holds.fetch_add(1, Ordering::Relaxed);
        let held_ms = held.as_millis() as u64;
        debug!(task_id = %id, held_ms, error = %err, "No eligible agent, holding task");
        self.emit(TaskEvent::Held {
            task_id: id,
            held_ms,
        });

        let this = Arc::clone(self);
        let delay = self.config.hold_retry();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.queue.lock().requeue(id) {
                this.wake.notify_one();
            }
        });
    }

    fn fail_task(&self, id: Uuid, err: &ConductorError, kind: NotificationKind, attempts: u32) {
        let message = err.to_string();
        let failed = self.update_task(id, |t| {
            t.error = Some(message.clone());
            t.transition(TaskStatus::Failed)
        });
        if let Err(e) = failed {
            warn!(task_id = %id, error = %e, "Could not mark task failed");
            return;
        }
        error!(task_id = %id, attempts, error = %message, "Task failed");
        notify_detached(
            Arc::clone(&self.notifier),
            Notification::new(kind, id.to_string(), message.clone()).with_step("dispatch", attempts),
        );
        self.emit(TaskEvent::Failed {
            task_id: id,
            error: message,
        });
    }

    fn update_task<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Task) -> ConductorResult<R>,
    ) -> ConductorResult<R> {
        let mut queue = self.queue.lock();
        let task = queue
            .get_mut(id)
            .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))?;
        f(task)
    }

    fn registry_call(&self, agent: &str, result: ConductorResult<impl Sized>) {
        if let Err(e) = result {
            warn!(agent, error = %e, "Registry update failed");
        }
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn decision_id(task_id: Uuid) -> String {
    format!("task:{task_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{RegistryConfig, RouterConfig};
    use crate::types::TaskCategory;
    use std::collections::BTreeMap;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, task: &Task) -> ConductorResult<Payload> {
            Ok(task.params.clone())
        }
    }

    fn scheduler(agents: &[&str]) -> Arc<TaskScheduler> {
        let mut categories = BTreeMap::new();
        categories.insert(
            TaskCategory::Research,
            agents.iter().map(|a| a.to_string()).collect(),
        );
        let registry = Arc::new(AgentRegistry::new(categories, RegistryConfig::default()));
        let router = Arc::new(AdaptiveRouter::new(RouterConfig {
            seed: Some(1),
            ..RouterConfig::default()
        }));
        let consensus = Arc::new(ConsensusGate::new(2.0 / 3.0));
        let config = SchedulerConfig {
            workers: 2,
            hold_retry_ms: 10,
            undeliverable_after_ms: 50,
            ..SchedulerConfig::default()
        };
        Arc::new(TaskScheduler::new(config, registry, router, consensus))
    }

    #[test]
    fn test_submit_and_cancel() {
        let sched = scheduler(&["alpha"]);
        let id = sched.submit(Task::new("lookup", TaskCategory::Research));
        assert_eq!(sched.stats().pending, 1);
        sched.cancel(id).unwrap();
        assert_eq!(sched.task(id).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(
            sched.cancel(id),
            Err(ConductorError::StateConflict(_))
        ));
        assert!(matches!(
            sched.cancel(Uuid::new_v4()),
            Err(ConductorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_task_to_completion() {
        let sched = scheduler(&["alpha"]);
        sched.register_handler("alpha", Arc::new(Echo));
        let mut events = sched.subscribe();
        let handles = sched.start();

        let mut params = Payload::new();
        params.insert("q".into(), serde_json::json!("rust"));
        let id = sched.submit(Task::new("lookup", TaskCategory::Research).with_params(params));
        assert!(sched.drain(Duration::from_secs(2)).await);

        let task = sched.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agent.as_deref(), Some("alpha"));
        assert_eq!(task.result.unwrap()["q"], "rust");
        assert_eq!(task.routing_history[0].outcome, RoutingOutcome::Succeeded);

        assert!(matches!(events.recv().await.unwrap(), TaskEvent::Submitted { .. }));
        sched.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_no_handler_means_undeliverable() {
        let sched = scheduler(&["alpha"]);
        let handles = sched.start();
        let id = sched.submit(Task::new("lookup", TaskCategory::Research));
        assert!(sched.drain(Duration::from_secs(2)).await);

        let task = sched.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("No eligible agent"));
        assert!(sched.stats().holds >= 1);
        sched.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_approval_without_voters_is_rejected() {
        let sched = scheduler(&["alpha"]);
        sched.register_handler("alpha", Arc::new(Echo));
        let handles = sched.start();
        let id = sched.submit(Task::new("wire_funds", TaskCategory::Research).requiring_approval());
        assert!(sched.drain(Duration::from_secs(2)).await);

        let task = sched.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.routing_history[0].outcome, RoutingOutcome::Rejected);
        assert!(task.result.is_none());
        sched.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }
}
