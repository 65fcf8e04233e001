use crate::types::{Task, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    id: Uuid,
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of tasks plus the table of live and recently finished ones.
///
/// Ordering is priority first, then submission order. Finished tasks stay
/// readable until [`PriorityTaskQueue::prune_finished`] drops them; the
/// counts keep including them.
pub struct PriorityTaskQueue {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<Uuid, Task>,
    held_since: HashMap<Uuid, Instant>,
    pruned: HashMap<TaskStatus, usize>,
    next_seq: u64,
}

impl PriorityTaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            held_since: HashMap::new(),
            pruned: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add a task to the queue.
    pub fn add(&mut self, task: Task) -> Uuid {
        let id = task.id;
        let priority = task.priority;
        self.tasks.insert(id, task);
        self.enqueue(id, priority);
        id
    }

    /// Put an already-known task back in line after its hold expires.
    pub fn requeue(&mut self, id: Uuid) -> bool {
        if !self.is_dispatchable(id) {
            return false;
        }
        let Some(priority) = self.tasks.get(&id).map(|t| t.priority) else {
            return false;
        };
        self.enqueue(id, priority);
        true
    }

    /// Pop the next dispatchable task id. Entries for tasks that were
    /// cancelled, finished or pruned in the meantime are discarded.
    pub fn pop_next(&mut self) -> Option<Uuid> {
        while let Some(entry) = self.heap.pop() {
            if self.is_dispatchable(entry.id) {
                return Some(entry.id);
            }
        }
        None
    }

    /// Pending tasks, plus running ones held after every agent that could
    /// take the next attempt became ineligible.
    fn is_dispatchable(&self, id: Uuid) -> bool {
        match self.tasks.get(&id).map(|t| t.status) {
            Some(TaskStatus::Pending) => true,
            Some(TaskStatus::Running) => self.held_since.contains_key(&id),
            _ => false,
        }
    }

    /// Start (or continue) holding a task that could not be routed.
    /// Returns how long it has been held.
    pub fn hold(&mut self, id: Uuid, now: Instant) -> Duration {
        let since = *self.held_since.entry(id).or_insert(now);
        now.saturating_duration_since(since)
    }

    /// Stop tracking the hold on `id`.
    pub fn clear_hold(&mut self, id: Uuid) {
        self.held_since.remove(&id);
    }

    /// Tasks currently on hold.
    pub fn held_count(&self) -> usize {
        self.held_since.len()
    }

    /// Get a task by ID.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Mutable access for status transitions.
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Drop terminal tasks last updated before `cutoff` and return their ids.
    pub fn prune_finished(&mut self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id)
            .collect();
        for id in &expired {
            if let Some(task) = self.tasks.remove(id) {
                *self.pruned.entry(task.status).or_default() += 1;
            }
            self.held_since.remove(id);
        }
        expired
    }

    /// Tasks in `status`, pruned ones included.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        let live = self.tasks.values().filter(|t| t.status == status).count();
        live + self.pruned.get(&status).copied().unwrap_or(0)
    }

    /// Tasks still held in memory.
    pub fn live_count(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks waiting to be dispatched.
    pub fn pending_count(&self) -> usize {
        self.count_status(TaskStatus::Pending)
    }

    /// Tasks that finished successfully, pruned ones included.
    pub fn completed_count(&self) -> usize {
        self.count_status(TaskStatus::Completed)
    }

    /// Every task ever submitted, pruned ones included.
    pub fn total_count(&self) -> usize {
        self.tasks.len() + self.pruned.values().sum::<usize>()
    }

    /// Check if every task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    fn enqueue(&mut self, id: Uuid, priority: TaskPriority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { priority, seq, id });
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
