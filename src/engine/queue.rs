//! Bounded priority queues for not-yet-dispatched tasks.
//!
//! Each `run_all`/`run_stream` invocation owns a private [`TaskQueue`], so
//! overlapping runs on one engine never dispatch each other's tasks. The
//! [`RunRegistry`] holds every live run's queue behind one lock, enforcing
//! the engine-wide capacity across them and giving `metrics()` and
//! `clear_queue()` a single place to look.

use crate::error::EngineError;
use crate::task::Task;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Heap entry ordering: higher priority first, earlier submission first
/// among equals.
struct QueueEntry<I> {
    task: Task<I>,
    seq: u64,
}

impl<I> PartialEq for QueueEntry<I> {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl<I> Eq for QueueEntry<I> {}

impl<I> PartialOrd for QueueEntry<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I> Ord for QueueEntry<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: priority ascending, then seq descending
        // so that the smaller sequence number wins among equal priorities.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue for one run's pending tasks.
struct TaskQueue<I> {
    heap: BinaryHeap<QueueEntry<I>>,
    next_seq: u64,
}

impl<I> TaskQueue<I> {
    fn new(tasks: Vec<Task<I>>) -> Self {
        let mut queue = Self {
            heap: BinaryHeap::with_capacity(tasks.len()),
            next_seq: 0,
        };
        for task in tasks {
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(QueueEntry { task, seq });
        }
        queue
    }

    fn pop(&mut self) -> Option<Task<I>> {
        self.heap.pop().map(|entry| entry.task)
    }
}

/// Identifier of one live run's queue within the registry.
pub(crate) type RunId = u64;

/// All live run queues of one engine, behind one lock.
///
/// Capacity is engine-wide: a submission is rejected when the total queued
/// across every live run would exceed `max_size`. Rejection is atomic per
/// submission; either every task is accepted or none is.
pub(crate) struct RunRegistry<I> {
    runs: HashMap<RunId, TaskQueue<I>>,
    max_size: usize,
    next_run: RunId,
}

impl<I> RunRegistry<I> {
    pub fn new(max_size: usize) -> Self {
        Self {
            runs: HashMap::new(),
            max_size,
            next_run: 0,
        }
    }

    /// Open a new run holding `tasks`, or fail with
    /// [`EngineError::QueueOverflow`] if they do not all fit under the
    /// engine-wide capacity.
    pub fn submit(&mut self, tasks: Vec<Task<I>>) -> Result<RunId, EngineError> {
        let available = self.max_size.saturating_sub(self.len());
        if tasks.len() > available {
            return Err(EngineError::QueueOverflow {
                submitted: tasks.len(),
                available,
                max_queue_size: self.max_size,
            });
        }

        let run = self.next_run;
        self.next_run += 1;
        self.runs.insert(run, TaskQueue::new(tasks));
        Ok(run)
    }

    /// Remove and return the highest-priority task of one run.
    pub fn pop(&mut self, run: RunId) -> Option<Task<I>> {
        self.runs.get_mut(&run).and_then(TaskQueue::pop)
    }

    /// Whether one run has no queued tasks left. A cleared or removed run
    /// counts as empty.
    pub fn is_run_empty(&self, run: RunId) -> bool {
        self.runs
            .get(&run)
            .is_none_or(|queue| queue.heap.is_empty())
    }

    /// Drop one run's queue entirely, returning how many queued tasks went
    /// with it.
    pub fn remove_run(&mut self, run: RunId) -> usize {
        self.runs
            .remove(&run)
            .map_or(0, |queue| queue.heap.len())
    }

    /// Total queued tasks across every live run.
    pub fn len(&self) -> usize {
        self.runs.values().map(|queue| queue.heap.len()).sum()
    }

    /// Discard every queued task of every run, returning how many were
    /// dropped. The runs themselves stay open; their dispatch loops see an
    /// empty queue and finish.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for queue in self.runs.values_mut() {
            dropped += queue.heap.len();
            queue.heap.clear();
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_within_run() {
        let mut registry = RunRegistry::new(10);
        let run = registry
            .submit(vec![
                Task::with_priority("low", 1),
                Task::with_priority("high", 10),
                Task::with_priority("mid", 5),
            ])
            .unwrap();

        assert_eq!(registry.pop(run).unwrap().payload, "high");
        assert_eq!(registry.pop(run).unwrap().payload, "mid");
        assert_eq!(registry.pop(run).unwrap().payload, "low");
        assert!(registry.is_run_empty(run));
    }

    #[test]
    fn test_equal_priority_fifo() {
        let mut registry = RunRegistry::new(10);
        let run = registry
            .submit(["first", "second", "third"].map(Task::new).into())
            .unwrap();

        assert_eq!(registry.pop(run).unwrap().payload, "first");
        assert_eq!(registry.pop(run).unwrap().payload, "second");
        assert_eq!(registry.pop(run).unwrap().payload, "third");
    }

    #[test]
    fn test_runs_are_isolated() {
        let mut registry = RunRegistry::new(10);
        let first = registry.submit(vec![Task::new("a1"), Task::new("a2")]).unwrap();
        let second = registry.submit(vec![Task::new("b1")]).unwrap();

        // Popping one run never yields another run's task.
        assert_eq!(registry.pop(second).unwrap().payload, "b1");
        assert!(registry.is_run_empty(second));
        assert_eq!(registry.pop(first).unwrap().payload, "a1");
        assert_eq!(registry.pop(first).unwrap().payload, "a2");
    }

    #[test]
    fn test_capacity_spans_all_runs() {
        let mut registry = RunRegistry::new(3);
        registry.submit(vec![Task::new(1)]).unwrap();

        let rejected: Vec<_> = (0..5).map(Task::new).collect();
        let err = registry.submit(rejected).unwrap_err();
        assert!(matches!(
            err,
            EngineError::QueueOverflow {
                submitted: 5,
                available: 2,
                max_queue_size: 3,
            }
        ));

        // Nothing from the rejected submission was accepted.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_run_frees_capacity() {
        let mut registry = RunRegistry::new(3);
        let run = registry.submit(vec![Task::new(1), Task::new(2)]).unwrap();
        assert_eq!(registry.remove_run(run), 2);
        assert_eq!(registry.len(), 0);

        // The freed slots are reusable.
        registry.submit((0..3).map(Task::new).collect()).unwrap();
    }

    #[test]
    fn test_clear_empties_every_run() {
        let mut registry = RunRegistry::new(10);
        let first = registry.submit(vec![Task::new(1), Task::new(2)]).unwrap();
        let second = registry.submit(vec![Task::new(3)]).unwrap();

        assert_eq!(registry.clear(), 3);
        assert!(registry.is_run_empty(first));
        assert!(registry.is_run_empty(second));
        assert!(registry.pop(first).is_none());
    }
}
