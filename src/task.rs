//! Task and result types.
//!
//! A [`Task`] is one unit of work travelling through the engine; a
//! [`TaskReport`] is its terminal outcome. Worker failures are captured into
//! the report rather than propagated, so a batch run always produces exactly
//! one report per submitted item.

use crate::error::WorkerError;
use std::time::{Duration, Instant};

/// Unique identifier for a task
pub type TaskId = String;

/// One unit of work submitted to the engine.
///
/// Owned by the queue until dispatched, then by an in-flight execution slot,
/// then discarded once its [`TaskReport`] is produced.
#[derive(Debug)]
pub struct Task<I> {
    /// Unique task identifier
    pub id: TaskId,
    /// Input handed to the worker
    pub payload: I,
    /// Higher priority dispatches first
    pub priority: i32,
    /// Retry attempts consumed so far, mutated in place per attempt
    pub retry_count: u32,
    /// When the task was created
    pub created_at: Instant,
}

impl<I> Task<I> {
    /// Create a task with default priority.
    pub fn new(payload: I) -> Self {
        Self::with_priority(payload, 0)
    }

    /// Create a task with an explicit priority.
    pub fn with_priority(payload: I, priority: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            priority,
            retry_count: 0,
            created_at: Instant::now(),
        }
    }
}

/// Terminal outcome of one task, success or failure.
///
/// Never "thrown": [`run_all`](crate::engine::TaskEngine::run_all) and
/// [`run_stream`](crate::engine::TaskEngine::run_stream) return reports for
/// failures too, and callers check [`outcome`](TaskReport::outcome).
#[derive(Debug, Clone)]
pub struct TaskReport<O> {
    /// Identifier of the task this report belongs to
    pub id: TaskId,
    /// The worker's output, or the failure that exhausted retries
    pub outcome: Result<O, WorkerError>,
    /// Wall-clock time from first dispatch to terminal outcome
    pub duration: Duration,
    /// Retry attempts consumed (0 = succeeded or failed on first try)
    pub retries: u32,
}

impl<O> TaskReport<O> {
    /// Whether the task completed successfully
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The output, if the task succeeded
    pub fn output(&self) -> Option<&O> {
        self.outcome.as_ref().ok()
    }

    /// The failure, if the task failed
    pub fn error(&self) -> Option<&WorkerError> {
        self.outcome.as_ref().err()
    }
}
