//! Error types for flowsmith operations.

use std::sync::Arc;
use thiserror::Error;

/// Result type used throughout flowsmith.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the engine itself, as opposed to failures produced by a
/// caller-supplied worker.
///
/// Worker failures are never surfaced through this type — they end up inside
/// a [`TaskReport`](crate::task::TaskReport) so that one bad task cannot
/// abort a whole batch run.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Submission would exceed the configured queue capacity.
    ///
    /// Raised synchronously at enqueue time for the whole submission, never
    /// per-task, so callers can shed load before any work is dispatched.
    #[error(
        "queue overflow: {submitted} submitted but only {available} slots free (max {max_queue_size})"
    )]
    QueueOverflow {
        /// Number of tasks in the rejected submission
        submitted: usize,
        /// Remaining capacity at the time of submission
        available: usize,
        /// Configured queue capacity
        max_queue_size: usize,
    },

    /// Engine has been shut down and must not be reused.
    #[error("engine has been shut down")]
    ShutDown,

    /// Configuration error
    #[error("configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },
}

impl EngineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }
}

/// Failure produced by a caller-supplied worker, tagged for retryability.
///
/// Workers classify their own failures at the boundary instead of the engine
/// sniffing message text: only [`Transient`](WorkerError::Transient) and
/// [`RateLimited`](WorkerError::RateLimited) failures are eligible for
/// backoff retry. For foreign errors whose only signal *is* message text,
/// [`WorkerError::classify`] applies the usual connection/timeout/429/503
/// heuristics once, at the edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Transient network-class failure (connection reset, timeout, DNS)
    #[error("transient failure: {message}")]
    Transient {
        /// Error message
        message: String,
    },

    /// The upstream service signalled rate limiting (429/503-class)
    #[error("rate limited: {message}")]
    RateLimited {
        /// Error message
        message: String,
    },

    /// Permanent failure, never retried
    #[error("permanent failure: {message}")]
    Permanent {
        /// Error message
        message: String,
    },
}

impl WorkerError {
    /// Create a transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a rate-limited failure
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Create a permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Whether the engine may retry after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }

    /// Classify an untyped error message into the taxonomy.
    ///
    /// For adapters wrapping services that only expose stringly errors.
    /// Anything not recognisably transient is treated as permanent.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let rate_limited = lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
            || lower.contains("503");
        if rate_limited {
            return Self::RateLimited { message };
        }

        let transient = lower.contains("econnreset")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("dns")
            || lower.contains("enotfound");
        if transient {
            return Self::Transient { message };
        }

        Self::Permanent { message }
    }

    /// The failure message without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message }
            | Self::RateLimited { message }
            | Self::Permanent { message } => message,
        }
    }
}

/// Error delivered to every caller waiting on a coalesced batch.
///
/// A single batch-function failure rejects the whole batch, so the
/// underlying error is shared rather than cloned per caller.
#[derive(Error, Debug, Clone)]
pub enum BatchError {
    /// The batch function failed; every caller in the batch sees this error
    #[error("batch call failed: {0}")]
    Failed(Arc<WorkerError>),

    /// The batch function returned a different number of outputs than inputs
    #[error("batch output mismatch: {expected} inputs but {actual} outputs")]
    OutputMismatch {
        /// Items submitted in the batch
        expected: usize,
        /// Outputs the batch function returned
        actual: usize,
    },

    /// The dispatcher was shut down before this item's batch resolved
    #[error("batch dispatcher closed")]
    Closed,
}
