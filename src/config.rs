//! Configuration types for flowsmith.
//!
//! All knobs for the task engine, the batch dispatcher, and the document
//! pipeline live here. Configuration is immutable once an engine instance is
//! constructed; tune a config, validate it, then hand it over.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one [`TaskEngine`](crate::engine::TaskEngine) instance.
///
/// Defaults are conservative enough for a typical rate-limited AI API.
/// Two engines pointed at the same upstream service do **not** share a rate
/// budget — split the caps between them yourself.
///
/// # Examples
///
/// ```rust
/// use flowsmith::config::EngineConfig;
///
/// let config = EngineConfig {
///     max_concurrency: 4,
///     max_requests_per_minute: 120,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks executing at once
    pub max_concurrency: usize,

    /// Maximum number of items the batch dispatcher coalesces per call
    pub max_batch_size: usize,

    /// Admission cap over any trailing 60 second window
    pub max_requests_per_minute: usize,

    /// Admission cap over any trailing 1 second window
    pub max_requests_per_second: usize,

    /// Maximum retry attempts for a retryable failure
    pub max_retries: u32,

    /// Base delay before the first retry (in milliseconds)
    pub retry_delay_ms: u64,

    /// Multiplier applied per additional retry attempt
    pub backoff_multiplier: f64,

    /// Process memory threshold for backpressure throttling (in MB)
    pub max_memory_mb: u64,

    /// Maximum number of queued-but-not-dispatched tasks
    pub max_queue_size: usize,

    /// Whether to run the periodic metrics sampler
    pub enable_metrics: bool,

    /// Interval between metrics snapshots (in milliseconds)
    pub metrics_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().clamp(1, 5),
            max_batch_size: 10,
            max_requests_per_minute: 60,
            max_requests_per_second: 10,
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_memory_mb: 512,
            max_queue_size: 1000,
            enable_metrics: true,
            metrics_interval_ms: 5000,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with a specific concurrency cap.
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Default::default()
        }
    }

    /// Set the per-second and per-minute admission caps.
    pub fn with_rate_limits(mut self, per_second: usize, per_minute: usize) -> Self {
        self.max_requests_per_second = per_second;
        self.max_requests_per_minute = per_minute;
        self
    }

    /// Set the retry policy.
    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Disable the metrics sampler.
    pub fn without_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    /// Base retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Metrics sampling interval as a [`Duration`].
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Backoff delay before retry attempt `attempt` (1-based), no jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let millis = self.retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis(millis as u64)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_concurrency == 0 {
            errors.push("max_concurrency must be greater than 0".to_string());
        }
        if self.max_batch_size == 0 {
            errors.push("max_batch_size must be greater than 0".to_string());
        }
        if self.max_requests_per_second == 0 {
            errors.push("max_requests_per_second must be greater than 0".to_string());
        }
        if self.max_requests_per_minute == 0 {
            errors.push("max_requests_per_minute must be greater than 0".to_string());
        }
        if self.max_requests_per_minute < self.max_requests_per_second {
            errors.push(
                "max_requests_per_minute must be at least max_requests_per_second".to_string(),
            );
        }
        if self.retry_delay_ms == 0 {
            errors.push("retry_delay_ms must be greater than 0".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            errors.push("backoff_multiplier must be at least 1.0".to_string());
        }
        if self.max_queue_size == 0 {
            errors.push("max_queue_size must be greater than 0".to_string());
        }
        if self.enable_metrics && self.metrics_interval_ms == 0 {
            errors.push("metrics_interval_ms must be greater than 0".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Configuration for the [`BatchDispatcher`](crate::batch::BatchDispatcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush immediately once this many items are buffered
    pub max_batch_size: usize,

    /// Flush a partial batch after this long (in milliseconds)
    pub max_batch_delay_ms: u64,

    /// Engine driving the batch calls themselves
    pub engine: EngineConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay_ms: 100,
            engine: EngineConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Flush delay as a [`Duration`].
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_batch_size == 0 {
            errors.push("max_batch_size must be greater than 0".to_string());
        }
        if self.max_batch_delay_ms == 0 {
            errors.push("max_batch_delay_ms must be greater than 0".to_string());
        }
        if let Err(engine_errors) = self.engine.validate() {
            errors.extend(engine_errors);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Configuration for the [`DocumentPipeline`](crate::pipeline::DocumentPipeline).
///
/// Each stage gets its own engine so analysis and embedding caps can be tuned
/// independently against their respective upstream services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Engine for per-chunk analysis calls
    pub analysis: EngineConfig,

    /// Engine for per-chunk embedding calls
    pub embedding: EngineConfig,

    /// Engine for whole-document fan-out
    pub documents: EngineConfig,

    /// Whether to run the summarization stage when a summarizer is supplied
    pub summarize: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis: EngineConfig {
                max_concurrency: 3,
                max_requests_per_minute: 50,
                max_requests_per_second: 2,
                ..Default::default()
            },
            embedding: EngineConfig {
                max_concurrency: 5,
                max_requests_per_minute: 100,
                max_requests_per_second: 5,
                ..Default::default()
            },
            documents: EngineConfig {
                max_concurrency: 2,
                max_requests_per_minute: 30,
                max_requests_per_second: 2,
                enable_metrics: false,
                ..Default::default()
            },
            summarize: true,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (stage, config) in [
            ("analysis", &self.analysis),
            ("embedding", &self.embedding),
            ("documents", &self.documents),
        ] {
            if let Err(stage_errors) = config.validate() {
                errors.extend(stage_errors.into_iter().map(|e| format!("{stage}: {e}")));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
