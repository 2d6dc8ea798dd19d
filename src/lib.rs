//! # Flowsmith
//!
//! A rate-limited, bounded-concurrency task execution engine for Rust
//! applications that call external AI and embedding services.
//!
//! ## Features
//!
//! - **Bounded Concurrency**: A shared semaphore caps in-flight work
//! - **Rate Limiting**: Sliding per-second and per-minute request windows
//! - **Retry with Backoff**: Exponential backoff for transient failures
//! - **Memory Backpressure**: Dispatch pauses when process memory is high
//! - **Request Batching**: Coalesce individual calls into batched requests
//! - **Document Pipeline**: Multi-stage extract/analyze/embed orchestration
//! - **Observability**: Structured logging and periodic metrics events
//!
//! ## Quick Start
//!
//! ```rust
//! use flowsmith::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::with_concurrency(4).with_rate_limits(10, 300);
//!     let engine = TaskEngine::new(config)?;
//!
//!     let reports = engine
//!         .run_all(
//!             vec!["alpha".to_string(), "beta".to_string()],
//!             |input| async move { Ok(input.to_uppercase()) },
//!             RunOptions::default(),
//!         )
//!         .await?;
//!
//!     for report in &reports {
//!         println!("{:?}", report.output());
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod pipeline;
pub mod task;

pub mod prelude {
    pub use crate::batch::BatchDispatcher;
    pub use crate::config::{BatchConfig, EngineConfig, PipelineConfig};
    pub use crate::engine::{EngineEvent, MetricsSnapshot, RunOptions, TaskEngine};
    pub use crate::error::{BatchError, EngineError, EngineResult, WorkerError};
    pub use crate::limiter::RateLimiter;
    pub use crate::pipeline::{
        DocumentInput, DocumentPipeline, DocumentReport, PipelineProgress, ProcessOptions,
        ProcessingStage,
    };
    pub use crate::task::{Task, TaskId, TaskReport};
    pub use async_trait::async_trait;
}

pub use crate::batch::BatchDispatcher;
pub use crate::config::{BatchConfig, EngineConfig, PipelineConfig};
pub use crate::engine::{EngineEvent, MetricsSnapshot, RunOptions, TaskEngine};
pub use crate::error::{BatchError, EngineError, EngineResult, WorkerError};
pub use crate::limiter::RateLimiter;
pub use crate::pipeline::{
    DocumentInput, DocumentPipeline, DocumentReport, PipelineProgress, ProcessOptions,
    ProcessingStage,
};
pub use crate::task::{Task, TaskId, TaskReport};
pub use async_trait::async_trait;
