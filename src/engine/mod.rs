//! The flowsmith task engine.
//!
//! A [`TaskEngine`] is a bounded-concurrency executor for asynchronous,
//! I/O-bound work against rate-limited upstream services. It dispatches
//! tasks from a priority queue, acquires a rate-limiter admission per
//! attempt, retries transient failures with exponential backoff, throttles
//! on memory pressure, and publishes periodic metrics snapshots over a typed
//! event channel.
//!
//! Concurrency here means bounded interleaving of async calls on the Tokio
//! runtime, not multi-core parallel execution.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, WorkerError};
use crate::limiter::RateLimiter;
use crate::task::{Task, TaskId, TaskReport};
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub mod events;
pub mod metrics;

mod memory;
mod queue;

pub use events::EngineEvent;
pub use metrics::MetricsSnapshot;

use events::EventBus;
use memory::MemoryProbe;
use metrics::Counters;
use queue::{RunId, RunRegistry};

/// How often the dispatch loop re-checks while paused or waiting for the
/// queue to refill.
const DISPATCH_POLL: Duration = Duration::from_millis(20);

/// The registry lock is never held across an await point, so contention is
/// brief; a poisoned lock just means a panicking test thread.
fn lock_registry<I>(
    registry: &std::sync::Mutex<RunRegistry<I>>,
) -> std::sync::MutexGuard<'_, RunRegistry<I>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How often `shutdown()` re-checks the in-flight count while draining.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Progress callback for batch runs: `(completed, total)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for [`TaskEngine::run_all`] and [`TaskEngine::run_tasks`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Called after each task reaches its terminal outcome
    pub on_progress: Option<ProgressFn>,
    /// Reorder the final vec to match input order (dispatch and completion
    /// order are unaffected)
    pub preserve_order: bool,
}

impl RunOptions {
    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Return results in input order.
    pub fn preserve_order(mut self) -> Self {
        self.preserve_order = true;
        self
    }
}

/// Shared pieces every task execution needs; cloned cheaply into the
/// in-flight futures so they do not borrow the engine.
struct ExecutionContext {
    config: EngineConfig,
    limiter: Arc<RateLimiter>,
    memory: Arc<MemoryProbe>,
    counters: Arc<Counters>,
    concurrency: Arc<Semaphore>,
    events: EventBus,
}

/// Rate-limited, bounded-concurrency task executor.
///
/// One engine owns one rate-limiter window: two engines pointed at the same
/// upstream API do not share an admission budget.
///
/// # Examples
///
/// ```rust,no_run
/// use flowsmith::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> EngineResult<()> {
///     let engine = TaskEngine::new(EngineConfig::default())?;
///
///     let reports = engine
///         .run_all(
///             vec!["alpha", "beta", "gamma"],
///             |text| async move { Ok::<_, WorkerError>(text.len()) },
///             RunOptions::default(),
///         )
///         .await?;
///
///     assert!(reports.iter().all(|r| r.is_success()));
///     engine.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct TaskEngine<I> {
    ctx: Arc<ExecutionContext>,
    queue: Arc<std::sync::Mutex<RunRegistry<I>>>,
    paused: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
    sampler_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<I> TaskEngine<I>
where
    I: Clone + Send + 'static,
{
    /// Create an engine from a validated configuration.
    ///
    /// When `enable_metrics` is set this spawns the sampler task, so the
    /// engine must be constructed inside a Tokio runtime.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(EngineError::config(errors.join("; ")));
        }

        let limiter = Arc::new(RateLimiter::new(
            config.max_requests_per_second,
            config.max_requests_per_minute,
        ));
        let memory = Arc::new(MemoryProbe::new());
        let counters = Arc::new(Counters::default());
        let concurrency = Arc::new(Semaphore::new(config.max_concurrency));
        let events = EventBus::new();
        let queue = Arc::new(std::sync::Mutex::new(RunRegistry::new(config.max_queue_size)));

        let ctx = Arc::new(ExecutionContext {
            config,
            limiter,
            memory,
            counters,
            concurrency,
            events,
        });

        let sampler_handle = if ctx.config.enable_metrics {
            Some(Self::spawn_sampler(Arc::clone(&ctx), Arc::clone(&queue)))
        } else {
            None
        };

        Ok(Self {
            ctx,
            queue,
            paused: Arc::new(AtomicBool::new(false)),
            shut_down: Arc::new(AtomicBool::new(false)),
            sampler_handle: std::sync::Mutex::new(sampler_handle),
        })
    }

    /// Execute one task to completion, including retries.
    ///
    /// Worker failures never propagate as errors: the terminal outcome lands
    /// inside the returned [`TaskReport`]. Each attempt consumes one
    /// rate-limiter admission and the task holds a concurrency slot for its
    /// whole execution, so `run_one` calls count against `max_concurrency`
    /// alongside batch runs. Bypasses the queue and the pause gate.
    pub async fn run_one<O, W, F>(&self, task: Task<I>, worker: W) -> EngineResult<TaskReport<O>>
    where
        O: Send + 'static,
        W: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = Result<O, WorkerError>> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        self.ctx.counters.record_submitted(1);
        Ok(execute(Arc::clone(&self.ctx), Arc::new(worker), task).await)
    }

    /// Execute a set of items with default priority.
    ///
    /// Enqueues every item (failing synchronously with
    /// [`EngineError::QueueOverflow`] if they do not all fit), then
    /// dispatches up to `max_concurrency` at a time. Individual failures do
    /// not abort the run: the call resolves once every item has a terminal
    /// report. Results arrive in completion order unless
    /// [`RunOptions::preserve_order`] is set.
    pub async fn run_all<O, W, F>(
        &self,
        items: Vec<I>,
        worker: W,
        options: RunOptions,
    ) -> EngineResult<Vec<TaskReport<O>>>
    where
        O: Send + 'static,
        W: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = Result<O, WorkerError>> + Send + 'static,
    {
        let tasks: Vec<Task<I>> = items.into_iter().map(Task::new).collect();
        self.run_tasks(tasks, worker, options).await
    }

    /// Like [`run_all`](Self::run_all), for pre-built tasks carrying
    /// explicit priorities. Higher priority dispatches first; equal
    /// priorities dispatch in submission order.
    pub async fn run_tasks<O, W, F>(
        &self,
        tasks: Vec<Task<I>>,
        worker: W,
        options: RunOptions,
    ) -> EngineResult<Vec<TaskReport<O>>>
    where
        O: Send + 'static,
        W: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = Result<O, WorkerError>> + Send + 'static,
    {
        let total = tasks.len();
        let order: HashMap<TaskId, usize> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (task.id.clone(), index))
            .collect();

        let stream = self.submit_and_stream(tasks, worker).await?;
        futures::pin_mut!(stream);

        let mut reports = Vec::with_capacity(total);
        let mut completed = 0usize;
        while let Some(report) = stream.next().await {
            completed += 1;
            if let Some(on_progress) = &options.on_progress {
                on_progress(completed, total);
            }
            reports.push(report);
        }

        if options.preserve_order {
            reports.sort_by_key(|report| order.get(&report.id).copied().unwrap_or(usize::MAX));
        }
        Ok(reports)
    }

    /// Execute a set of items, yielding each [`TaskReport`] as soon as it is
    /// available.
    ///
    /// Same admission and dispatch logic as [`run_all`](Self::run_all),
    /// exposed as a finite, non-restartable stream.
    pub async fn run_stream<O, W, F>(
        &self,
        items: Vec<I>,
        worker: W,
    ) -> EngineResult<impl Stream<Item = TaskReport<O>> + Send>
    where
        O: Send + 'static,
        W: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = Result<O, WorkerError>> + Send + 'static,
    {
        let tasks: Vec<Task<I>> = items.into_iter().map(Task::new).collect();
        self.submit_and_stream(tasks, worker).await
    }

    /// Open a run holding the submission and return the dispatch-loop
    /// stream over it.
    ///
    /// The run's queue is private: overlapping runs on one engine share the
    /// concurrency semaphore, the rate limiter, and the counters, but each
    /// dispatch loop only ever pops the tasks it was given, so a report can
    /// never come from another run's worker.
    async fn submit_and_stream<O, W, F>(
        &self,
        tasks: Vec<Task<I>>,
        worker: W,
    ) -> EngineResult<impl Stream<Item = TaskReport<O>> + Send>
    where
        O: Send + 'static,
        W: Fn(I) -> F + Send + Sync + 'static,
        F: Future<Output = Result<O, WorkerError>> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let submitted = tasks.len();
        let run = lock_registry(&self.queue).submit(tasks)?;
        self.ctx.counters.record_submitted(submitted);
        tracing::debug!("enqueued {} tasks for run {}", submitted, run);

        let state = DispatchState {
            ctx: Arc::clone(&self.ctx),
            run: RunGuard {
                registry: Arc::clone(&self.queue),
                run,
            },
            paused: Arc::clone(&self.paused),
            worker: Arc::new(worker),
            in_flight: FuturesUnordered::new(),
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if !state.paused.load(Ordering::SeqCst) {
                    state.fill_in_flight();
                }

                match state.in_flight.next().await {
                    Some(report) => return Some((report, state)),
                    None => {
                        // Nothing executing: either paused, or this run's
                        // queue has drained. Drained and idle means the run
                        // is over.
                        if state.run.is_empty() {
                            return None;
                        }
                        sleep(DISPATCH_POLL).await;
                    }
                }
            }
        }))
    }

    /// Stop dispatching new tasks. In-flight tasks run to completion.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("engine paused");
            self.ctx.events.publish(EngineEvent::Paused);
        }
    }

    /// Allow dispatch again after a [`pause`](Self::pause).
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("engine resumed");
            self.ctx.events.publish(EngineEvent::Resumed);
        }
    }

    /// Discard all queued-but-not-dispatched tasks.
    ///
    /// Destructive: no report is ever emitted for a discarded task, so an
    /// in-progress `run_all` resolves with fewer reports than items.
    pub async fn clear_queue(&self) -> usize {
        let dropped = lock_registry(&self.queue).clear();
        if dropped > 0 {
            tracing::warn!("cleared {} queued tasks", dropped);
        }
        self.ctx.events.publish(EngineEvent::QueueCleared(dropped));
        dropped
    }

    /// Snapshot of the current counters.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let queue_length = lock_registry(&self.queue).len();
        let requests_per_minute = self.ctx.limiter.requests_per_minute().await;
        let memory_usage_mb = self.ctx.memory.usage_mb();
        self.ctx
            .counters
            .snapshot(queue_length, requests_per_minute, memory_usage_mb)
    }

    /// Register an event subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// Pause, drain every in-flight task, clear the queue, and stop the
    /// metrics sampler. Idempotent; the engine must not be reused after.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("engine shutting down");
        self.pause();

        while self.ctx.counters.current_concurrency() > 0 {
            sleep(DRAIN_POLL).await;
        }

        let dropped = lock_registry(&self.queue).clear();
        if dropped > 0 {
            tracing::warn!("dropped {} queued tasks at shutdown", dropped);
        }

        if let Some(handle) = self
            .sampler_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }

        self.ctx.events.publish(EngineEvent::Shutdown);
        tracing::info!("engine shutdown complete");
    }

    /// Whether dispatch is currently suspended.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether the engine has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The configuration this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    fn spawn_sampler(
        ctx: Arc<ExecutionContext>,
        queue: Arc<std::sync::Mutex<RunRegistry<I>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ctx.config.metrics_interval());
            loop {
                interval.tick().await;
                let queue_length = lock_registry(&queue).len();
                let requests_per_minute = ctx.limiter.requests_per_minute().await;
                let memory_usage_mb = ctx.memory.usage_mb();
                let snapshot =
                    ctx.counters
                        .snapshot(queue_length, requests_per_minute, memory_usage_mb);
                ctx.events.publish(EngineEvent::Metrics(snapshot));
            }
        })
    }
}

/// Handle to one run's queue in the registry. Dropping it removes the queue,
/// so a stream abandoned mid-run cannot leak queued tasks into the engine.
struct RunGuard<I> {
    registry: Arc<std::sync::Mutex<RunRegistry<I>>>,
    run: RunId,
}

impl<I> RunGuard<I> {
    fn pop(&self) -> Option<Task<I>> {
        lock_registry(&self.registry).pop(self.run)
    }

    fn is_empty(&self) -> bool {
        lock_registry(&self.registry).is_run_empty(self.run)
    }
}

impl<I> Drop for RunGuard<I> {
    fn drop(&mut self) {
        let dropped = lock_registry(&self.registry).remove_run(self.run);
        if dropped > 0 {
            tracing::debug!("run {} dropped with {} tasks still queued", self.run, dropped);
        }
    }
}

/// Per-run dispatch state moved through the `unfold` stream.
struct DispatchState<I, O, W> {
    ctx: Arc<ExecutionContext>,
    run: RunGuard<I>,
    paused: Arc<AtomicBool>,
    worker: Arc<W>,
    in_flight: FuturesUnordered<BoxFuture<'static, TaskReport<O>>>,
}

impl<I, O, W, F> DispatchState<I, O, W>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
    W: Fn(I) -> F + Send + Sync + 'static,
    F: Future<Output = Result<O, WorkerError>> + Send + 'static,
{
    /// Pop this run's queued tasks until the in-flight set reaches
    /// `max_concurrency`.
    fn fill_in_flight(&mut self) {
        while self.in_flight.len() < self.ctx.config.max_concurrency {
            match self.run.pop() {
                Some(task) => {
                    tracing::debug!("dispatching task {}", task.id);
                    self.in_flight.push(Box::pin(execute(
                        Arc::clone(&self.ctx),
                        Arc::clone(&self.worker),
                        task,
                    )));
                }
                None => break,
            }
        }
    }
}

/// Drive one task through backpressure, admission, execution, and retries
/// to a terminal [`TaskReport`].
async fn execute<I, O, W, F>(
    ctx: Arc<ExecutionContext>,
    worker: Arc<W>,
    mut task: Task<I>,
) -> TaskReport<O>
where
    I: Clone,
    W: Fn(I) -> F,
    F: Future<Output = Result<O, WorkerError>>,
{
    // Semaphore enforces max_concurrency across run_one and batch runs; it
    // is never closed, so acquire cannot fail.
    let _permit = ctx
        .concurrency
        .acquire()
        .await
        .expect("concurrency semaphore closed");

    let started = std::time::Instant::now();
    ctx.counters.task_started();

    let outcome = loop {
        if task.retry_count > 0 {
            let delay = ctx.config.backoff_delay(task.retry_count);
            tracing::debug!(
                "task {} backing off {:?} before retry {}",
                task.id,
                delay,
                task.retry_count
            );
            sleep(delay).await;
        }

        ctx.memory.wait_for_headroom(ctx.config.max_memory_mb).await;
        ctx.limiter.acquire().await;

        match worker(task.payload.clone()).await {
            Ok(output) => break Ok(output),
            Err(error) if error.is_retryable() && task.retry_count < ctx.config.max_retries => {
                task.retry_count += 1;
                tracing::warn!(
                    "task {} failed ({}), retry {}/{}",
                    task.id,
                    error,
                    task.retry_count,
                    ctx.config.max_retries
                );
            }
            Err(error) => {
                tracing::error!("task {} failed terminally: {}", task.id, error);
                ctx.events
                    .publish(EngineEvent::Error(format!("task {}: {error}", task.id)));
                break Err(error);
            }
        }
    };

    let duration = started.elapsed();
    ctx.counters.task_finished(outcome.is_ok(), duration);

    TaskReport {
        id: task.id,
        outcome,
        duration,
        retries: task.retry_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            max_concurrency: 2,
            max_requests_per_second: 100,
            max_requests_per_minute: 1000,
            max_retries: 3,
            retry_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_memory_mb: 100_000,
            max_queue_size: 100,
            enable_metrics: false,
            metrics_interval_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_all_reports_every_item() {
        let engine = TaskEngine::new(fast_config()).unwrap();

        let reports = engine
            .run_all(
                (0..10u32).collect(),
                |n| async move {
                    if n % 3 == 0 {
                        Err(WorkerError::permanent("divisible by three"))
                    } else {
                        Ok(n * 2)
                    }
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(reports.len(), 10);
        let completed = reports.iter().filter(|r| r.is_success()).count();
        let failed = reports.iter().filter(|r| !r.is_success()).count();
        assert_eq!(completed + failed, 10);
        assert_eq!(failed, 4); // 0, 3, 6, 9
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let engine = TaskEngine::new(fast_config()).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let (current_ref, max_ref) = (Arc::clone(&current), Arc::clone(&max_seen));
        let reports = engine
            .run_all(
                (0..10u32).collect(),
                move |_| {
                    let current = Arc::clone(&current_ref);
                    let max_seen = Arc::clone(&max_ref);
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, WorkerError>(())
                    }
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(reports.len(), 10);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let engine = TaskEngine::<u32>::new(fast_config()).unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let attempts_ref = Arc::clone(&attempts);
        let report = engine
            .run_one(Task::new(1), move |_| {
                let attempts = Arc::clone(&attempts_ref);
                async move {
                    // Fail exactly max_retries - 1 = 2 times, then succeed.
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(WorkerError::transient("connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let engine = TaskEngine::<u32>::new(fast_config()).unwrap();

        let report = engine
            .run_one(Task::new(1), |_| async {
                Err::<(), _>(WorkerError::rate_limited("429"))
            })
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.retries, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let engine = TaskEngine::<u32>::new(fast_config()).unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let attempts_ref = Arc::clone(&attempts);
        let report = engine
            .run_one(Task::new(1), move |_| {
                let attempts = Arc::clone(&attempts_ref);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(WorkerError::permanent("bad request"))
                }
            })
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.retries, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preserve_order() {
        let engine = TaskEngine::new(fast_config()).unwrap();

        // Later items finish first because earlier items sleep longer.
        let reports = engine
            .run_all(
                vec![30u64, 20, 10],
                |delay| async move {
                    sleep(Duration::from_millis(delay)).await;
                    Ok::<_, WorkerError>(delay)
                },
                RunOptions::default().preserve_order(),
            )
            .await
            .unwrap();

        let outputs: Vec<u64> = reports.iter().map(|r| *r.output().unwrap()).collect();
        assert_eq!(outputs, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn test_completion_order_by_default() {
        let engine = TaskEngine::new(fast_config()).unwrap();

        let reports = engine
            .run_all(
                vec![60u64, 5],
                |delay| async move {
                    sleep(Duration::from_millis(delay)).await;
                    Ok::<_, WorkerError>(delay)
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(*reports[0].output().unwrap(), 5);
        assert_eq!(*reports[1].output().unwrap(), 60);
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let config = EngineConfig {
            max_queue_size: 3,
            ..fast_config()
        };
        let engine = TaskEngine::new(config).unwrap();

        let result = engine
            .run_all(
                (0..5u32).collect(),
                |n| async move { Ok::<_, WorkerError>(n) },
                RunOptions::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(EngineError::QueueOverflow { submitted: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let config = EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        };
        let engine = TaskEngine::new(config).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks = vec![
            Task::with_priority("low", 1),
            Task::with_priority("high", 10),
            Task::with_priority("mid", 5),
        ];

        let order_ref = Arc::clone(&order);
        engine
            .run_tasks(
                tasks,
                move |name: &'static str| {
                    let order = Arc::clone(&order_ref);
                    async move {
                        order.lock().await.push(name);
                        Ok::<_, WorkerError>(())
                    }
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        // All three are enqueued before the first dispatch, so dispatch
        // follows priority strictly.
        let seen = order.lock().await.clone();
        assert_eq!(seen[0], "high");
        assert_eq!(seen[1], "mid");
        assert_eq!(seen[2], "low");
    }

    #[tokio::test]
    async fn test_pause_blocks_new_dispatch() {
        let config = EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        };
        let engine = Arc::new(TaskEngine::new(config).unwrap());
        let invocations = Arc::new(AtomicUsize::new(0));

        let engine_ref = Arc::clone(&engine);
        let invocations_ref = Arc::clone(&invocations);
        let run = tokio::spawn(async move {
            engine_ref
                .run_all(
                    (0..3u32).collect(),
                    move |n| {
                        let invocations = Arc::clone(&invocations_ref);
                        async move {
                            invocations.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(50)).await;
                            Ok::<_, WorkerError>(n)
                        }
                    },
                    RunOptions::default(),
                )
                .await
        });

        // Let exactly the first task dispatch, then pause.
        sleep(Duration::from_millis(20)).await;
        engine.pause();
        let seen_at_pause = invocations.load(Ordering::SeqCst);
        assert_eq!(seen_at_pause, 1);

        // The in-flight worker finishes, but nothing new starts.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), seen_at_pause);

        engine.resume();
        let reports = run.await.unwrap().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_overlapping_runs_keep_their_own_tasks() {
        let config = EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        };
        let engine = Arc::new(TaskEngine::new(config).unwrap());

        // Two runs with distinct workers interleave on one engine; every
        // report must come from the worker its run was started with.
        let engine_a = Arc::clone(&engine);
        let run_a = tokio::spawn(async move {
            engine_a
                .run_all(
                    vec!["a1", "a2", "a3"],
                    |item: &'static str| async move {
                        sleep(Duration::from_millis(20)).await;
                        Ok::<_, WorkerError>(format!("A:{item}"))
                    },
                    RunOptions::default(),
                )
                .await
        });

        sleep(Duration::from_millis(10)).await;
        let engine_b = Arc::clone(&engine);
        let run_b = tokio::spawn(async move {
            engine_b
                .run_all(
                    vec!["b1", "b2"],
                    |item: &'static str| async move {
                        sleep(Duration::from_millis(20)).await;
                        Ok::<_, WorkerError>(format!("B:{item}"))
                    },
                    RunOptions::default(),
                )
                .await
        });

        let mut outputs_a: Vec<String> = run_a
            .await
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.output().unwrap().clone())
            .collect();
        let mut outputs_b: Vec<String> = run_b
            .await
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.output().unwrap().clone())
            .collect();

        outputs_a.sort();
        outputs_b.sort();
        assert_eq!(outputs_a, vec!["A:a1", "A:a2", "A:a3"]);
        assert_eq!(outputs_b, vec!["B:b1", "B:b2"]);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_queued_tasks() {
        let config = EngineConfig {
            max_concurrency: 1,
            max_queue_size: 4,
            ..fast_config()
        };
        let engine = TaskEngine::new(config).unwrap();

        {
            let stream = engine
                .run_stream(vec![10u64, 50, 50, 50], |delay| async move {
                    sleep(Duration::from_millis(delay)).await;
                    Ok::<_, WorkerError>(delay)
                })
                .await
                .unwrap();
            futures::pin_mut!(stream);

            assert_eq!(*stream.next().await.unwrap().output().unwrap(), 10);
            // Stream dropped here with three tasks still queued.
        }

        assert_eq!(engine.metrics().await.queue_length, 0);

        // The abandoned run's queue slots are free for the next submission.
        let reports = engine
            .run_all(
                (0..4u64).collect(),
                |n| async move { Ok::<_, WorkerError>(n) },
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(reports.len(), 4);
    }

    #[tokio::test]
    async fn test_run_stream_yields_incrementally() {
        let engine = TaskEngine::new(fast_config()).unwrap();

        let stream = engine
            .run_stream(vec![40u64, 10], |delay| async move {
                sleep(Duration::from_millis(delay)).await;
                Ok::<_, WorkerError>(delay)
            })
            .await
            .unwrap();
        futures::pin_mut!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(*first.output().unwrap(), 10);
        let second = stream.next().await.unwrap();
        assert_eq!(*second.output().unwrap(), 40);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_progress_callback() {
        let engine = TaskEngine::new(fast_config()).unwrap();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let calls_ref = Arc::clone(&calls);
        let on_progress: ProgressFn = Arc::new(move |completed, total| {
            calls_ref.lock().unwrap().push((completed, total));
        });

        engine
            .run_all(
                (0..4u32).collect(),
                |n| async move { Ok::<_, WorkerError>(n) },
                RunOptions::default().with_progress(on_progress),
            )
            .await
            .unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last(), Some(&(4, 4)));
        assert!(calls.iter().all(|(_, total)| *total == 4));
    }

    #[tokio::test]
    async fn test_metrics_sampler_publishes() {
        let config = EngineConfig {
            enable_metrics: true,
            metrics_interval_ms: 30,
            ..fast_config()
        };
        let engine = TaskEngine::<u32>::new(config).unwrap();
        let mut events = engine.subscribe();

        let event = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if let Ok(EngineEvent::Metrics(snapshot)) = events.recv().await {
                    break snapshot;
                }
            }
        })
        .await
        .expect("no metrics event within two intervals");

        assert_eq!(event.total_tasks, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let engine = TaskEngine::new(fast_config()).unwrap();

        engine
            .run_all(
                (0..4u32).collect(),
                |n| async move {
                    if n == 0 {
                        Err(WorkerError::permanent("nope"))
                    } else {
                        Ok(n)
                    }
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        let metrics = engine.metrics().await;
        assert_eq!(metrics.total_tasks, 4);
        assert_eq!(metrics.completed_tasks, 3);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.current_concurrency, 0);
        assert_eq!(metrics.queue_length, 0);
        assert!(metrics.requests_per_minute >= 4);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let engine = TaskEngine::<u32>::new(fast_config()).unwrap();
        let mut events = engine.subscribe();

        engine.shutdown().await;
        engine.shutdown().await;
        assert!(engine.is_shut_down());

        // Exactly one Shutdown event.
        assert!(matches!(events.recv().await, Ok(EngineEvent::Paused)));
        assert!(matches!(events.recv().await, Ok(EngineEvent::Shutdown)));
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        let result = engine
            .run_all(
                vec![1],
                |n| async move { Ok::<_, WorkerError>(n) },
                RunOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::ShutDown)));
    }

    #[tokio::test]
    async fn test_clear_queue_drops_pending() {
        let config = EngineConfig {
            max_concurrency: 1,
            ..fast_config()
        };
        let engine = Arc::new(TaskEngine::new(config).unwrap());

        let engine_ref = Arc::clone(&engine);
        let run = tokio::spawn(async move {
            engine_ref
                .run_all(
                    (0..5u32).collect(),
                    |n| async move {
                        sleep(Duration::from_millis(40)).await;
                        Ok::<_, WorkerError>(n)
                    },
                    RunOptions::default(),
                )
                .await
        });

        sleep(Duration::from_millis(20)).await;
        let dropped = engine.clear_queue().await;
        assert!(dropped > 0);

        // The run resolves with reports only for dispatched tasks.
        let reports = run.await.unwrap().unwrap();
        assert_eq!(reports.len(), 5 - dropped);
    }
}
