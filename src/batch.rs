//! Batch adapter: coalesces individually submitted items into size- or
//! time-bounded batches.
//!
//! Callers submit one item at a time through [`BatchDispatcher::add`] and
//! await their own output; the dispatcher buffers items, flushes a full
//! batch immediately or a partial one after `max_batch_delay_ms`, runs the
//! caller-supplied batch function through an internally owned
//! [`TaskEngine`], and demultiplexes the outputs back to each caller.
//!
//! Failure granularity is the whole batch: one batch-mate's error rejects
//! every caller in that batch. This is a documented limitation, not a bug —
//! batch APIs rarely report which item sank the call.

use crate::config::BatchConfig;
use crate::engine::TaskEngine;
use crate::error::{BatchError, EngineError, EngineResult, WorkerError};
use crate::task::Task;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

type BatchFn<I, O> =
    Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<O>, WorkerError>> + Send + Sync>;

type Waiter<O> = oneshot::Sender<Result<O, BatchError>>;

/// Items buffered for the next flush, with one waiter per item.
struct PendingBatch<I, O> {
    items: Vec<I>,
    waiters: Vec<Waiter<O>>,
    timer: Option<JoinHandle<()>>,
}

impl<I, O> PendingBatch<I, O> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            waiters: Vec::new(),
            timer: None,
        }
    }

    /// Swap out the buffered batch so new submissions start fresh,
    /// cancelling the delay timer armed for it.
    fn take(&mut self) -> Option<(Vec<I>, Vec<Waiter<O>>)> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.items.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.items);
        let waiters = std::mem::take(&mut self.waiters);
        Some((items, waiters))
    }
}

/// Coalescing adapter in front of a batch-shaped upstream call.
///
/// The batch function's contract is positional: `outputs[i]` must correspond
/// to `inputs[i]` within one call. The dispatcher enforces the length half
/// of that contract ([`BatchError::OutputMismatch`]) and trusts the order
/// half.
///
/// # Examples
///
/// ```rust,no_run
/// use flowsmith::batch::BatchDispatcher;
/// use flowsmith::config::BatchConfig;
/// use flowsmith::error::WorkerError;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher = BatchDispatcher::new(BatchConfig::default(), |texts: Vec<String>| async move {
///     // One embedding call for the whole batch.
///     Ok::<_, WorkerError>(texts.iter().map(|t| vec![t.len() as f32]).collect())
/// })?;
///
/// let embedding = dispatcher.add("hello".to_string()).await?;
/// assert_eq!(embedding, vec![5.0]);
/// # Ok(())
/// # }
/// ```
pub struct BatchDispatcher<I, O> {
    config: BatchConfig,
    engine: Arc<TaskEngine<Vec<I>>>,
    batch_fn: BatchFn<I, O>,
    pending: Arc<Mutex<PendingBatch<I, O>>>,
}

impl<I, O> BatchDispatcher<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Create a dispatcher around a batch function.
    ///
    /// Batch calls run through an internal [`TaskEngine`], so several
    /// batches may be in flight at once up to that engine's concurrency and
    /// rate caps, and transient batch failures get the engine's retry
    /// policy.
    pub fn new<W, F>(config: BatchConfig, batch_fn: W) -> EngineResult<Self>
    where
        W: Fn(Vec<I>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Vec<O>, WorkerError>> + Send + 'static,
    {
        if let Err(errors) = config.validate() {
            return Err(EngineError::config(errors.join("; ")));
        }

        let engine = Arc::new(TaskEngine::new(config.engine.clone())?);
        let batch_fn: BatchFn<I, O> = Arc::new(move |items| Box::pin(batch_fn(items)));

        Ok(Self {
            config,
            engine,
            batch_fn,
            pending: Arc::new(Mutex::new(PendingBatch::empty())),
        })
    }

    /// Submit one item and await its output from whichever batch it lands
    /// in.
    ///
    /// Flushes immediately once `max_batch_size` items are buffered;
    /// otherwise the first buffered item arms the delay timer and the batch
    /// flushes when it expires, whatever its size.
    pub async fn add(&self, item: I) -> Result<O, BatchError> {
        if self.engine.is_shut_down() {
            return Err(BatchError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.items.push(item);
            pending.waiters.push(tx);

            if pending.items.len() >= self.config.max_batch_size {
                if let Some((items, waiters)) = pending.take() {
                    tracing::debug!("flushing full batch of {}", items.len());
                    self.spawn_flush(items, waiters);
                }
            } else if pending.timer.is_none() {
                pending.timer = Some(self.spawn_timer());
            }
        }

        rx.await.unwrap_or(Err(BatchError::Closed))
    }

    /// Flush whatever is buffered right now, then shut the inner engine
    /// down. Idempotent through the engine's own shutdown.
    pub async fn shutdown(&self) {
        let taken = self.pending.lock().await.take();
        if let Some((items, waiters)) = taken {
            tracing::debug!("flushing partial batch of {} at shutdown", items.len());
            flush(
                Arc::clone(&self.engine),
                Arc::clone(&self.batch_fn),
                items,
                waiters,
            )
            .await;
        }
        self.engine.shutdown().await;
    }

    /// Arm the partial-batch delay timer.
    fn spawn_timer(&self) -> JoinHandle<()> {
        let delay = self.config.max_batch_delay();
        let pending = Arc::clone(&self.pending);
        let engine = Arc::clone(&self.engine);
        let batch_fn = Arc::clone(&self.batch_fn);

        tokio::spawn(async move {
            sleep(delay).await;
            let taken = pending.lock().await.take();
            if let Some((items, waiters)) = taken {
                tracing::debug!("flushing partial batch of {} on delay expiry", items.len());
                flush(engine, batch_fn, items, waiters).await;
            }
        })
    }

    fn spawn_flush(&self, items: Vec<I>, waiters: Vec<Waiter<O>>) {
        let engine = Arc::clone(&self.engine);
        let batch_fn = Arc::clone(&self.batch_fn);
        tokio::spawn(async move {
            flush(engine, batch_fn, items, waiters).await;
        });
    }
}

/// Run one captured batch through the engine and demultiplex the outcome.
async fn flush<I, O>(
    engine: Arc<TaskEngine<Vec<I>>>,
    batch_fn: BatchFn<I, O>,
    items: Vec<I>,
    waiters: Vec<Waiter<O>>,
) where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    let expected = items.len();
    let call = move |batch: Vec<I>| (batch_fn)(batch);

    let report = match engine.run_one(Task::new(items), call).await {
        Ok(report) => report,
        Err(_) => {
            // Engine shut down between capture and dispatch.
            for waiter in waiters {
                let _ = waiter.send(Err(BatchError::Closed));
            }
            return;
        }
    };

    match report.outcome {
        Ok(outputs) if outputs.len() == expected => {
            for (waiter, output) in waiters.into_iter().zip(outputs) {
                let _ = waiter.send(Ok(output));
            }
        }
        Ok(outputs) => {
            tracing::error!(
                "batch function broke its contract: {} inputs, {} outputs",
                expected,
                outputs.len()
            );
            for waiter in waiters {
                let _ = waiter.send(Err(BatchError::OutputMismatch {
                    expected,
                    actual: outputs.len(),
                }));
            }
        }
        Err(error) => {
            // No partial isolation: one bad batch-mate fails everyone.
            let shared = Arc::new(error);
            for waiter in waiters {
                let _ = waiter.send(Err(BatchError::Failed(Arc::clone(&shared))));
            }
        }
    }
}
