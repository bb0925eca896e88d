//! Worker-pool batch processor.
//!
//! The coordinator owns one channel per worker and a shared results
//! channel. It primes every worker with one task, then hands the next task
//! to whichever worker just reported a result, so at most `workers` tasks
//! run at once and no state is shared beyond the channels. A pool of one
//! skips all of this and runs tasks in order on the caller's task.
//!
//! Every task gets an [`ItemProgress`] handle when it is handed out, so
//! encoder samples reach the display through the same throttling the
//! request-scoped scheduler applies to its events.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mf_core::config::{ProgressMode, WorkerCount};
use mf_core::{EncodeError, Encoder, FailureDetail};

use crate::reporter::{ItemProgress, ProgressReporter};
use crate::task::{BatchRun, BatchTask, TaskResult};
use crate::workers::{hardware_parallelism, resolve_workers};

/// Default hard deadline per task.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct BatchProcessor {
    encoder: Arc<dyn Encoder>,
    item_timeout: Duration,
    hardware: usize,
    progress: ProgressMode,
}

impl BatchProcessor {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self {
            encoder,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            hardware: hardware_parallelism(),
            progress: ProgressMode::None,
        }
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    /// Override the detected CPU count.
    pub fn with_hardware_parallelism(mut self, cpus: usize) -> Self {
        self.hardware = cpus.max(1);
        self
    }

    pub fn with_progress(mut self, mode: ProgressMode) -> Self {
        self.progress = mode;
        self
    }

    /// Pool size that [`process`](Self::process) would use.
    pub fn worker_count(&self, requested: WorkerCount) -> usize {
        resolve_workers(requested, self.hardware)
    }

    /// Run every task, or stop at the first failure when `fail_fast` is set.
    pub async fn process(
        &self,
        items: Vec<BatchTask>,
        workers: WorkerCount,
        fail_fast: bool,
    ) -> BatchRun {
        let total = items.len();
        let workers = self.worker_count(workers).min(total.max(1));
        let reporter = ProgressReporter::new(self.progress, total);

        tracing::info!(total, workers, fail_fast, "Processing batch");

        let run = if workers == 1 {
            self.process_sequential(items, fail_fast, &reporter).await
        } else {
            self.process_pool(items, workers, fail_fast, &reporter).await
        };
        reporter.finish();

        tracing::info!(
            succeeded = run.success_count,
            failed = run.failure_count,
            not_attempted = total - run.results.len(),
            "Batch processed"
        );
        run
    }

    async fn process_sequential(
        &self,
        items: Vec<BatchTask>,
        fail_fast: bool,
        reporter: &ProgressReporter,
    ) -> BatchRun {
        let total = items.len();
        let mut run = BatchRun::default();

        for (index, task) in items.into_iter().enumerate() {
            let mut progress = reporter.item(index, &task.name());
            let result = run_task(
                self.encoder.as_ref(),
                index,
                &task,
                self.item_timeout,
                &mut progress,
            )
            .await;
            let failed = !result.success;
            run.record(result);
            reporter.report(run.results.len() as f64 / total as f64);

            if failed && fail_fast {
                tracing::warn!(item = %task.name(), "Stopping after first failure");
                break;
            }
        }
        run
    }

    async fn process_pool(
        &self,
        items: Vec<BatchTask>,
        workers: usize,
        fail_fast: bool,
        reporter: &ProgressReporter,
    ) -> BatchRun {
        let total = items.len();
        let cancel = CancellationToken::new();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, TaskResult)>();

        let mut senders = Vec::with_capacity(workers);
        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel::<Assignment>(1);
            senders.push(tx);
            pool.spawn(worker_loop(
                worker_id,
                rx,
                result_tx.clone(),
                Arc::clone(&self.encoder),
                self.item_timeout,
                cancel.clone(),
            ));
        }
        drop(result_tx);

        let mut run = BatchRun::default();
        let mut pending = items.into_iter().enumerate();
        let mut in_flight = 0usize;

        for sender in &senders {
            let Some(next) = pending.next() else { break };
            in_flight += dispatch(sender, next, reporter, &mut run);
        }

        while in_flight > 0 {
            let Some((worker_id, result)) = result_rx.recv().await else {
                break;
            };
            in_flight -= 1;

            let failed = !result.success;
            if failed {
                if let Some(detail) = &result.error {
                    tracing::warn!(worker = worker_id, "Task failed: {detail}");
                }
            }
            run.record(result);
            reporter.report(run.results.len() as f64 / total as f64);

            if failed && fail_fast {
                tracing::warn!("Fail-fast: stopping worker pool");
                cancel.cancel();
                break;
            }
            if let Some(next) = pending.next() {
                in_flight += dispatch(&senders[worker_id], next, reporter, &mut run);
            }
        }

        drop(senders);
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker exited abnormally: {e}");
            }
        }

        // Results that were sent before the pool stopped still count.
        while let Ok((_, result)) = result_rx.try_recv() {
            run.record(result);
        }
        run
    }
}

/// A task handed to a worker, with the handle its progress is drawn on.
type Assignment = (usize, BatchTask, ItemProgress);

/// Hand a task to an idle worker; returns how many tasks became in flight.
fn dispatch(
    sender: &mpsc::Sender<Assignment>,
    (index, task): (usize, BatchTask),
    reporter: &ProgressReporter,
    run: &mut BatchRun,
) -> usize {
    let progress = reporter.item(index, &task.name());
    match sender.try_send((index, task, progress)) {
        Ok(()) => 1,
        Err(e) => {
            let (index, task, _progress) = e.into_inner();
            run.record(TaskResult::failed(
                index,
                task.input.clone(),
                FailureDetail::unexpected(task.name(), "worker unavailable"),
            ));
            0
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    mut tasks: mpsc::Receiver<Assignment>,
    results: mpsc::UnboundedSender<(usize, TaskResult)>,
    encoder: Arc<dyn Encoder>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = worker_id, "Worker started");
    loop {
        let (index, task, mut progress) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = tasks.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = run_task(encoder.as_ref(), index, &task, timeout, &mut progress) => result,
        };

        if results.send((worker_id, result)).is_err() {
            break;
        }
    }
    tracing::debug!(worker = worker_id, "Worker stopped");
}

/// Encode one task under a hard deadline, recovering panics as failures.
/// Encoder samples are drawn on `progress`, which is closed on return.
async fn run_task(
    encoder: &dyn Encoder,
    index: usize,
    task: &BatchTask,
    timeout: Duration,
    progress: &mut ItemProgress,
) -> TaskResult {
    let name = task.name();
    let request = task.request();
    let encode = async {
        let mut on_progress = |current: u64, total: u64| progress.sample(current, total);
        encoder.encode(&request, &mut on_progress).await
    };

    let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, encode))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(Ok(Ok(output))) => {
            tracing::debug!(item = %name, size = output.output_size, "Task succeeded");
            TaskResult::succeeded(index, task.input.clone(), output.output_size)
        }
        Ok(Ok(Err(e))) => {
            TaskResult::failed(index, task.input.clone(), FailureDetail::from_encode(name, &e))
        }
        Ok(Err(_elapsed)) => TaskResult::failed(
            index,
            task.input.clone(),
            FailureDetail::from_encode(name, &EncodeError::Timeout("Processing timeout".into())),
        ),
        Err(panic) => TaskResult::failed(
            index,
            task.input.clone(),
            FailureDetail::unexpected(name, panic_message(panic.as_ref())),
        ),
    };
    progress.finish(result.success);
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
