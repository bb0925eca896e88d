//! Bounded-concurrency batch execution.
//!
//! Items are admitted in input order. Each admission first takes a permit
//! from a semaphore sized to the concurrency limit, then checks the run's
//! cancellation flag; once cancellation is seen, the remaining items are
//! abandoned and stay queued while in-flight items finish normally. The
//! permit travels with the item's task and is released when the item has
//! been committed.
//!
//! Item failures, including panics inside the encoder, are recovered at the
//! item boundary and never affect siblings. Only a failure to record the
//! batch-level outcome is fatal for the run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use mf_core::{
    Batch, BatchId, BatchOutcome, BatchStatus, EncodeOutput, EncodeRequest, Encoder,
    EncodingOptions, Error, EventBus, EventPayload, FailureDetail, FailureKind, Result, WorkRequest,
};
use mf_core::progress::{Emit, ProgressAggregator, ProgressState};

use crate::cancel::{ActiveRun, CancellationController};
use crate::store::JobStore;

#[derive(Clone)]
pub struct BoundedScheduler {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    cancellation: CancellationController,
    aggregator: ProgressAggregator,
}

impl BoundedScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<EventBus>,
        cancellation: CancellationController,
    ) -> Self {
        Self {
            store,
            bus,
            cancellation,
            aggregator: ProgressAggregator::default(),
        }
    }

    pub fn cancellation(&self) -> &CancellationController {
        &self.cancellation
    }

    /// Run a batch already recorded in the store.
    ///
    /// Fails with [`Error::Conflict`] if the batch already has an active run.
    pub async fn run(
        &self,
        batch_id: BatchId,
        items: Vec<WorkRequest>,
        concurrency_limit: usize,
        encoder: Arc<dyn Encoder>,
    ) -> Result<BatchOutcome> {
        let active = self.cancellation.activate(batch_id)?;
        self.run_active(active, items, concurrency_limit, encoder)
            .await
    }

    /// Run a batch whose activation the caller already holds. The
    /// registration is released when this returns.
    pub async fn run_active(
        &self,
        active: ActiveRun,
        items: Vec<WorkRequest>,
        concurrency_limit: usize,
        encoder: Arc<dyn Encoder>,
    ) -> Result<BatchOutcome> {
        let batch_id = active.batch_id();
        let batch = match self.start(batch_id, items.len(), concurrency_limit) {
            Ok(batch) => batch,
            Err(e) => {
                let tally = Tally {
                    total: items.len(),
                    ..Tally::default()
                };
                return Err(self.fail_batch(batch_id, &tally, e));
            }
        };

        tracing::info!(
            batch_id = %batch_id,
            items = items.len(),
            limit = concurrency_limit,
            "Batch started"
        );

        let tally = self
            .execute(&active, batch.options, items, concurrency_limit, encoder)
            .await;
        self.finalize(batch_id, tally)
    }

    /// Check the run can begin and move the batch to `Processing`.
    fn start(&self, batch_id: BatchId, requests: usize, limit: usize) -> Result<Batch> {
        if limit == 0 {
            return Err(Error::Validation(
                "concurrency limit must be at least 1".into(),
            ));
        }
        let batch = self.store.get_batch(batch_id)?;
        if batch.total_count != requests {
            return Err(Error::Validation(format!(
                "batch {batch_id} has {} items but {requests} requests were given",
                batch.total_count
            )));
        }
        self.store
            .transition(batch_id, BatchStatus::Processing, None)?;
        Ok(batch)
    }

    async fn execute(
        &self,
        active: &ActiveRun,
        options: EncodingOptions,
        items: Vec<WorkRequest>,
        limit: usize,
        encoder: Arc<dyn Encoder>,
    ) -> Tally {
        let batch_id = active.batch_id();
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(limit));
        let ctx = Arc::new(ItemContext {
            batch_id,
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            aggregator: self.aggregator,
            options,
        });

        let mut tally = Tally {
            total,
            ..Tally::default()
        };
        let mut tasks = JoinSet::new();
        let mut unfinished: HashMap<usize, String> = HashMap::new();

        for (index, request) in items.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                tally.abandoned = total - index;
                break;
            };
            if active.is_cancelled() {
                tally.abandoned = total - index;
                tracing::info!(
                    batch_id = %batch_id,
                    abandoned = tally.abandoned,
                    "Batch cancelled; remaining items abandoned"
                );
                break;
            }

            unfinished.insert(index, request.name.clone());
            let item_ctx = Arc::clone(&ctx);
            let encoder = Arc::clone(&encoder);
            tasks.spawn(async move {
                let _permit = permit;
                (index, item_ctx.run_item(index, request, encoder).await)
            });
        }

        let mut lost = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    unfinished.remove(&index);
                    match result {
                        ItemResult::Completed => tally.completed += 1,
                        ItemResult::Failed(detail) => {
                            tally.failed += 1;
                            tally.failures.push(detail);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch_id, "Item task did not finish: {e}");
                    lost.push(e.to_string());
                }
            }
        }

        // Tasks that died outside the item boundary never reported an index;
        // whatever is still unfinished belongs to them.
        let reason = lost.join("; ");
        let mut unfinished: Vec<_> = unfinished.into_iter().collect();
        unfinished.sort_by_key(|(index, _)| *index);
        for (index, name) in unfinished {
            let detail =
                FailureDetail::unexpected(&name, format!("item task did not finish: {reason}"));
            ctx.commit_failure(index, &detail);
            tally.failed += 1;
            tally.failures.push(detail);
        }

        tally
    }

    fn finalize(&self, batch_id: BatchId, tally: Tally) -> Result<BatchOutcome> {
        let (status, error) =
            terminal_status(tally.total, tally.completed, tally.failed, tally.abandoned);

        if let Err(e) = self.store.transition(batch_id, status, error.clone()) {
            return Err(self.fail_batch(batch_id, &tally, e));
        }

        tracing::info!(
            batch_id = %batch_id,
            status = %status,
            completed = tally.completed,
            failed = tally.failed,
            abandoned = tally.abandoned,
            "Batch finished"
        );

        self.bus.publish(
            batch_id,
            EventPayload::BatchCompleted {
                status,
                total: tally.total,
                completed: tally.completed,
                failed: tally.failed,
                error: error.clone(),
            },
        );

        Ok(BatchOutcome {
            batch_id,
            status,
            total: tally.total,
            completed: tally.completed,
            failed: tally.failed,
            abandoned: tally.abandoned,
            error,
            failures: tally.failures,
        })
    }

    /// Best-effort teardown when a run cannot start or its outcome cannot
    /// be recorded. Subscribers still see `batch_completed`.
    fn fail_batch(&self, batch_id: BatchId, tally: &Tally, err: Error) -> Error {
        let message = err.to_string();
        tracing::error!(batch_id = %batch_id, "Batch failed: {message}");

        if let Err(e) = self
            .store
            .transition(batch_id, BatchStatus::Failed, Some(message.clone()))
        {
            tracing::warn!(batch_id = %batch_id, "Could not mark batch failed: {e}");
        }
        self.bus.publish(
            batch_id,
            EventPayload::Error {
                item: None,
                index: None,
                kind: FailureKind::Unexpected,
                message: message.clone(),
            },
        );
        self.bus.publish(
            batch_id,
            EventPayload::BatchCompleted {
                status: BatchStatus::Failed,
                total: tally.total,
                completed: tally.completed,
                failed: tally.failed,
                error: Some(message),
            },
        );
        err
    }
}

/// Terminal status and error note for a finished run.
pub fn terminal_status(
    total: usize,
    completed: usize,
    failed: usize,
    abandoned: usize,
) -> (BatchStatus, Option<String>) {
    let failed_note = (failed > 0).then(|| format!("{failed} item(s) failed"));
    if abandoned > 0 {
        (BatchStatus::Cancelled, failed_note)
    } else if total > 0 && failed == total && completed == 0 {
        (BatchStatus::Failed, Some("All items failed".into()))
    } else {
        (BatchStatus::Completed, failed_note)
    }
}

// ---------------------------------------------------------------------------
// Per-item execution
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    completed: usize,
    failed: usize,
    abandoned: usize,
    failures: Vec<FailureDetail>,
}

enum ItemResult {
    Completed,
    Failed(FailureDetail),
}

struct ItemContext {
    batch_id: BatchId,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    aggregator: ProgressAggregator,
    options: EncodingOptions,
}

impl ItemContext {
    async fn run_item(
        &self,
        index: usize,
        request: WorkRequest,
        encoder: Arc<dyn Encoder>,
    ) -> ItemResult {
        let name = request.name.clone();
        let attempt = AssertUnwindSafe(self.attempt(index, &request, encoder.as_ref()))
            .catch_unwind()
            .await;

        let failure = match attempt {
            Ok(Ok(output)) => match self.commit_success(index, &name, output) {
                Ok(()) => return ItemResult::Completed,
                Err(e) => FailureDetail::unexpected(&name, e.to_string()),
            },
            Ok(Err(detail)) => detail,
            Err(panic) => FailureDetail::unexpected(
                &name,
                format!("item task panicked: {}", panic_message(panic.as_ref())),
            ),
        };

        self.commit_failure(index, &failure);
        ItemResult::Failed(failure)
    }

    async fn attempt(
        &self,
        index: usize,
        request: &WorkRequest,
        encoder: &dyn Encoder,
    ) -> std::result::Result<EncodeOutput, FailureDetail> {
        self.store
            .start_item(self.batch_id, index)
            .map_err(|e| FailureDetail::unexpected(&request.name, e.to_string()))?;
        tracing::debug!(batch_id = %self.batch_id, item = %request.name, "Item started");

        let encode_request = EncodeRequest::from_work(request, &self.options);
        let mut state = ProgressState::default();
        let result = {
            let mut on_progress = |current: u64, total: u64| {
                let sample = self.aggregator.on_sample(state, current, total);
                state = sample.state;
                if let Some(emit) = sample.emit {
                    self.publish_progress(index, &request.name, emit);
                }
            };
            encoder.encode(&encode_request, &mut on_progress).await
        };

        match result {
            Ok(output) => {
                if let Some(emit) = self.aggregator.on_complete(state).emit {
                    self.publish_progress(index, &request.name, emit);
                }
                Ok(output)
            }
            Err(e) => Err(FailureDetail::from_encode(&request.name, &e)),
        }
    }

    fn publish_progress(&self, index: usize, name: &str, emit: Emit) {
        if let Err(e) = self
            .store
            .update_item_progress(self.batch_id, index, emit.fraction)
        {
            tracing::warn!(batch_id = %self.batch_id, item = %name, "Failed to record progress: {e}");
        }
        self.bus.publish(
            self.batch_id,
            EventPayload::ItemProgress {
                item: name.to_string(),
                index,
                progress: emit.fraction,
                current: emit.current,
                total: emit.total,
            },
        );
    }

    fn commit_success(&self, index: usize, name: &str, output: EncodeOutput) -> Result<()> {
        let output_name = output.output_path.to_string_lossy().into_owned();
        let counts = self.store.complete_item(
            self.batch_id,
            index,
            output_name.clone(),
            output.output_size,
        )?;

        tracing::info!(
            batch_id = %self.batch_id,
            item = %name,
            output_size = output.output_size,
            "Item completed"
        );
        self.bus.publish(
            self.batch_id,
            EventPayload::ItemCompleted {
                item: name.to_string(),
                index,
                output: output_name,
                output_size: output.output_size,
                completed: counts.completed,
                failed: counts.failed,
                total: counts.total,
                overall_progress: counts.overall_progress,
            },
        );
        Ok(())
    }

    fn commit_failure(&self, index: usize, detail: &FailureDetail) {
        if let Err(e) = self.store.fail_item(self.batch_id, index, detail.clone()) {
            tracing::error!(
                batch_id = %self.batch_id,
                item = %detail.item,
                "Failed to record item failure: {e}"
            );
        }
        tracing::warn!(
            batch_id = %self.batch_id,
            item = %detail.item,
            kind = %detail.kind,
            "Item failed: {}",
            detail.message
        );
        self.bus.publish(
            self.batch_id,
            EventPayload::Error {
                item: Some(detail.item.clone()),
                index: Some(index),
                kind: detail.kind,
                message: detail.message.clone(),
            },
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
