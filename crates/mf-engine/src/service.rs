//! Submit/cancel/subscribe facade over the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use mf_core::config::SchedulerConfig;
use mf_core::stream::SubscriberStream;
use mf_core::{
    Batch, BatchId, BatchOutcome, BatchStatus, Encoder, EncodingOptions, Error, EventBus, Result,
    WorkRequest,
};

use crate::cancel::CancellationController;
use crate::scheduler::BoundedScheduler;
use crate::store::{BatchPage, JobStore};

/// A batch running in the background.
#[derive(Debug)]
pub struct SubmittedBatch {
    pub batch_id: BatchId,
    handle: JoinHandle<Result<BatchOutcome>>,
}

impl SubmittedBatch {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<BatchOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("batch task failed: {e}")))?
    }
}

#[derive(Clone)]
pub struct ConversionService {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    scheduler: BoundedScheduler,
    encoder: Arc<dyn Encoder>,
    config: SchedulerConfig,
}

impl ConversionService {
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>, encoder: Arc<dyn Encoder>) -> Self {
        let bus = Arc::new(EventBus::new(config.subscriber_buffer));
        let scheduler = BoundedScheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            CancellationController::new(),
        );
        Self {
            store,
            bus,
            scheduler,
            encoder,
            config,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Record a new batch and start running it on the current runtime.
    ///
    /// `concurrency_limit` defaults to the configured
    /// `max_concurrent_items`. The batch is active, and therefore
    /// cancellable, by the time this returns.
    pub fn submit(
        &self,
        options: EncodingOptions,
        requests: Vec<WorkRequest>,
        concurrency_limit: Option<usize>,
    ) -> Result<SubmittedBatch> {
        options.validate()?;
        let limit = concurrency_limit.unwrap_or(self.config.max_concurrent_items);
        if limit == 0 {
            return Err(Error::Validation(
                "concurrency limit must be at least 1".into(),
            ));
        }

        let batch_id = BatchId::new();
        let names = requests.iter().map(|r| r.name.clone()).collect();
        self.store.create_batch(batch_id, options, names)?;
        let active = self.scheduler.cancellation().activate(batch_id)?;

        tracing::info!(batch_id = %batch_id, items = requests.len(), "Batch submitted");

        let scheduler = self.scheduler.clone();
        let encoder = Arc::clone(&self.encoder);
        let handle = tokio::spawn(async move {
            scheduler
                .run_active(active, requests, limit, encoder)
                .await
        });

        Ok(SubmittedBatch { batch_id, handle })
    }

    /// Stop admitting further items for an active batch.
    pub fn cancel(&self, batch_id: BatchId) -> Result<()> {
        self.scheduler.cancellation().mark_cancelled(batch_id)
    }

    pub fn is_active(&self, batch_id: BatchId) -> bool {
        self.scheduler.cancellation().is_active(batch_id)
    }

    /// Live event stream for a batch, with keepalives after the configured
    /// silence. Unknown batches are [`Error::NotFound`].
    pub fn subscribe(&self, batch_id: BatchId) -> Result<SubscriberStream> {
        self.store.get_batch(batch_id)?;
        Ok(SubscriberStream::subscribe(
            &self.bus,
            batch_id,
            Duration::from_secs(self.config.keepalive_secs.max(1)),
        ))
    }

    pub fn status(&self, batch_id: BatchId) -> Result<Batch> {
        self.store.get_batch(batch_id)
    }

    pub fn list(
        &self,
        page: usize,
        page_size: usize,
        status: Option<BatchStatus>,
    ) -> Result<BatchPage> {
        self.store.list_batches(page, page_size, status)
    }

    /// Remove a finished batch. A batch with a live run is a
    /// [`Error::Conflict`] until that run has returned.
    pub fn delete(&self, batch_id: BatchId) -> Result<()> {
        if self.is_active(batch_id) {
            return Err(Error::Conflict(format!("batch {batch_id} is still running")));
        }
        self.store.delete_batch(batch_id)
    }

    pub fn clear_old(&self, days: u32) -> Result<usize> {
        self.store.clear_old_batches(days)
    }
}
