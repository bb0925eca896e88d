//! Batch and work-item persistence.
//!
//! [`JobStore`] is the seam the scheduler commits through. Every mutation
//! of a batch's counters or status happens inside a single store call, so
//! concurrently finishing items can never lose an update.
//! [`InMemoryJobStore`] keeps records in a `DashMap`; the per-entry write
//! lock provides the exclusive access.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use mf_core::{
    Batch, BatchId, BatchStatus, EncodingOptions, Error, FailureDetail, ItemStatus, Result,
    WorkItem,
};

/// Counter snapshot returned by atomic item commits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub overall_progress: f64,
}

impl BatchCounts {
    fn of(batch: &Batch) -> Self {
        Self {
            total: batch.total_count,
            completed: batch.completed_count,
            failed: batch.failed_count,
            overall_progress: batch.overall_progress,
        }
    }
}

/// One page of batches, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPage {
    pub batches: Vec<Batch>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub trait JobStore: Send + Sync {
    fn create_batch(
        &self,
        id: BatchId,
        options: EncodingOptions,
        item_names: Vec<String>,
    ) -> Result<Batch>;

    fn get_batch(&self, id: BatchId) -> Result<Batch>;

    /// Move the batch to `next` if the lifecycle allows it.
    fn transition(&self, id: BatchId, next: BatchStatus, error: Option<String>) -> Result<Batch>;

    fn start_item(&self, id: BatchId, index: usize) -> Result<()>;

    /// Record live progress; lower values than the stored one are ignored.
    fn update_item_progress(&self, id: BatchId, index: usize, progress: f64) -> Result<()>;

    /// Mark an item completed and bump the completed counter in one step.
    fn complete_item(
        &self,
        id: BatchId,
        index: usize,
        output: String,
        output_size: u64,
    ) -> Result<BatchCounts>;

    /// Mark an item failed and bump the failed counter in one step.
    fn fail_item(&self, id: BatchId, index: usize, detail: FailureDetail) -> Result<BatchCounts>;

    /// `page` starts at 1.
    fn list_batches(
        &self,
        page: usize,
        page_size: usize,
        status: Option<BatchStatus>,
    ) -> Result<BatchPage>;

    /// Remove a batch that has reached a terminal status.
    fn delete_batch(&self, id: BatchId) -> Result<()>;

    /// Remove terminal batches created more than `days` days ago.
    fn clear_old_batches(&self, days: u32) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    batches: DashMap<BatchId, Batch>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_item<T>(
        &self,
        id: BatchId,
        index: usize,
        f: impl FnOnce(&mut Batch, usize) -> Result<T>,
    ) -> Result<T> {
        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("batch", id))?;
        if index >= batch.items.len() {
            return Err(Error::not_found("item", format!("{id}/{index}")));
        }
        let out = f(&mut *batch, index)?;
        batch.updated_at = Utc::now();
        Ok(out)
    }
}

fn move_item(item: &mut WorkItem, next: ItemStatus) -> Result<()> {
    // Unexpected failures may strike before an item is marked processing.
    let allowed = item.status.can_transition_to(next)
        || (item.status == ItemStatus::Queued && next == ItemStatus::Failed);
    if !allowed {
        return Err(Error::Store(format!(
            "item {} cannot move from {} to {next}",
            item.index, item.status
        )));
    }
    item.status = next;
    Ok(())
}

impl JobStore for InMemoryJobStore {
    fn create_batch(
        &self,
        id: BatchId,
        options: EncodingOptions,
        item_names: Vec<String>,
    ) -> Result<Batch> {
        let batch = Batch::new(id, options, item_names);
        match self.batches.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::Conflict(format!("batch {id} already exists")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(batch.clone());
                Ok(batch)
            }
        }
    }

    fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.batches
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::not_found("batch", id))
    }

    fn transition(&self, id: BatchId, next: BatchStatus, error: Option<String>) -> Result<Batch> {
        let mut batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("batch", id))?;
        if !batch.status.can_transition_to(next) {
            return Err(Error::Store(format!(
                "batch {id} cannot move from {} to {next}",
                batch.status
            )));
        }

        let now = Utc::now();
        batch.status = next;
        batch.updated_at = now;
        match next {
            BatchStatus::Processing => {
                batch.started_at = Some(now);
                batch.recompute_progress();
            }
            s if s.is_terminal() => batch.completed_at = Some(now),
            _ => {}
        }
        if error.is_some() {
            batch.error = error;
        }
        Ok(batch.value().clone())
    }

    fn start_item(&self, id: BatchId, index: usize) -> Result<()> {
        self.with_item(id, index, |batch, i| {
            let item = &mut batch.items[i];
            move_item(item, ItemStatus::Processing)?;
            item.progress = 0.0;
            item.started_at = Some(Utc::now());
            Ok(())
        })
    }

    fn update_item_progress(&self, id: BatchId, index: usize, progress: f64) -> Result<()> {
        self.with_item(id, index, |batch, i| {
            let item = &mut batch.items[i];
            if item.status == ItemStatus::Processing && progress > item.progress {
                item.progress = progress.min(1.0);
            }
            Ok(())
        })
    }

    fn complete_item(
        &self,
        id: BatchId,
        index: usize,
        output: String,
        output_size: u64,
    ) -> Result<BatchCounts> {
        self.with_item(id, index, |batch, i| {
            let item = &mut batch.items[i];
            move_item(item, ItemStatus::Completed)?;
            item.progress = 1.0;
            item.output = Some(output);
            item.output_size = Some(output_size);
            item.completed_at = Some(Utc::now());

            batch.completed_count += 1;
            batch.recompute_progress();
            Ok(BatchCounts::of(batch))
        })
    }

    fn fail_item(&self, id: BatchId, index: usize, detail: FailureDetail) -> Result<BatchCounts> {
        self.with_item(id, index, |batch, i| {
            let item = &mut batch.items[i];
            move_item(item, ItemStatus::Failed)?;
            item.error = Some(detail);
            item.completed_at = Some(Utc::now());

            batch.failed_count += 1;
            batch.recompute_progress();
            Ok(BatchCounts::of(batch))
        })
    }

    fn list_batches(
        &self,
        page: usize,
        page_size: usize,
        status: Option<BatchStatus>,
    ) -> Result<BatchPage> {
        if page == 0 || page_size == 0 {
            return Err(Error::Validation(
                "page and page_size must be at least 1".into(),
            ));
        }

        let mut matching: Vec<Batch> = self
            .batches
            .iter()
            .filter(|b| status.map_or(true, |s| b.status == s))
            .map(|b| b.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let batches = matching
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(BatchPage {
            batches,
            total,
            page,
            page_size,
        })
    }

    fn delete_batch(&self, id: BatchId) -> Result<()> {
        let removed = self
            .batches
            .remove_if(&id, |_, b| b.status.is_terminal());
        if removed.is_some() {
            return Ok(());
        }
        match self.batches.get(&id) {
            Some(batch) => Err(Error::Conflict(format!(
                "batch {id} is still {}",
                batch.status
            ))),
            None => Err(Error::not_found("batch", id)),
        }
    }

    fn clear_old_batches(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let before = self.batches.len();
        self.batches
            .retain(|_, b| !(b.status.is_terminal() && b.created_at < cutoff));
        let removed = before.saturating_sub(self.batches.len());
        if removed > 0 {
            tracing::info!(removed, days, "Cleared old batches");
        }
        Ok(removed)
    }
}
