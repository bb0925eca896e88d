//! Cooperative cancellation for active batch runs.
//!
//! The controller is an owned registry of the batches currently being
//! scheduled. Activating a batch hands back an [`ActiveRun`] guard; dropping
//! the guard clears the entry so the id can be reused by a later run.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use mf_core::{BatchId, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    active: Arc<DashMap<BatchId, CancellationToken>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `batch_id` as active. Fails with [`Error::Conflict`] if a
    /// run for the same id is already active.
    pub fn activate(&self, batch_id: BatchId) -> Result<ActiveRun> {
        let token = CancellationToken::new();
        match self.active.entry(batch_id) {
            Entry::Occupied(_) => Err(Error::Conflict(format!(
                "batch {batch_id} already has an active run"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(ActiveRun {
                    batch_id,
                    token,
                    active: Arc::clone(&self.active),
                })
            }
        }
    }

    /// Ask an active batch to stop admitting items.
    pub fn mark_cancelled(&self, batch_id: BatchId) -> Result<()> {
        let token = self
            .active
            .get(&batch_id)
            .ok_or(Error::NotActive { batch_id })?;
        token.cancel();
        tracing::info!(batch_id = %batch_id, "Cancellation requested");
        Ok(())
    }

    /// `false` for ids with no active run.
    pub fn is_cancelled(&self, batch_id: BatchId) -> bool {
        self.active
            .get(&batch_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn is_active(&self, batch_id: BatchId) -> bool {
        self.active.contains_key(&batch_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Registration of one active run; clears itself on drop.
#[derive(Debug)]
pub struct ActiveRun {
    batch_id: BatchId,
    token: CancellationToken,
    active: Arc<DashMap<BatchId, CancellationToken>>,
}

impl ActiveRun {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.remove(&self.batch_id);
        tracing::debug!(batch_id = %self.batch_id, "Batch no longer active");
    }
}
