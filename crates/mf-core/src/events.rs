//! Per-batch event fan-out.
//!
//! [`EventBus`] keeps, for every batch id, a list of subscribers, each
//! backed by its own bounded `mpsc` channel. Publishing never blocks: a
//! subscriber whose channel is full or closed is dropped from the list and
//! delivery continues to everyone else. There is no history; a subscriber
//! sees a `connected` acknowledgment followed by whatever is published after
//! it registered.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::FailureKind;
use crate::ids::{BatchId, SubscriberId};
use crate::model::BatchStatus;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Sent once to a new subscriber.
    Connected,

    ItemProgress {
        item: String,
        index: usize,
        progress: f64,
        current: u64,
        total: u64,
    },

    ItemCompleted {
        item: String,
        index: usize,
        output: String,
        output_size: u64,
        completed: usize,
        failed: usize,
        total: usize,
        overall_progress: f64,
    },

    /// Item-scoped when `item` is set, batch-scoped otherwise.
    Error {
        item: Option<String>,
        index: Option<usize>,
        kind: FailureKind,
        message: String,
    },

    BatchCompleted {
        status: BatchStatus,
        total: usize,
        completed: usize,
        failed: usize,
        error: Option<String>,
    },
}

impl EventPayload {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::Connected => "connected",
            EventPayload::ItemProgress { .. } => "item_progress",
            EventPayload::ItemCompleted { .. } => "item_completed",
            EventPayload::Error { .. } => "error",
            EventPayload::BatchCompleted { .. } => "batch_completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::BatchCompleted { .. })
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event scoped to one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub batch_id: BatchId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(batch_id: BatchId, payload: EventPayload) -> Self {
        Self {
            batch_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub batch_id: BatchId,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus has dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct Slot {
    id: SubscriberId,
    tx: mpsc::Sender<Event>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct EventBus {
    subscribers: DashMap<BatchId, Vec<Slot>>,
    buffer: usize,
}

impl EventBus {
    /// Create a bus whose subscribers each queue up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber for `batch_id` and queue its `connected`
    /// acknowledgment.
    pub fn subscribe(&self, batch_id: BatchId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = SubscriberId::new();

        // Capacity is at least one, so the acknowledgment always fits.
        let _ = tx.try_send(Event::new(batch_id, EventPayload::Connected));

        self.subscribers
            .entry(batch_id)
            .or_default()
            .push(Slot { id, tx });

        tracing::debug!(batch_id = %batch_id, subscriber = %id, "Subscriber registered");
        Subscription { id, batch_id, rx }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, batch_id: BatchId, subscriber: SubscriberId) -> bool {
        let mut removed = false;
        if let Some(mut slots) = self.subscribers.get_mut(&batch_id) {
            let before = slots.len();
            slots.retain(|s| s.id != subscriber);
            removed = slots.len() != before;
        }
        self.subscribers.remove_if(&batch_id, |_, slots| slots.is_empty());
        if removed {
            tracing::debug!(batch_id = %batch_id, subscriber = %subscriber, "Subscriber removed");
        }
        removed
    }

    /// Fan `payload` out to every subscriber of `batch_id`, returning the
    /// number of subscribers that accepted it.
    ///
    /// Holding the per-batch entry while sending keeps delivery order equal
    /// to publish order for each subscriber.
    pub fn publish(&self, batch_id: BatchId, payload: EventPayload) -> usize {
        let Some(mut slots) = self.subscribers.get_mut(&batch_id) else {
            return 0;
        };

        let event = Event::new(batch_id, payload);
        let mut delivered = 0;
        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    subscriber = %slot.id,
                    "Subscriber queue full; disconnecting"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        drop(slots);

        self.subscribers.remove_if(&batch_id, |_, slots| slots.is_empty());
        delivered
    }

    pub fn subscriber_count(&self, batch_id: BatchId) -> usize {
        self.subscribers
            .get(&batch_id)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}
