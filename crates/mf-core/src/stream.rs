//! Transport-facing view of a subscription.
//!
//! A [`SubscriberStream`] turns an [`EventBus`] subscription into a sequence
//! of [`Frame`]s: named events in publish order, interleaved with payloadless
//! keepalives whenever the batch stays silent for the configured interval.
//! The stream ends after it delivers `batch_completed`.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{Event, EventBus, Subscription};
use crate::ids::BatchId;

/// Default silence interval before a keepalive frame.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    KeepAlive,
}

impl Frame {
    /// Render as a server-sent-events frame.
    pub fn to_sse(&self) -> String {
        match self {
            Frame::Event(event) => {
                let data = serde_json::to_string(event).unwrap_or_else(|e| {
                    tracing::warn!("Failed to serialize event: {e}");
                    "{}".to_string()
                });
                format!("event: {}\ndata: {}\n\n", event.name(), data)
            }
            Frame::KeepAlive => ": keepalive\n\n".to_string(),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Frame::KeepAlive)
    }
}

pub struct SubscriberStream {
    bus: Arc<EventBus>,
    subscription: Subscription,
    keepalive: Duration,
    finished: bool,
}

impl SubscriberStream {
    pub fn subscribe(bus: &Arc<EventBus>, batch_id: BatchId, keepalive: Duration) -> Self {
        let subscription = bus.subscribe(batch_id);
        Self {
            bus: Arc::clone(bus),
            subscription,
            keepalive,
            finished: false,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.subscription.batch_id
    }

    /// Next frame, or `None` once the batch finished or the bus dropped
    /// this subscriber.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.keepalive, self.subscription.recv()).await {
            Ok(Some(event)) => {
                if event.payload.is_terminal() {
                    self.finish();
                }
                Some(Frame::Event(event))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => Some(Frame::KeepAlive),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send {
        futures::stream::unfold(self, |mut s| async move {
            let frame = s.next_frame().await?;
            Some((frame, s))
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        self.bus
            .unsubscribe(self.subscription.batch_id, self.subscription.id);
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.bus
            .unsubscribe(self.subscription.batch_id, self.subscription.id);
    }
}
