//! mf-core: shared types, IDs, errors, configuration, and the event system.
//!
//! Every other mf-* crate depends on this one for the batch data model, the
//! encoder contract, the unified error type and the per-batch [`EventBus`].

pub mod config;
pub mod encode;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod progress;
pub mod stream;

// Re-export the most commonly used items at the crate root.
pub use encode::{EncodeOutput, EncodeRequest, Encoder, ProgressFn};
pub use error::{EncodeError, Error, FailureDetail, FailureKind, Result};
pub use events::{Event, EventBus, EventPayload, Subscription};
pub use ids::*;
pub use model::*;
