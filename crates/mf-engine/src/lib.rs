//! mf-engine: request-scoped batch orchestration.
//!
//! [`BoundedScheduler`] runs one batch under an admission budget, routing
//! encoder progress through the [`ProgressAggregator`], committing outcomes
//! to a [`JobStore`] and publishing events on the shared
//! [`mf_core::EventBus`]. [`CancellationController`] tracks which batches
//! are active and whether they were asked to stop. [`ConversionService`]
//! ties these together behind a submit/cancel/subscribe facade.

pub mod cancel;
pub mod scheduler;
pub mod service;
pub mod store;

pub use cancel::{ActiveRun, CancellationController};
pub use mf_core::progress::{Emit, ProgressAggregator, ProgressState, Sample};
pub use scheduler::BoundedScheduler;
pub use service::{ConversionService, SubmittedBatch};
pub use store::{BatchCounts, BatchPage, InMemoryJobStore, JobStore};
