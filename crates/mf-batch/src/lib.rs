//! mf-batch: offline batch execution for the command line.
//!
//! [`BatchProcessor`] spreads a list of [`BatchTask`]s over a fixed pool of
//! workers sized by [`resolve_workers`], with a per-item timeout, optional
//! fail-fast, and a strictly sequential path when only one worker is
//! allowed. Progress goes to a [`ProgressReporter`] chosen once up front, with an
//! [`ItemProgress`] handle per running task.

pub mod processor;
pub mod reporter;
pub mod task;
pub mod workers;

pub use mf_core::config::{ProgressMode, WorkerCount};
pub use processor::BatchProcessor;
pub use reporter::{ItemProgress, ProgressReporter};
pub use task::{BatchRun, BatchSummary, BatchTask, TaskResult};
pub use workers::{hardware_parallelism, resolve_workers};
