//! The encoder contract consumed by both executors.
//!
//! An [`Encoder`] performs one unit of conversion work. It reports
//! sub-progress through the supplied callback as `(current, total)` units
//! with non-decreasing `current`, and fails with a typed [`EncodeError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EncodeError;
use crate::model::{EncodingOptions, WorkRequest};

/// Progress callback: `(current_units, total_units)`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + Send + 'a;

/// Input, output target and options for one encode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: EncodingOptions,
}

impl EncodeRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, options: EncodingOptions) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            options,
        }
    }

    pub fn from_work(request: &WorkRequest, options: &EncodingOptions) -> Self {
        Self::new(request.input.clone(), request.output.clone(), options.clone())
    }
}

/// What a successful encode produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeOutput {
    pub output_path: PathBuf,
    pub output_size: u64,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<EncodeOutput, EncodeError>;
}
