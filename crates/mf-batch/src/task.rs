//! Inputs and outputs of an offline batch run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mf_core::{EncodeRequest, EncodingOptions, FailureDetail};

/// One file to convert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTask {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: EncodingOptions,
}

impl BatchTask {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, options: EncodingOptions) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            options,
        }
    }

    /// File name of the input, for logs and summaries.
    pub fn name(&self) -> String {
        display_name(&self.input)
    }

    pub fn request(&self) -> EncodeRequest {
        EncodeRequest::new(self.input.clone(), self.output.clone(), self.options.clone())
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Position of the task in the submitted list.
    pub index: usize,
    pub input: PathBuf,
    pub success: bool,
    pub error: Option<FailureDetail>,
    pub output_size: Option<u64>,
}

impl TaskResult {
    pub fn succeeded(index: usize, input: PathBuf, output_size: u64) -> Self {
        Self {
            index,
            input,
            success: true,
            error: None,
            output_size: Some(output_size),
        }
    }

    pub fn failed(index: usize, input: PathBuf, error: FailureDetail) -> Self {
        Self {
            index,
            input,
            success: false,
            error: Some(error),
            output_size: None,
        }
    }
}

/// Everything [`BatchProcessor::process`](crate::BatchProcessor::process)
/// returns. Results are in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub results: Vec<TaskResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchRun {
    pub(crate) fn record(&mut self, result: TaskResult) {
        if result.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.results.push(result);
    }

    pub fn summary(&self, total: usize) -> BatchSummary {
        BatchSummary {
            total,
            succeeded: self.success_count,
            failed: self.failure_count,
            not_attempted: total.saturating_sub(self.results.len()),
            failures: self
                .results
                .iter()
                .filter_map(|r| r.error.clone())
                .collect(),
        }
    }
}

/// Structured summary for the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks skipped after a fail-fast stop.
    pub not_attempted: usize,
    pub failures: Vec<FailureDetail>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.not_attempted == 0
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
