//! Batch and work-item data model.
//!
//! A [`Batch`] owns its [`WorkItem`]s; both are created together when a run
//! is admitted. Status enums encode the one-directional lifecycle via
//! `can_transition_to`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, FailureDetail, Result};
use crate::ids::BatchId;

/// Sample rates the bundled encoder accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 8] =
    [8000, 11025, 16000, 22050, 44100, 48000, 88200, 96000];

/// Bitrate bounds in kbps.
pub const MIN_BITRATE_KBPS: u32 = 32;
pub const MAX_BITRATE_KBPS: u32 = 320;

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown batch status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// EncodingOptions
// ---------------------------------------------------------------------------

/// Options handed to the encoder for every item of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingOptions {
    /// Target bitrate such as `"320k"`.
    pub bitrate: String,
    /// Output sample rate; `None` keeps the source rate.
    pub sample_rate: Option<u32>,
    pub preserve_metadata: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            bitrate: "320k".into(),
            sample_rate: None,
            preserve_metadata: true,
        }
    }
}

impl EncodingOptions {
    pub fn validate(&self) -> Result<()> {
        parse_bitrate_kbps(&self.bitrate)?;
        if let Some(rate) = self.sample_rate {
            validate_sample_rate(rate)?;
        }
        Ok(())
    }

    /// Bitrate in kbps, if the configured string is well formed.
    pub fn bitrate_kbps(&self) -> Option<u32> {
        parse_bitrate_kbps(&self.bitrate).ok()
    }
}

/// Parse a bitrate of the form `<n>k` and check it lies within bounds.
pub fn parse_bitrate_kbps(bitrate: &str) -> Result<u32> {
    let digits = bitrate
        .strip_suffix('k')
        .ok_or_else(|| Error::Validation(format!("bitrate must end with 'k': {bitrate}")))?;
    let kbps: u32 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid bitrate: {bitrate}")))?;
    if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&kbps) {
        return Err(Error::Validation(format!(
            "bitrate must be between {MIN_BITRATE_KBPS}k and {MAX_BITRATE_KBPS}k, got {bitrate}"
        )));
    }
    Ok(kbps)
}

pub fn validate_sample_rate(rate: u32) -> Result<()> {
    if SUPPORTED_SAMPLE_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "unsupported sample rate {rate}; expected one of {SUPPORTED_SAMPLE_RATES:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Work requests
// ---------------------------------------------------------------------------

/// One unit of work submitted with a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub name: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl WorkRequest {
    pub fn new(name: impl Into<String>, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItem / Batch
// ---------------------------------------------------------------------------

/// One unit within a batch, addressed by its position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: usize,
    pub name: String,
    pub status: ItemStatus,
    pub progress: f64,
    pub output: Option<String>,
    pub output_size: Option<u64>,
    pub error: Option<FailureDetail>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: ItemStatus::Queued,
            progress: 0.0,
            output: None,
            output_size: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One conversion run and its items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchStatus,
    pub options: EncodingOptions,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub overall_progress: f64,
    pub error: Option<String>,
    pub items: Vec<WorkItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new<I, S>(id: BatchId, options: EncodingOptions, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<WorkItem> = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| WorkItem::new(i, name))
            .collect();
        let now = Utc::now();
        Self {
            id,
            status: BatchStatus::Queued,
            options,
            total_count: items.len(),
            completed_count: 0,
            failed_count: 0,
            overall_progress: 0.0,
            error: None,
            items,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Re-derive `overall_progress` from committed counts.
    pub fn recompute_progress(&mut self) {
        self.overall_progress =
            committed_fraction(self.completed_count, self.failed_count, self.total_count);
    }

    pub fn items_with_status(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

/// Fraction of items that reached a terminal status.
pub fn committed_fraction(completed: usize, failed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    ((completed + failed) as f64 / total as f64).min(1.0)
}

// ---------------------------------------------------------------------------
// BatchOutcome
// ---------------------------------------------------------------------------

/// Final result of one scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items never attempted because the batch was cancelled.
    pub abandoned: usize,
    pub error: Option<String>,
    pub failures: Vec<FailureDetail>,
}
