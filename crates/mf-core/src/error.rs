//! Unified error type for mp3forge.
//!
//! Orchestration failures funnel into [`Error`]. The encoder contract has its
//! own narrower [`EncodeError`], and item-level outcomes are summarised as a
//! [`FailureDetail`] tagged with a [`FailureKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::BatchId;

/// Unified error type covering orchestration failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "batch", "item").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Input or configuration failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation conflicts with current state, such as a second run
    /// for a batch that is already active.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Cancellation or status query against a batch with no active run.
    #[error("Batch {batch_id} has no active run")]
    NotActive {
        /// The batch that was addressed.
        batch_id: BatchId,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool exceeded its time limit and was killed.
    #[error("Tool error [{tool}]: timed out after {after:?}")]
    ToolTimeout {
        tool: String,
        after: std::time::Duration,
    },

    /// Encoding of a single item failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The job store rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classify this error for item-level reporting.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Encode(e) => e.kind(),
            _ => FailureKind::Unexpected,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Encoder errors
// ---------------------------------------------------------------------------

/// Typed failure reported by an [`Encoder`](crate::Encoder).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Missing, unreadable, or unsuitable source.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The encoder process reported a failure.
    #[error("Conversion failed: {0}")]
    ConversionFailure(String),

    /// Not enough free space for the output.
    #[error("Insufficient disk space: {0}")]
    InsufficientSpace(String),

    /// The item exceeded its allotted processing time.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl EncodeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EncodeError::InvalidInput(_) => FailureKind::InvalidInput,
            EncodeError::ConversionFailure(_) => FailureKind::ConversionFailure,
            EncodeError::InsufficientSpace(_) => FailureKind::InsufficientSpace,
            EncodeError::Timeout(_) => FailureKind::Timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Item failure summaries
// ---------------------------------------------------------------------------

/// Category of an item-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    ConversionFailure,
    InsufficientSpace,
    Timeout,
    /// Anything caught at the item boundary that the encoder did not classify.
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::ConversionFailure => "conversion_failure",
            FailureKind::InsufficientSpace => "insufficient_space",
            FailureKind::Timeout => "timeout",
            FailureKind::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// Item-scoped failure record carried by `error` events and run summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub item: String,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(item: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_encode(item: impl Into<String>, err: &EncodeError) -> Self {
        Self::new(item, err.kind(), err.to_string())
    }

    pub fn unexpected(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(item, FailureKind::Unexpected, message)
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.item, self.kind, self.message)
    }
}
