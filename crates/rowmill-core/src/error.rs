//! Error types for rowmill.
//!
//! Activities return typed errors so the retry layer can tell transient
//! failures (retried with backoff) apart from terminal ones (surfaced
//! immediately).

use std::time::Duration;

use thiserror::Error;

/// Result type alias for rowmill operations.
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Errors raised by activities and workflows.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// File system or object-store I/O failed.
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// The requested file does not exist under the store root.
    #[error("file not found: {directory}/{filename}")]
    FileNotFound { directory: String, filename: String },

    /// A byte range with `start > end` was requested.
    #[error("invalid byte range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },

    /// No line terminator within the scan window after an offset.
    /// The chunk cannot be aligned to a row boundary.
    #[error("no line terminator within {window} bytes after offset {offset}")]
    BoundaryAlignment { offset: u64, window: u64 },

    /// File analysis could not produce a partitioning plan.
    #[error("file analysis failed: {0}")]
    Analysis(String),

    /// A chunk workflow failed after exhausting its retries.
    #[error("chunk {chunk_index} failed: {message}")]
    ChunkFailed { chunk_index: u32, message: String },

    /// A durable store rejected or lost an operation.
    #[error("repository operation failed: {0}")]
    Repository(String),

    /// An activity exceeded its start-to-close timeout.
    #[error("activity timed out after {0:?}")]
    Timeout(Duration),

    /// An activity failed every attempt its retry policy allowed.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ProcessingError>,
    },

    /// Processing was cancelled by a control signal.
    #[error("processing was cancelled")]
    Cancelled,

    /// The workflow run exceeded its overall time budget.
    #[error("workflow run exceeded {0:?}")]
    RunTimeout(Duration),

    /// A submission or request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No live workflow and no persisted record for the job id.
    #[error("job not found: {0}")]
    JobNotFound(String),
}

impl ProcessingError {
    /// Create a repository error from any display-able cause.
    pub fn repository(cause: impl std::fmt::Display) -> Self {
        Self::Repository(cause.to_string())
    }

    /// Whether the retry executor may run another attempt.
    ///
    /// Alignment failures, cancellation, and validation errors are terminal:
    /// retrying cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Repository(_) | Self::Timeout(_)
        )
    }
}
