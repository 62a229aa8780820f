//! Data model for jobs, chunks, and failed rows.
//!
//! Status enums serialize SCREAMING_SNAKE_CASE because that is the layout
//! persisted by the repositories and read back by operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable description of one end-to-end job, created once by the control
/// plane. The tuple `(directory, filename, chunk_size_bytes)` fully
/// determines the partitioning plan for a given snapshot of the file bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessingRequest {
    pub job_id: String,
    pub directory: String,
    pub filename: String,
    pub chunk_size_bytes: u64,
    pub max_parallel_chunks: usize,
    pub enable_deduplication: bool,
    pub reprocess_failures: bool,
}

/// Outcome of sizing and sampling the input file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FileAnalysisResult {
    pub file_size_bytes: u64,
    pub estimated_row_count: u64,
    /// `ceil(file_size_bytes / chunk_size_bytes)`.
    pub total_chunks: u32,
    pub chunk_size_bytes: u64,
}

/// Row-aligned half-open byte range owned by one chunk.
///
/// `start_offset` is 0 or immediately follows a line terminator;
/// `end_offset` is the file size or immediately follows a line terminator.
/// A degenerate chunk (`start_offset == end_offset`) owns no rows; it occurs
/// when a single row spans more than one raw chunk width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBoundaries {
    pub start_offset: u64,
    pub end_offset: u64,
    pub actual_chunk_size: u64,
}

/// Raw bytes of one chunk plus its row census.
#[derive(Debug, Clone)]
pub struct ChunkData {
    data: Vec<u8>,
    row_count: u64,
    includes_header: bool,
}

/// One raw row handed to the row processor.
///
/// `line_number` is the 1-based ordinal of the line within its chunk,
/// counting the header line when the chunk includes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line_number: u64,
    pub text: String,
}

impl ChunkData {
    /// Build chunk data from raw bytes.
    ///
    /// `includes_header` marks the chunk that starts at offset 0; its first
    /// line is the file header and is excluded from the row count.
    pub fn new(data: Vec<u8>, includes_header: bool) -> Self {
        let lines = count_data_lines(&data);
        let row_count = if includes_header {
            lines.saturating_sub(1)
        } else {
            lines
        };
        Self {
            data,
            row_count,
            includes_header,
        }
    }

    /// Number of data rows in the chunk, header excluded.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Data rows in chunk order, header skipped, `\r\n` endings tolerated.
    /// Blank lines are not rows.
    pub fn rows(&self) -> Vec<RawRow> {
        let text = String::from_utf8_lossy(&self.data);
        let mut rows = Vec::with_capacity(self.row_count as usize);
        let mut skip_header = self.includes_header;
        for (index, line) in text.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            if skip_header {
                skip_header = false;
                continue;
            }
            rows.push(RawRow {
                line_number: index as u64 + 1,
                text: line.to_string(),
            });
        }
        rows
    }
}

fn count_data_lines(data: &[u8]) -> u64 {
    let text = String::from_utf8_lossy(data);
    text.split('\n')
        .filter(|line| !line.strip_suffix('\r').unwrap_or(line).is_empty())
        .count() as u64
}

/// Counters returned by one row-processor invocation.
/// Invariant: `processed_count = valid_count + invalid_count + duplicate_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub processed_count: u64,
    pub valid_count: u64,
    pub invalid_count: u64,
    pub duplicate_count: u64,
}

impl BatchProcessingResult {
    pub fn accumulate(&mut self, other: &BatchProcessingResult) {
        self.processed_count += other.processed_count;
        self.valid_count += other.valid_count;
        self.invalid_count += other.invalid_count;
        self.duplicate_count += other.duplicate_count;
    }
}

/// Lifecycle of a chunk workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Pending,
    Reading,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ChunkStatus {
    /// `Completed` is terminal-success, `Failed` terminal-failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Progress of one chunk workflow, keyed by `(job_id, chunk_index)`.
///
/// Counters satisfy `processed_rows = valid_rows + invalid_rows +
/// duplicate_rows` and are monotonically non-decreasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub job_id: String,
    pub chunk_index: u32,
    pub start_offset: u64,
    pub end_offset: u64,
    pub status: ChunkStatus,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    pub duplicate_rows: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_attempt: u32,
}

impl ChunkProgress {
    /// Fresh `Pending` progress for a chunk about to run.
    pub fn pending(job_id: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            job_id: job_id.into(),
            chunk_index,
            start_offset: 0,
            end_offset: 0,
            status: ChunkStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            valid_rows: 0,
            invalid_rows: 0,
            duplicate_rows: 0,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            retry_attempt: 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.processed_rows as f64 / self.total_rows as f64 * 100.0
    }
}

/// Lifecycle of a job workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Started,
    AnalyzingFile,
    ProcessingChunks,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Job-wide status, written only by the owning job workflow until terminal.
///
/// Aggregate counters equal the componentwise sum over chunks that reached
/// `COMPLETED`; `completed_chunks <= total_chunks` always.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub directory: String,
    pub filename: String,
    pub status: JobState,
    /// Estimated from the analysis sample, not a hard count.
    pub total_rows: u64,
    pub processed_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    pub duplicate_rows: u64,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl JobStatus {
    /// Initial `STARTED` status for a freshly submitted request.
    pub fn started(request: &FileProcessingRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.job_id.clone(),
            directory: request.directory.clone(),
            filename: request.filename.clone(),
            status: JobState::Started,
            total_rows: 0,
            processed_rows: 0,
            valid_rows: 0,
            invalid_rows: 0,
            duplicate_rows: 0,
            total_chunks: 0,
            completed_chunks: 0,
            start_time: now,
            last_update_time: now,
            error_message: None,
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.completed_chunks as f64 / self.total_chunks as f64 * 100.0
    }
}

/// Why a row could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ValidationError,
    ProcessingError,
    DuplicateRow,
    ParseError,
}

/// Identity of a failed record within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailedRecordKey {
    pub job_id: String,
    pub chunk_index: u32,
    pub line_number: u64,
}

/// A row that could not be processed, kept for inspection and reprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub job_id: String,
    pub chunk_index: u32,
    pub line_number: u64,
    pub raw_row: String,
    pub failure_type: FailureType,
    pub validation_errors: Vec<String>,
    pub error_message: String,
    pub failure_time: DateTime<Utc>,
    pub reprocessed: bool,
    /// Extracted row id, when the row parsed far enough to have one.
    pub row_id: Option<String>,
}

impl FailedRecord {
    pub fn key(&self) -> FailedRecordKey {
        FailedRecordKey {
            job_id: self.job_id.clone(),
            chunk_index: self.chunk_index,
            line_number: self.line_number,
        }
    }
}

/// Outcome of one reprocessing pass over previously failed rows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReprocessingResult {
    pub total_records: u64,
    pub successfully_processed: u64,
    pub still_failed: u64,
}
