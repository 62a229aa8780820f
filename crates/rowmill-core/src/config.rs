//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// Target partition size prior to row alignment.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Hard cap on concurrently running chunk workflows.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 10;

/// Row count handed to the row processor per batch.
pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Max bytes scanned forward when aligning a chunk boundary to a row.
pub const DEFAULT_BOUNDARY_SCAN_WINDOW_BYTES: u64 = 1024;

/// Prefix size sampled to estimate the file's average bytes per row.
pub const DEFAULT_ANALYSIS_SAMPLE_BYTES: u64 = 1024 * 1024;

/// Budget for a job across all runs of its workflow.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Budget for a single run of the job workflow.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Tunable knobs of the processing engine.
///
/// Every field has a production default; deserializing an empty document
/// yields the same configuration as [`ProcessingConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Target partition size prior to alignment.
    pub chunk_size_bytes: u64,
    /// Hard cap on concurrent chunk workflows.
    pub max_parallel_chunks: usize,
    /// Turns on per-job row-id uniqueness detection.
    pub enable_deduplication: bool,
    /// Runs the reprocess pass after all chunks settle.
    pub reprocess_failures: bool,
    /// Row count per processing batch.
    pub batch_size: u64,
    /// Max bytes scanned forward when aligning a boundary.
    pub boundary_scan_window_bytes: u64,
    /// Prefix size used for row-rate estimation.
    pub analysis_sample_bytes: u64,
    /// Overall job budget across runs, in seconds.
    pub execution_timeout_secs: u64,
    /// Budget for a single workflow run, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            max_parallel_chunks: DEFAULT_MAX_PARALLEL_CHUNKS,
            enable_deduplication: true,
            reprocess_failures: true,
            batch_size: DEFAULT_BATCH_SIZE,
            boundary_scan_window_bytes: DEFAULT_BOUNDARY_SCAN_WINDOW_BYTES,
            analysis_sample_bytes: DEFAULT_ANALYSIS_SAMPLE_BYTES,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT.as_secs(),
            run_timeout_secs: DEFAULT_RUN_TIMEOUT.as_secs(),
        }
    }
}

impl ProcessingConfig {
    /// Check that the configuration can drive a job at all.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(ProcessingError::InvalidRequest(
                "chunk_size_bytes must be greater than zero".into(),
            ));
        }
        if self.max_parallel_chunks == 0 {
            return Err(ProcessingError::InvalidRequest(
                "max_parallel_chunks must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ProcessingError::InvalidRequest(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.boundary_scan_window_bytes == 0 {
            return Err(ProcessingError::InvalidRequest(
                "boundary_scan_window_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProcessingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_parallel_chunks, 10);
        assert!(config.enable_deduplication);
        assert!(config.reprocess_failures);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.boundary_scan_window_bytes, 1024);
        assert_eq!(config.analysis_sample_bytes, 1024 * 1024);
    }

    #[test]
    fn empty_document_deserializes_to_defaults() {
        let config: ProcessingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert_eq!(config.run_timeout(), DEFAULT_RUN_TIMEOUT);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = ProcessingConfig {
            chunk_size_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let config = ProcessingConfig {
            max_parallel_chunks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
