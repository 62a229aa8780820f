//! Rowmill Core - chunked parallel processing for very large delimited files
//!
//! Rowmill partitions a multi-gigabyte delimited file into row-aligned byte
//! ranges, processes those partitions under a bounded parallelism cap, tracks
//! per-chunk and job-wide progress, and reacts to pause/resume/cancel signals
//! while work is in flight. A final pass retries rows that failed the first
//! time around.
//!
//! # Architecture
//!
//! ```text
//! JobCoordinator (control plane)
//!     │ start / status / pause / resume / cancel
//!     ▼
//! JobWorkflow "file-processing-{job}"
//!     │ analyze ──► bounded scheduler ──► aggregate ──► reprocess ──► finalize
//!     │                   │ spawns, active <= max_parallel_chunks
//!     ▼                   ▼
//! FileActivities     ChunkWorkflow "{job}-chunk-{i}"
//!                         │ boundaries ──► read ──► batches ──► finalize
//!                         ▼
//!                    ChunkActivities ──► RowProcessor (pluggable)
//! ```
//!
//! Workflows are deterministic: clocks, I/O, and repositories are reached
//! only through activities, which the workflows run under retry policies
//! with start-to-close timeouts.

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod processor;
pub mod repository;
pub mod retry;
pub mod store;
pub mod workflow;

pub use config::ProcessingConfig;
pub use coordinator::{EngineDeps, JobCoordinator, JobStartResponse, JobSubmission};
pub use error::{ProcessingError, Result};
pub use model::{
    ChunkProgress, ChunkStatus, FailedRecord, FailureType, FileProcessingRequest, JobState,
    JobStatus,
};
pub use processor::{RowProcessor, UserRowProcessor};
pub use store::{FileStore, LocalFileStore};
pub use workflow::{ChunkWorkflow, JobWorkflow};
