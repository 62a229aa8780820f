//! Chunk workflow: owns one row-aligned partition of the file.
//!
//! State machine:
//!
//! ```text
//! PENDING → READING → PROCESSING → COMPLETED
//!                          ↘ FAILED
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::activity::ChunkActivities;
use crate::config::ProcessingConfig;
use crate::error::{ProcessingError, Result};
use crate::model::{BatchProcessingResult, ChunkProgress, ChunkStatus, FileProcessingRequest};
use crate::retry::{run_with_retry, run_with_retry_observed, RetryPolicy};

/// Stable child-workflow id, used for all lookups of a chunk run.
pub fn chunk_workflow_id(job_id: &str, chunk_index: u32) -> String {
    format!("{job_id}-chunk-{chunk_index}")
}

/// Query handle to a chunk workflow's latest in-memory progress snapshot.
#[derive(Clone)]
pub struct ChunkHandle {
    workflow_id: String,
    progress: watch::Receiver<ChunkProgress>,
}

impl ChunkHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn progress(&self) -> ChunkProgress {
        self.progress.borrow().clone()
    }
}

/// Workflow processing one partition of the input file.
pub struct ChunkWorkflow {
    request: FileProcessingRequest,
    chunk_index: u32,
    config: ProcessingConfig,
    activities: Arc<ChunkActivities>,
    cancel: CancellationToken,
    progress_tx: watch::Sender<ChunkProgress>,
    long: RetryPolicy,
    short: RetryPolicy,
}

impl ChunkWorkflow {
    pub fn new(
        request: FileProcessingRequest,
        chunk_index: u32,
        config: ProcessingConfig,
        activities: Arc<ChunkActivities>,
        cancel: CancellationToken,
    ) -> (Self, ChunkHandle) {
        let initial = ChunkProgress::pending(&request.job_id, chunk_index);
        let (progress_tx, progress_rx) = watch::channel(initial);
        let handle = ChunkHandle {
            workflow_id: chunk_workflow_id(&request.job_id, chunk_index),
            progress: progress_rx,
        };
        (
            Self {
                request,
                chunk_index,
                config,
                activities,
                cancel,
                progress_tx,
                long: RetryPolicy::long(),
                short: RetryPolicy::short(),
            },
            handle,
        )
    }

    #[cfg(test)]
    pub(crate) fn with_policies(mut self, long: RetryPolicy, short: RetryPolicy) -> Self {
        self.long = long;
        self.short = short;
        self
    }

    /// Run the chunk to a terminal state.
    ///
    /// On failure the terminal `FAILED` snapshot is recorded through
    /// `record_chunk_failure` and the error re-raised, so the parent
    /// workflow sees the child as failed.
    pub async fn run(self) -> Result<ChunkProgress> {
        let workflow_id = chunk_workflow_id(&self.request.job_id, self.chunk_index);
        tracing::info!(workflow_id = %workflow_id, "chunk workflow started");

        match self.execute().await {
            Ok(progress) => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    processed = progress.processed_rows,
                    "chunk workflow completed"
                );
                Ok(progress)
            }
            Err(error) => {
                tracing::error!(workflow_id = %workflow_id, error = %error, "chunk workflow failed");
                self.progress_tx.send_modify(|p| {
                    p.status = ChunkStatus::Failed;
                    p.end_time = Some(Utc::now());
                    p.error_message = Some(error.to_string());
                    p.retry_attempt += 1;
                });
                let failed = self.progress_tx.borrow().clone();
                self.activities.record_chunk_failure(&failed).await;
                Err(error)
            }
        }
    }

    async fn execute(&self) -> Result<ChunkProgress> {
        let request = &self.request;
        let activities = &self.activities;

        // Step 1: row-aligned boundaries.
        let boundaries = run_with_retry(&self.short, &self.cancel, "calculate_chunk_boundaries", || {
            activities.calculate_chunk_boundaries(
                &request.directory,
                &request.filename,
                self.chunk_index,
                request.chunk_size_bytes,
                self.config.boundary_scan_window_bytes,
            )
        })
        .await?;

        self.progress_tx.send_modify(|p| {
            p.start_offset = boundaries.start_offset;
            p.end_offset = boundaries.end_offset;
            p.status = ChunkStatus::Reading;
        });

        // Step 2: read the partition.
        let chunk_data = run_with_retry_observed(
            &self.long,
            &self.cancel,
            "read_chunk",
            || {
                activities.read_chunk(
                    &request.directory,
                    &request.filename,
                    boundaries.start_offset,
                    boundaries.end_offset,
                )
            },
            |_, _| self.mark_retrying(),
        )
        .await?;

        self.progress_tx.send_modify(|p| {
            p.total_rows = chunk_data.row_count();
            p.status = ChunkStatus::Processing;
        });

        // Step 3: iterate row batches, accumulating counters.
        let rows = chunk_data.rows();
        let total_rows = rows.len();
        let batch_size = self.config.batch_size.max(1) as usize;
        let progress_every = batch_size * 10;
        let mut totals = BatchProcessingResult::default();

        let mut batch_start = 0;
        while batch_start < total_rows {
            if self.cancel.is_cancelled() {
                return Err(ProcessingError::Cancelled);
            }

            let batch_end = (batch_start + batch_size).min(total_rows);
            let batch = &rows[batch_start..batch_end];

            let result = run_with_retry_observed(
                &self.long,
                &self.cancel,
                "process_row_batch",
                || {
                    activities.process_row_batch(
                        &request.job_id,
                        self.chunk_index,
                        batch,
                        request.enable_deduplication,
                    )
                },
                |_, _| self.mark_retrying(),
            )
            .await?;
            totals.accumulate(&result);

            self.progress_tx.send_modify(|p| {
                p.status = ChunkStatus::Processing;
                p.processed_rows = totals.processed_count;
                p.valid_rows = totals.valid_count;
                p.invalid_rows = totals.invalid_count;
                p.duplicate_rows = totals.duplicate_count;
            });
            let snapshot = self.progress_tx.borrow().clone();

            // Report progress every ten batches and at the final batch.
            if batch_start % progress_every == 0 || batch_end == total_rows {
                run_with_retry(&self.short, &self.cancel, "update_chunk_progress", || {
                    activities.update_chunk_progress(&snapshot)
                })
                .await?;
                tracing::debug!(
                    chunk_index = self.chunk_index,
                    processed = totals.processed_count,
                    total = total_rows,
                    "chunk progress"
                );
            }

            batch_start = batch_end;
        }

        // Step 4: finalize.
        run_with_retry(&self.short, &self.cancel, "finalize_chunk", || {
            activities.finalize_chunk(&request.job_id, self.chunk_index)
        })
        .await?;

        self.progress_tx.send_modify(|p| {
            p.status = ChunkStatus::Completed;
            p.end_time = Some(Utc::now());
        });
        let completed = self.progress_tx.borrow().clone();
        run_with_retry(&self.short, &self.cancel, "update_chunk_progress", || {
            activities.update_chunk_progress(&completed)
        })
        .await?;

        Ok(completed)
    }

    fn mark_retrying(&self) {
        self.progress_tx.send_modify(|p| {
            p.status = ChunkStatus::Retrying;
            p.retry_attempt += 1;
        });
    }
}
