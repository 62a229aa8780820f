//! Job workflow: drives analysis, bounded-parallel chunk scheduling,
//! aggregate progress, the optional reprocess pass, and finalization.
//!
//! The workflow is a single task; every orchestration decision and every
//! write to the job status happens on it. Chunk completions funnel through
//! one channel, so aggregates are recomputed from the authoritative
//! per-chunk map without locking games.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::activity::{ChunkActivities, FileActivities};
use crate::config::ProcessingConfig;
use crate::error::{ProcessingError, Result};
use crate::model::{ChunkProgress, FileProcessingRequest, JobState, JobStatus};
use crate::repository::JobRepository;
use crate::retry::{run_with_retry, RetryPolicy};

use super::chunk::{ChunkHandle, ChunkWorkflow};

/// Stable workflow id derivation, used for all subsequent lookups.
pub fn job_workflow_id(job_id: &str) -> String {
    format!("file-processing-{job_id}")
}

/// Queries and control signals for a running (or finished) job workflow.
#[derive(Clone)]
pub struct JobHandle {
    job_id: String,
    workflow_id: String,
    status: Arc<RwLock<JobStatus>>,
    chunks: Arc<RwLock<HashMap<u32, ChunkProgress>>>,
    live_chunks: Arc<RwLock<HashMap<u32, ChunkHandle>>>,
    paused_tx: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Latest job status snapshot.
    pub async fn status(&self) -> JobStatus {
        self.status.read().await.clone()
    }

    /// Job status with aggregates freshly recomputed from the chunk map.
    /// Terminal statuses are returned as-is: the reprocess pass adjusts
    /// counters beyond the chunk sums, and those adjustments stick.
    pub async fn detailed_progress(&self) -> JobStatus {
        let mut status = self.status.read().await.clone();
        if status.status.is_terminal() {
            return status;
        }
        let chunks = self.chunks.read().await;
        aggregate_into(&mut status, &chunks);
        status
    }

    /// Latest in-memory snapshot of one chunk workflow, live or settled.
    pub async fn chunk_progress(&self, chunk_index: u32) -> Option<ChunkProgress> {
        if let Some(handle) = self.live_chunks.read().await.get(&chunk_index) {
            return Some(handle.progress());
        }
        self.chunks.read().await.get(&chunk_index).cloned()
    }

    /// Pause: the scheduler stops launching children and recording progress
    /// at its next suspension point. In-flight children keep running.
    pub fn pause(&self) {
        tracing::info!(job_id = %self.job_id, "pause signal received");
        self.paused_tx.send_replace(true);
    }

    pub fn resume(&self) {
        tracing::info!(job_id = %self.job_id, "resume signal received");
        self.paused_tx.send_replace(false);
    }

    /// Cancel: clears any pause so the scheduler wakes, then cancels.
    /// Idempotent; a no-op once the workflow is terminal.
    pub fn cancel(&self) {
        tracing::info!(job_id = %self.job_id, "cancel signal received");
        self.paused_tx.send_replace(false);
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait for the workflow to reach a terminal state.
    pub async fn wait(&self) -> JobStatus {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
        self.status().await
    }
}

/// Sum the chunk map into the job-level counters.
/// `completed_chunks` is the number of chunks that reached `COMPLETED`.
fn aggregate_into(status: &mut JobStatus, chunks: &HashMap<u32, ChunkProgress>) {
    let mut processed = 0;
    let mut valid = 0;
    let mut invalid = 0;
    let mut duplicates = 0;
    for progress in chunks.values() {
        processed += progress.processed_rows;
        valid += progress.valid_rows;
        invalid += progress.invalid_rows;
        duplicates += progress.duplicate_rows;
    }
    status.processed_rows = processed;
    status.valid_rows = valid;
    status.invalid_rows = invalid;
    status.duplicate_rows = duplicates;
    status.completed_chunks = chunks.len() as u32;
}

enum SchedulerEvent {
    Cancelled,
    PauseChanged,
    Completion(Option<(u32, Result<ChunkProgress>)>),
}

/// Workflow orchestrating one job end to end. Sole writer of its
/// [`JobStatus`] until the status is terminal.
pub struct JobWorkflow {
    request: FileProcessingRequest,
    config: ProcessingConfig,
    chunk_activities: Arc<ChunkActivities>,
    file_activities: Arc<FileActivities>,
    jobs: Arc<dyn JobRepository>,
    status: Arc<RwLock<JobStatus>>,
    chunks: Arc<RwLock<HashMap<u32, ChunkProgress>>>,
    live_chunks: Arc<RwLock<HashMap<u32, ChunkHandle>>>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    standard: RetryPolicy,
}

impl JobWorkflow {
    /// Start the workflow task and return its handle.
    pub fn spawn(
        request: FileProcessingRequest,
        config: ProcessingConfig,
        chunk_activities: Arc<ChunkActivities>,
        file_activities: Arc<FileActivities>,
        jobs: Arc<dyn JobRepository>,
        cancel: CancellationToken,
    ) -> JobHandle {
        let status = Arc::new(RwLock::new(JobStatus::started(&request)));
        let chunks = Arc::new(RwLock::new(HashMap::new()));
        let live_chunks = Arc::new(RwLock::new(HashMap::new()));
        let (paused_tx, paused_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        let handle = JobHandle {
            job_id: request.job_id.clone(),
            workflow_id: job_workflow_id(&request.job_id),
            status: status.clone(),
            chunks: chunks.clone(),
            live_chunks: live_chunks.clone(),
            paused_tx: Arc::new(paused_tx),
            cancel: cancel.clone(),
            finished: finished_rx,
        };

        let workflow = Self {
            request,
            config,
            chunk_activities,
            file_activities,
            jobs,
            status,
            chunks,
            live_chunks,
            paused: paused_rx,
            cancel,
            standard: RetryPolicy::standard(),
        };
        tokio::spawn(workflow.run(finished_tx));

        handle
    }

    async fn run(mut self, finished_tx: watch::Sender<bool>) {
        let workflow_id = job_workflow_id(&self.request.job_id);
        tracing::info!(workflow_id = %workflow_id, "job workflow started");
        self.persist_status().await;

        let run_timeout = self.config.run_timeout();
        let outcome = match tokio::time::timeout(run_timeout, self.execute()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.cancel.cancel();
                Err(ProcessingError::RunTimeout(run_timeout))
            }
        };

        match outcome {
            Ok(()) => {
                self.transition(JobState::Completed, None).await;
                tracing::info!(workflow_id = %workflow_id, "job workflow completed");
            }
            Err(ProcessingError::Cancelled) => {
                self.transition(JobState::Cancelled, Some("processing was cancelled".into()))
                    .await;
                tracing::info!(workflow_id = %workflow_id, "job workflow cancelled");
            }
            Err(error) => {
                self.transition(JobState::Failed, Some(error.to_string())).await;
                tracing::error!(workflow_id = %workflow_id, error = %error, "job workflow failed");
            }
        }
        self.persist_status().await;
        let _ = finished_tx.send(true);
    }

    async fn execute(&mut self) -> Result<()> {
        // Stage 1: analyze the file and seed the partitioning plan.
        self.transition(JobState::AnalyzingFile, None).await;
        self.persist_status().await;

        let activities = self.file_activities.clone();
        let request = self.request.clone();
        let sample_bytes = self.config.analysis_sample_bytes;
        let analysis = run_with_retry(&self.standard, &self.cancel, "analyze_file", || {
            activities.analyze_file(
                &request.directory,
                &request.filename,
                request.chunk_size_bytes,
                sample_bytes,
            )
        })
        .await
        .map_err(|e| match e {
            ProcessingError::Cancelled => ProcessingError::Cancelled,
            other => ProcessingError::Analysis(other.to_string()),
        })?;

        {
            let mut status = self.status.write().await;
            status.total_rows = analysis.estimated_row_count;
            status.total_chunks = analysis.total_chunks;
            status.status = JobState::ProcessingChunks;
            status.last_update_time = Utc::now();
        }
        self.persist_status().await;

        // Stage 2: chunks under the parallelism cap.
        self.process_chunks(analysis.total_chunks).await?;

        // Stage 3: optional reprocess pass over recorded failures.
        if self.request.reprocess_failures {
            self.reprocess_failures().await?;
        }

        // Stage 4: finalize.
        let activities = self.file_activities.clone();
        let job_id = self.request.job_id.clone();
        run_with_retry(&self.standard, &self.cancel, "finalize_job", || {
            activities.finalize_job(&job_id)
        })
        .await?;

        Ok(())
    }

    /// Spawn chunk workflows in ascending index order, never exceeding
    /// `max_parallel_chunks` in flight. Completions are drained on this task
    /// only, and only while not paused.
    async fn process_chunks(&mut self, total_chunks: u32) -> Result<()> {
        tracing::info!(
            total_chunks,
            max_parallel = self.request.max_parallel_chunks,
            "processing chunks"
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u32, Result<ChunkProgress>)>();
        let cap = self.request.max_parallel_chunks.max(1);
        let mut next_index: u32 = 0;
        let mut active: usize = 0;
        let mut failure: Option<(u32, ProcessingError)> = None;

        while next_index < total_chunks || active > 0 {
            self.wait_if_paused().await?;

            // A settled failure stops new spawns; in-flight children drain.
            if failure.is_none() && next_index < total_chunks && active < cap {
                self.spawn_chunk(next_index, done_tx.clone()).await;
                active += 1;
                next_index += 1;
                continue;
            }

            if active == 0 {
                break;
            }

            // Wake on cancellation, a pause/resume edge, or a settling child.
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => SchedulerEvent::Cancelled,
                _ = self.paused.changed() => SchedulerEvent::PauseChanged,
                completion = done_rx.recv() => SchedulerEvent::Completion(completion),
            };
            match event {
                SchedulerEvent::Cancelled => return Err(ProcessingError::Cancelled),
                SchedulerEvent::PauseChanged => continue,
                SchedulerEvent::Completion(None) => break,
                SchedulerEvent::Completion(Some((index, result))) => {
                    active -= 1;
                    self.handle_completion(index, result, &mut failure).await;
                }
            }
        }

        // Recompute once more after the last completion.
        self.recompute_aggregates().await;

        if let Some((chunk_index, error)) = failure {
            return Err(ProcessingError::ChunkFailed {
                chunk_index,
                message: error.to_string(),
            });
        }
        Ok(())
    }

    async fn spawn_chunk(&self, index: u32, done_tx: mpsc::UnboundedSender<(u32, Result<ChunkProgress>)>) {
        let (workflow, handle) = ChunkWorkflow::new(
            self.request.clone(),
            index,
            self.config.clone(),
            self.chunk_activities.clone(),
            self.cancel.child_token(),
        );
        tracing::info!(workflow_id = %handle.workflow_id(), "starting chunk workflow");
        self.live_chunks.write().await.insert(index, handle);

        tokio::spawn(async move {
            let result = workflow.run().await;
            let _ = done_tx.send((index, result));
        });
    }

    async fn handle_completion(
        &mut self,
        index: u32,
        result: Result<ChunkProgress>,
        failure: &mut Option<(u32, ProcessingError)>,
    ) {
        match result {
            Ok(progress) => {
                self.chunks.write().await.insert(index, progress);
                self.recompute_aggregates().await;
                let status = self.status.read().await;
                tracing::info!(
                    chunk_index = index,
                    completed = status.completed_chunks,
                    total = status.total_chunks,
                    "chunk completed"
                );
            }
            Err(error) => {
                tracing::error!(chunk_index = index, error = %error, "chunk workflow failed");
                if failure.is_none() {
                    *failure = Some((index, error));
                }
            }
        }
    }

    async fn recompute_aggregates(&self) {
        let chunks = self.chunks.read().await;
        let mut status = self.status.write().await;
        aggregate_into(&mut status, &chunks);
        status.last_update_time = Utc::now();
    }

    async fn reprocess_failures(&mut self) -> Result<()> {
        let activities = self.file_activities.clone();
        let job_id = self.request.job_id.clone();

        let records = run_with_retry(&self.standard, &self.cancel, "get_failed_records", || {
            activities.get_failed_records(&job_id, false)
        })
        .await?;
        if records.is_empty() {
            return Ok(());
        }

        tracing::info!(job_id = %job_id, count = records.len(), "reprocessing failed records");
        let result = run_with_retry(&self.standard, &self.cancel, "reprocess_failed_records", || {
            activities.reprocess_failed_records(&job_id, &records)
        })
        .await?;

        let mut status = self.status.write().await;
        status.valid_rows += result.successfully_processed;
        status.invalid_rows = status.invalid_rows.saturating_sub(result.successfully_processed);
        status.last_update_time = Utc::now();
        Ok(())
    }

    /// Block while paused. Cancellation clears the pause, so this wakes on
    /// either signal.
    async fn wait_if_paused(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        if !*self.paused.borrow() {
            return Ok(());
        }

        tracing::info!(job_id = %self.request.job_id, "processing paused");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProcessingError::Cancelled),
            changed = self.paused.wait_for(|paused| !paused) => {
                changed.map_err(|_| ProcessingError::Cancelled)?;
            }
        }
        if self.cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        tracing::info!(job_id = %self.request.job_id, "processing resumed");
        Ok(())
    }

    async fn transition(&self, state: JobState, error_message: Option<String>) {
        let mut status = self.status.write().await;
        status.status = state;
        status.error_message = error_message;
        status.last_update_time = Utc::now();
    }

    async fn persist_status(&self) {
        let snapshot = self.status.read().await.clone();
        if let Err(e) = self.jobs.upsert(&snapshot).await {
            tracing::warn!(job_id = %snapshot.job_id, error = %e, "failed to persist job status");
        }
    }
}
