//! Control plane: submit jobs, query status, send control signals.
//!
//! Transport-agnostic; an HTTP or CLI surface is a thin adapter over this
//! type.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::{ChunkActivities, FileActivities};
use crate::config::ProcessingConfig;
use crate::error::{ProcessingError, Result};
use crate::model::{FileProcessingRequest, JobStatus};
use crate::processor::{DedupIndex, InMemoryDedupIndex, RowProcessor, UserRowProcessor};
use crate::repository::{
    ChunkProgressRepository, FailedRecordRepository, InMemoryChunkProgressRepository,
    InMemoryFailedRecordRepository, InMemoryJobRepository, JobRepository,
};
use crate::store::{FileStore, LocalFileStore};
use crate::workflow::{JobHandle, JobWorkflow};

/// A job submission from the outside world. Omitted fields take the
/// production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub directory: String,
    pub filename: String,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
    #[serde(default = "default_true")]
    pub enable_deduplication: bool,
    #[serde(default = "default_true")]
    pub reprocess_failures: bool,
}

fn default_chunk_size_mb() -> u64 {
    100
}

fn default_max_parallel_chunks() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl JobSubmission {
    pub fn new(directory: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            filename: filename.into(),
            chunk_size_mb: default_chunk_size_mb(),
            max_parallel_chunks: default_max_parallel_chunks(),
            enable_deduplication: true,
            reprocess_failures: true,
        }
    }
}

/// Identifiers returned from a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStartResponse {
    pub job_id: String,
    pub workflow_id: String,
}

/// External dependencies of the engine, wired once at startup.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn FileStore>,
    pub processor: Arc<dyn RowProcessor>,
    pub jobs: Arc<dyn JobRepository>,
    pub chunk_progress: Arc<dyn ChunkProgressRepository>,
    pub failed: Arc<dyn FailedRecordRepository>,
    pub dedup: Arc<dyn DedupIndex>,
}

impl EngineDeps {
    /// In-memory repositories and the stock user-row processor over a local
    /// directory tree. The configuration for tests and single-process runs.
    pub fn local(base_dir: impl Into<std::path::PathBuf>) -> Self {
        let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(base_dir));
        let failed: Arc<dyn FailedRecordRepository> =
            Arc::new(InMemoryFailedRecordRepository::new());
        let dedup: Arc<dyn DedupIndex> = Arc::new(InMemoryDedupIndex::new());
        let processor: Arc<dyn RowProcessor> =
            Arc::new(UserRowProcessor::new(failed.clone(), dedup.clone()));
        Self {
            store,
            processor,
            jobs: Arc::new(InMemoryJobRepository::new()),
            chunk_progress: Arc::new(InMemoryChunkProgressRepository::new()),
            failed,
            dedup,
        }
    }
}

/// Coordinates job workflows: submission, queries, and control signals.
///
/// Live workflows are queried directly; once a workflow settles, the
/// persisted job record is authoritative.
pub struct JobCoordinator {
    config: ProcessingConfig,
    deps: EngineDeps,
    chunk_activities: Arc<ChunkActivities>,
    file_activities: Arc<FileActivities>,
    handles: Arc<RwLock<HashMap<String, JobHandle>>>,
    cancel: CancellationToken,
}

impl JobCoordinator {
    pub fn new(config: ProcessingConfig, deps: EngineDeps) -> Self {
        let chunk_activities = Arc::new(ChunkActivities::new(
            deps.store.clone(),
            deps.processor.clone(),
            deps.chunk_progress.clone(),
        ));
        let file_activities = Arc::new(FileActivities::new(
            deps.store.clone(),
            deps.processor.clone(),
            deps.failed.clone(),
            deps.jobs.clone(),
            deps.dedup.clone(),
        ));
        Self {
            config,
            deps,
            chunk_activities,
            file_activities,
            handles: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Start a job workflow for a submission.
    ///
    /// Generates the job id, derives the stable workflow id, and returns
    /// immediately; processing runs in the background.
    pub async fn start_job(&self, submission: JobSubmission) -> Result<JobStartResponse> {
        if submission.directory.is_empty() || submission.filename.is_empty() {
            return Err(ProcessingError::InvalidRequest(
                "directory and filename are required".into(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        let request = FileProcessingRequest {
            job_id: job_id.clone(),
            directory: submission.directory,
            filename: submission.filename,
            chunk_size_bytes: submission.chunk_size_mb * 1024 * 1024,
            max_parallel_chunks: submission.max_parallel_chunks,
            enable_deduplication: submission.enable_deduplication,
            reprocess_failures: submission.reprocess_failures,
        };
        self.start_job_with_request(request).await
    }

    /// Start a job workflow for a fully specified request.
    pub async fn start_job_with_request(
        &self,
        request: FileProcessingRequest,
    ) -> Result<JobStartResponse> {
        if request.chunk_size_bytes == 0 {
            return Err(ProcessingError::InvalidRequest(
                "chunk_size_bytes must be greater than zero".into(),
            ));
        }
        if request.max_parallel_chunks == 0 {
            return Err(ProcessingError::InvalidRequest(
                "max_parallel_chunks must be at least 1".into(),
            ));
        }

        let job_id = request.job_id.clone();
        let handle = JobWorkflow::spawn(
            request,
            self.config.clone(),
            self.chunk_activities.clone(),
            self.file_activities.clone(),
            self.deps.jobs.clone(),
            self.cancel.child_token(),
        );
        let workflow_id = handle.workflow_id().to_string();
        self.handles.write().await.insert(job_id.clone(), handle);

        tracing::info!(job_id = %job_id, workflow_id = %workflow_id, "job workflow started");
        Ok(JobStartResponse {
            job_id,
            workflow_id,
        })
    }

    /// Current status of a job: live workflow first, persisted record after
    /// settlement.
    pub async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        if let Some(handle) = self.handles.read().await.get(job_id) {
            return Ok(handle.status().await);
        }
        self.deps
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ProcessingError::JobNotFound(job_id.to_string()))
    }

    /// Status with aggregates freshly recomputed from the chunk map.
    pub async fn get_detailed_progress(&self, job_id: &str) -> Result<JobStatus> {
        if let Some(handle) = self.handles.read().await.get(job_id) {
            return Ok(handle.detailed_progress().await);
        }
        self.deps
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ProcessingError::JobNotFound(job_id.to_string()))
    }

    pub async fn pause(&self, job_id: &str) -> Result<()> {
        self.signal(job_id, JobHandle::pause).await
    }

    pub async fn resume(&self, job_id: &str) -> Result<()> {
        self.signal(job_id, JobHandle::resume).await
    }

    /// Cancel a job. Idempotent; cancelling a terminal job is a no-op.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        if let Some(handle) = self.handles.read().await.get(job_id) {
            handle.cancel();
            return Ok(());
        }
        // Settled jobs acknowledge the cancel without acting on it.
        match self.deps.jobs.get(job_id).await? {
            Some(_) => Ok(()),
            None => Err(ProcessingError::JobNotFound(job_id.to_string())),
        }
    }

    /// Wait for a job to reach a terminal state. Mostly useful in tests and
    /// headless runs.
    pub async fn wait_for_completion(&self, job_id: &str) -> Result<JobStatus> {
        let handle = {
            let handles = self.handles.read().await;
            handles.get(job_id).cloned()
        };
        match handle {
            Some(handle) => Ok(handle.wait().await),
            None => self
                .deps
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| ProcessingError::JobNotFound(job_id.to_string())),
        }
    }

    /// Latest progress snapshot of one chunk of a live job.
    pub async fn get_chunk_progress(
        &self,
        job_id: &str,
        chunk_index: u32,
    ) -> Result<Option<crate::model::ChunkProgress>> {
        if let Some(handle) = self.handles.read().await.get(job_id) {
            return Ok(handle.chunk_progress(chunk_index).await);
        }
        self.deps.chunk_progress.get(job_id, chunk_index).await
    }

    /// All persisted chunk snapshots for a job, in chunk-index order.
    pub async fn list_chunk_progress(
        &self,
        job_id: &str,
    ) -> Result<Vec<crate::model::ChunkProgress>> {
        self.deps.chunk_progress.list_for_job(job_id).await
    }

    /// Cancel every live workflow.
    pub fn shutdown(&self) {
        tracing::info!("coordinator shutdown requested");
        self.cancel.cancel();
    }

    /// Cancel every live workflow and wait for all of them to settle.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let handles: Vec<JobHandle> = self.handles.read().await.values().cloned().collect();
        futures::future::join_all(handles.iter().map(|handle| handle.wait())).await;
        tracing::info!(jobs = handles.len(), "coordinator shut down");
    }

    async fn signal(&self, job_id: &str, send: impl Fn(&JobHandle)) -> Result<()> {
        let handles = self.handles.read().await;
        let handle = handles
            .get(job_id)
            .ok_or_else(|| ProcessingError::JobNotFound(job_id.to_string()))?;
        send(handle);
        Ok(())
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobState;

    async fn coordinator_with_file(content: &[u8]) -> (tempfile::TempDir, JobCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::write(dir.path().join("in/users.csv"), content)
            .await
            .unwrap();
        let deps = EngineDeps::local(dir.path());
        (dir, JobCoordinator::new(ProcessingConfig::default(), deps))
    }

    #[tokio::test]
    async fn start_job_derives_the_workflow_id() {
        let (_dir, coordinator) =
            coordinator_with_file(b"id,name,email,company_name,address\n").await;
        let response = coordinator
            .start_job(JobSubmission::new("in", "users.csv"))
            .await
            .unwrap();
        assert_eq!(
            response.workflow_id,
            format!("file-processing-{}", response.job_id)
        );
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let (_dir, coordinator) = coordinator_with_file(b"x\n").await;
        let err = coordinator.get_status("nope").await.unwrap_err();
        assert!(matches!(err, ProcessingError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected() {
        let (_dir, coordinator) = coordinator_with_file(b"x\n").await;
        let mut submission = JobSubmission::new("in", "users.csv");
        submission.chunk_size_mb = 0;
        let err = coordinator.start_job(submission).await.unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidRequest(_)));

        let err = coordinator
            .start_job(JobSubmission::new("", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn status_falls_back_to_the_persisted_record_after_settlement() {
        let (_dir, coordinator) =
            coordinator_with_file(b"id,name,email,company_name,address\n1,A,a@x.com,C,HQ\n").await;
        let response = coordinator
            .start_job(JobSubmission::new("in", "users.csv"))
            .await
            .unwrap();
        let status = coordinator.wait_for_completion(&response.job_id).await.unwrap();
        assert_eq!(status.status, JobState::Completed);

        // Drop the live handle; the repository answer matches.
        coordinator.handles.write().await.remove(&response.job_id);
        let persisted = coordinator.get_status(&response.job_id).await.unwrap();
        assert_eq!(persisted.status, JobState::Completed);
        assert_eq!(persisted.job_id, response.job_id);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_a_noop_on_terminal_jobs() {
        let (_dir, coordinator) =
            coordinator_with_file(b"id,name,email,company_name,address\n1,A,a@x.com,C,HQ\n").await;
        let response = coordinator
            .start_job(JobSubmission::new("in", "users.csv"))
            .await
            .unwrap();
        let status = coordinator.wait_for_completion(&response.job_id).await.unwrap();
        assert_eq!(status.status, JobState::Completed);

        coordinator.cancel(&response.job_id).await.unwrap();
        coordinator.cancel(&response.job_id).await.unwrap();
        let status = coordinator.get_status(&response.job_id).await.unwrap();
        assert_eq!(status.status, JobState::Completed);
    }

    #[tokio::test]
    async fn submission_defaults_mirror_production() {
        let submission: JobSubmission =
            serde_json::from_str(r#"{"directory":"in","filename":"f.csv"}"#).unwrap();
        assert_eq!(submission.chunk_size_mb, 100);
        assert_eq!(submission.max_parallel_chunks, 10);
        assert!(submission.enable_deduplication);
        assert!(submission.reprocess_failures);
    }
}
