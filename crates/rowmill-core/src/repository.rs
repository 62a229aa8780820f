//! Durable stores for job records, chunk progress, and failed rows.
//!
//! The workflows see only the traits; the in-memory implementations back
//! tests and single-process deployments. A database-backed implementation
//! plugs in behind the same seams.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{ChunkProgress, FailedRecord, FailedRecordKey, JobStatus};

/// Job records keyed by job id.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn upsert(&self, status: &JobStatus) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>>;

    /// Idempotent finalization hook for external state and caches.
    async fn finalize(&self, job_id: &str) -> Result<()>;
}

/// Chunk progress keyed by `(job_id, chunk_index)`.
#[async_trait]
pub trait ChunkProgressRepository: Send + Sync {
    /// Idempotent upsert. A snapshot with `processed_rows` greater than or
    /// equal to the stored one supersedes it; a stale snapshot is ignored.
    async fn upsert(&self, progress: &ChunkProgress) -> Result<()>;

    async fn get(&self, job_id: &str, chunk_index: u32) -> Result<Option<ChunkProgress>>;

    /// All chunk snapshots for a job, in chunk-index order.
    async fn list_for_job(&self, job_id: &str) -> Result<Vec<ChunkProgress>>;
}

/// Failed rows, appended by row processing, consumed by the reprocess pass.
#[async_trait]
pub trait FailedRecordRepository: Send + Sync {
    /// Append a failed row. Re-appending the same identity
    /// `(job_id, chunk_index, line_number)` is a no-op.
    async fn append(&self, record: FailedRecord) -> Result<()>;

    /// Failed rows for a job, in `(chunk_index, line_number)` order.
    /// With `include_reprocessed` false, rows already reprocessed are
    /// filtered out.
    async fn get_for_job(
        &self,
        job_id: &str,
        include_reprocessed: bool,
    ) -> Result<Vec<FailedRecord>>;

    async fn mark_reprocessed(&self, key: &FailedRecordKey) -> Result<()>;
}

/// In-memory job records.
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<RwLock<HashMap<String, JobStatus>>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn upsert(&self, status: &JobStatus) -> Result<()> {
        self.jobs
            .write()
            .await
            .insert(status.job_id.clone(), status.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn finalize(&self, job_id: &str) -> Result<()> {
        tracing::debug!(job_id, "job record finalized");
        Ok(())
    }
}

/// In-memory chunk progress.
#[derive(Clone, Default)]
pub struct InMemoryChunkProgressRepository {
    chunks: Arc<RwLock<HashMap<(String, u32), ChunkProgress>>>,
}

impl InMemoryChunkProgressRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkProgressRepository for InMemoryChunkProgressRepository {
    async fn upsert(&self, progress: &ChunkProgress) -> Result<()> {
        let key = (progress.job_id.clone(), progress.chunk_index);
        let mut chunks = self.chunks.write().await;
        match chunks.get(&key) {
            Some(existing) if existing.processed_rows > progress.processed_rows => {
                tracing::debug!(
                    job_id = %progress.job_id,
                    chunk_index = progress.chunk_index,
                    stored = existing.processed_rows,
                    incoming = progress.processed_rows,
                    "ignoring stale chunk progress snapshot"
                );
            }
            _ => {
                chunks.insert(key, progress.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: &str, chunk_index: u32) -> Result<Option<ChunkProgress>> {
        Ok(self
            .chunks
            .read()
            .await
            .get(&(job_id.to_string(), chunk_index))
            .cloned())
    }

    async fn list_for_job(&self, job_id: &str) -> Result<Vec<ChunkProgress>> {
        let chunks = self.chunks.read().await;
        let mut result: Vec<ChunkProgress> = chunks
            .values()
            .filter(|p| p.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.chunk_index);
        Ok(result)
    }
}

/// In-memory failed rows.
#[derive(Clone, Default)]
pub struct InMemoryFailedRecordRepository {
    records: Arc<RwLock<HashMap<FailedRecordKey, FailedRecord>>>,
}

impl InMemoryFailedRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedRecordRepository for InMemoryFailedRecordRepository {
    async fn append(&self, record: FailedRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.entry(record.key()).or_insert(record);
        Ok(())
    }

    async fn get_for_job(
        &self,
        job_id: &str,
        include_reprocessed: bool,
    ) -> Result<Vec<FailedRecord>> {
        let records = self.records.read().await;
        let mut result: Vec<FailedRecord> = records
            .values()
            .filter(|r| r.job_id == job_id && (include_reprocessed || !r.reprocessed))
            .cloned()
            .collect();
        result.sort_by_key(|r| (r.chunk_index, r.line_number));
        Ok(result)
    }

    async fn mark_reprocessed(&self, key: &FailedRecordKey) -> Result<()> {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.reprocessed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkStatus, FailureType};
    use chrono::Utc;

    fn progress(job_id: &str, chunk_index: u32, processed: u64) -> ChunkProgress {
        let mut p = ChunkProgress::pending(job_id, chunk_index);
        p.status = ChunkStatus::Processing;
        p.processed_rows = processed;
        p.valid_rows = processed;
        p
    }

    fn failed(job_id: &str, chunk_index: u32, line: u64) -> FailedRecord {
        FailedRecord {
            job_id: job_id.to_string(),
            chunk_index,
            line_number: line,
            raw_row: "raw".into(),
            failure_type: FailureType::ValidationError,
            validation_errors: vec!["email is required".into()],
            error_message: "validation failed".into(),
            failure_time: Utc::now(),
            reprocessed: false,
            row_id: None,
        }
    }

    #[tokio::test]
    async fn chunk_upsert_keeps_latest_snapshot() {
        let repo = InMemoryChunkProgressRepository::new();
        repo.upsert(&progress("job", 0, 100)).await.unwrap();
        repo.upsert(&progress("job", 0, 300)).await.unwrap();
        let stored = repo.get("job", 0).await.unwrap().unwrap();
        assert_eq!(stored.processed_rows, 300);
    }

    #[tokio::test]
    async fn chunk_upsert_ignores_stale_snapshot() {
        let repo = InMemoryChunkProgressRepository::new();
        repo.upsert(&progress("job", 0, 300)).await.unwrap();
        repo.upsert(&progress("job", 0, 100)).await.unwrap();
        let stored = repo.get("job", 0).await.unwrap().unwrap();
        assert_eq!(stored.processed_rows, 300);
    }

    #[tokio::test]
    async fn chunk_upsert_is_idempotent() {
        let repo = InMemoryChunkProgressRepository::new();
        let snapshot = progress("job", 2, 500);
        repo.upsert(&snapshot).await.unwrap();
        repo.upsert(&snapshot).await.unwrap();
        let listed = repo.list_for_job("job").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].processed_rows, 500);
    }

    #[tokio::test]
    async fn chunk_list_is_ordered_by_index() {
        let repo = InMemoryChunkProgressRepository::new();
        repo.upsert(&progress("job", 3, 1)).await.unwrap();
        repo.upsert(&progress("job", 0, 1)).await.unwrap();
        repo.upsert(&progress("other", 1, 1)).await.unwrap();
        let listed = repo.list_for_job("job").await.unwrap();
        assert_eq!(
            listed.iter().map(|p| p.chunk_index).collect::<Vec<_>>(),
            vec![0, 3]
        );
    }

    #[tokio::test]
    async fn failed_append_dedupes_on_identity() {
        let repo = InMemoryFailedRecordRepository::new();
        repo.append(failed("job", 0, 7)).await.unwrap();
        repo.append(failed("job", 0, 7)).await.unwrap();
        repo.append(failed("job", 1, 7)).await.unwrap();
        let all = repo.get_for_job("job", true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn mark_reprocessed_filters_from_default_fetch() {
        let repo = InMemoryFailedRecordRepository::new();
        let record = failed("job", 0, 3);
        let key = record.key();
        repo.append(record).await.unwrap();
        repo.mark_reprocessed(&key).await.unwrap();

        assert!(repo.get_for_job("job", false).await.unwrap().is_empty());
        let with_reprocessed = repo.get_for_job("job", true).await.unwrap();
        assert_eq!(with_reprocessed.len(), 1);
        assert!(with_reprocessed[0].reprocessed);
    }

    #[tokio::test]
    async fn job_upsert_and_get() {
        let repo = InMemoryJobRepository::new();
        assert!(repo.get("missing").await.unwrap().is_none());

        let request = crate::model::FileProcessingRequest {
            job_id: "job".into(),
            directory: "in".into(),
            filename: "data.csv".into(),
            chunk_size_bytes: 1024,
            max_parallel_chunks: 2,
            enable_deduplication: true,
            reprocess_failures: true,
        };
        let status = JobStatus::started(&request);
        repo.upsert(&status).await.unwrap();
        repo.finalize("job").await.unwrap();
        repo.finalize("job").await.unwrap();
        assert_eq!(repo.get("job").await.unwrap().unwrap().job_id, "job");
    }
}
