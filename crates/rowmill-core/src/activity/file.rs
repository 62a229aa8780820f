//! File-level activities: analysis, failed-record fetch, the reprocess
//! loop, and job finalization.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{FailedRecord, FileAnalysisResult, ReprocessingResult};
use crate::processor::{DedupIndex, RowProcessor};
use crate::repository::{FailedRecordRepository, JobRepository};
use crate::retry::{Heartbeat, HeartbeatObserver};
use crate::store::FileStore;

/// Fallback bytes-per-row estimate when the sample has no terminator.
const FALLBACK_BYTES_PER_ROW: u64 = 100;

/// Reprocessing emits a heartbeat at least this often, in records.
const REPROCESS_HEARTBEAT_EVERY: u64 = 100;

/// Activities owned by the job workflow.
pub struct FileActivities {
    store: Arc<dyn FileStore>,
    processor: Arc<dyn RowProcessor>,
    failed: Arc<dyn FailedRecordRepository>,
    jobs: Arc<dyn JobRepository>,
    dedup: Arc<dyn DedupIndex>,
    heartbeat: Heartbeat,
    heartbeat_observer: HeartbeatObserver,
}

impl FileActivities {
    pub fn new(
        store: Arc<dyn FileStore>,
        processor: Arc<dyn RowProcessor>,
        failed: Arc<dyn FailedRecordRepository>,
        jobs: Arc<dyn JobRepository>,
        dedup: Arc<dyn DedupIndex>,
    ) -> Self {
        let (heartbeat, heartbeat_observer) = Heartbeat::new();
        Self {
            store,
            processor,
            failed,
            jobs,
            dedup,
            heartbeat,
            heartbeat_observer,
        }
    }

    /// Liveness of the reprocessing activity.
    pub fn heartbeat(&self) -> HeartbeatObserver {
        self.heartbeat_observer.clone()
    }

    /// Size and sample the file to produce the partitioning plan.
    ///
    /// The row estimate extrapolates the average bytes per row over a prefix
    /// sample and subtracts one for the header. A sample without a single
    /// terminator falls back to assuming 100 bytes per row.
    pub async fn analyze_file(
        &self,
        directory: &str,
        filename: &str,
        chunk_size_bytes: u64,
        sample_bytes: u64,
    ) -> Result<FileAnalysisResult> {
        let file_size_bytes = self.store.file_size(directory, filename).await?;
        let total_chunks = file_size_bytes.div_ceil(chunk_size_bytes) as u32;

        let estimated_row_count = if file_size_bytes == 0 {
            0
        } else {
            let sample_len = sample_bytes.min(file_size_bytes);
            let sample = self
                .store
                .read_range(directory, filename, 0, sample_len)
                .await?;
            let terminators = sample.iter().filter(|&&b| b == b'\n').count() as u64;
            if terminators == 0 {
                tracing::warn!(
                    directory,
                    filename,
                    "no line terminator in analysis sample, falling back to size estimate"
                );
                file_size_bytes / FALLBACK_BYTES_PER_ROW
            } else {
                let avg_bytes_per_row = sample.len() as f64 / terminators as f64;
                let estimated_lines = (file_size_bytes as f64 / avg_bytes_per_row) as u64;
                estimated_lines.saturating_sub(1)
            }
        };

        tracing::info!(
            directory,
            filename,
            file_size_bytes,
            estimated_row_count,
            total_chunks,
            "analyzed file"
        );
        Ok(FileAnalysisResult {
            file_size_bytes,
            estimated_row_count,
            total_chunks,
            chunk_size_bytes,
        })
    }

    /// Failed rows recorded for a job.
    pub async fn get_failed_records(
        &self,
        job_id: &str,
        include_reprocessed: bool,
    ) -> Result<Vec<FailedRecord>> {
        let records = self.failed.get_for_job(job_id, include_reprocessed).await?;
        tracing::info!(job_id, count = records.len(), "fetched failed records");
        Ok(records)
    }

    /// Retry previously failed rows one by one.
    ///
    /// Each record is either marked reprocessed or left still-failed; an
    /// individual row failure never aborts the pass. A heartbeat is emitted
    /// at least every 100 records.
    pub async fn reprocess_failed_records(
        &self,
        job_id: &str,
        records: &[FailedRecord],
    ) -> Result<ReprocessingResult> {
        let mut result = ReprocessingResult {
            total_records: records.len() as u64,
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            if index as u64 % REPROCESS_HEARTBEAT_EVERY == 0 {
                self.heartbeat.beat();
            }

            match self.processor.reprocess(record).await {
                Ok(true) => {
                    self.failed.mark_reprocessed(&record.key()).await?;
                    result.successfully_processed += 1;
                }
                Ok(false) => {
                    result.still_failed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id,
                        chunk_index = record.chunk_index,
                        line_number = record.line_number,
                        error = %e,
                        "reprocessing attempt failed"
                    );
                    result.still_failed += 1;
                }
            }
        }

        tracing::info!(
            job_id,
            total = result.total_records,
            succeeded = result.successfully_processed,
            still_failed = result.still_failed,
            "reprocessing pass finished"
        );
        Ok(result)
    }

    /// Idempotent job finalization: flush the job record and drop per-job
    /// caches such as the deduplication index.
    pub async fn finalize_job(&self, job_id: &str) -> Result<()> {
        self.jobs.finalize(job_id).await?;
        if let Err(e) = self.dedup.clear_job(job_id).await {
            tracing::warn!(job_id, error = %e, "failed to clear dedup index");
        }
        tracing::info!(job_id, "finalized job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailedRecord, FailureType};
    use crate::processor::{InMemoryDedupIndex, UserRowProcessor};
    use crate::repository::{InMemoryFailedRecordRepository, InMemoryJobRepository};
    use crate::store::LocalFileStore;
    use chrono::Utc;

    async fn activities_over(content: &[u8]) -> (tempfile::TempDir, FileActivities) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::write(dir.path().join("in/data.csv"), content)
            .await
            .unwrap();

        let store = Arc::new(LocalFileStore::new(dir.path()));
        let failed = Arc::new(InMemoryFailedRecordRepository::new());
        let dedup = Arc::new(InMemoryDedupIndex::new());
        let processor = Arc::new(UserRowProcessor::new(failed.clone(), dedup.clone()));
        let jobs = Arc::new(InMemoryJobRepository::new());
        (
            dir,
            FileActivities::new(store, processor, failed, jobs, dedup),
        )
    }

    fn failed_record(line: u64, raw: &str) -> FailedRecord {
        FailedRecord {
            job_id: "job".into(),
            chunk_index: 0,
            line_number: line,
            raw_row: raw.into(),
            failure_type: FailureType::ValidationError,
            validation_errors: vec!["name is required".into()],
            error_message: "row failed validation".into(),
            failure_time: Utc::now(),
            reprocessed: false,
            row_id: Some(line.to_string()),
        }
    }

    #[tokio::test]
    async fn header_only_file_estimates_zero_rows() {
        let content = b"id,name,email,co,a\n";
        let (_dir, activities) = activities_over(content).await;
        let analysis = activities
            .analyze_file("in", "data.csv", 1024 * 1024, 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(analysis.file_size_bytes, 19);
        assert_eq!(analysis.total_chunks, 1);
        assert_eq!(analysis.estimated_row_count, 0);
    }

    #[tokio::test]
    async fn estimate_extrapolates_from_the_sample() {
        // 100 uniform 20-byte rows; a 200-byte sample sees 10 of them.
        let mut content = Vec::new();
        for i in 0..100 {
            content.extend_from_slice(format!("{i:05},aaaa,bbbb,ccc\n").as_bytes());
        }
        let (_dir, activities) = activities_over(&content).await;
        let analysis = activities
            .analyze_file("in", "data.csv", 1024, 200)
            .await
            .unwrap();
        assert_eq!(analysis.estimated_row_count, 99);
        assert_eq!(analysis.total_chunks, 2000u64.div_ceil(1024) as u32);
    }

    #[tokio::test]
    async fn sample_without_terminator_falls_back() {
        let content = vec![b'x'; 500];
        let (_dir, activities) = activities_over(&content).await;
        let analysis = activities
            .analyze_file("in", "data.csv", 1024, 100)
            .await
            .unwrap();
        assert_eq!(analysis.estimated_row_count, 5);
    }

    #[tokio::test]
    async fn empty_file_has_no_chunks() {
        let (_dir, activities) = activities_over(b"").await;
        let analysis = activities
            .analyze_file("in", "data.csv", 1024, 100)
            .await
            .unwrap();
        assert_eq!(analysis.total_chunks, 0);
        assert_eq!(analysis.estimated_row_count, 0);
    }

    #[tokio::test]
    async fn reprocess_marks_recovered_records_and_heartbeats() {
        let (_dir, activities) = activities_over(b"x\n").await;
        let observer = activities.heartbeat();

        // 250 records; the "fixed" ones now pass validation.
        let mut records = Vec::new();
        for line in 0..250u64 {
            let raw = if line % 2 == 0 {
                format!("{line},Ada,a@x.com,Acme,HQ")
            } else {
                format!("{line},,a@x.com,Acme,HQ")
            };
            records.push(failed_record(line, &raw));
        }
        for record in &records {
            activities.failed.append(record.clone()).await.unwrap();
        }

        let result = activities
            .reprocess_failed_records("job", &records)
            .await
            .unwrap();
        assert_eq!(result.total_records, 250);
        assert_eq!(result.successfully_processed, 125);
        assert_eq!(result.still_failed, 125);
        // One beat per 100 records, at indexes 0, 100, 200.
        assert!(observer.count() >= 3);

        let remaining = activities.get_failed_records("job", false).await.unwrap();
        assert_eq!(remaining.len(), 125);
    }

    #[tokio::test]
    async fn finalize_job_clears_the_dedup_scope() {
        let (_dir, activities) = activities_over(b"x\n").await;
        assert!(activities.dedup.first_seen("job", "42").await.unwrap());
        activities.finalize_job("job").await.unwrap();
        assert!(activities.dedup.first_seen("job", "42").await.unwrap());
        // Finalizing twice is a no-op.
        activities.finalize_job("job").await.unwrap();
    }
}
