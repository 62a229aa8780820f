//! Row-range activities: boundary calculation, chunk reads, batch
//! processing, and chunk-side bookkeeping.

use std::sync::Arc;

use crate::error::{ProcessingError, Result};
use crate::model::{BatchProcessingResult, ChunkBoundaries, ChunkData, ChunkProgress, RawRow};
use crate::processor::RowProcessor;
use crate::repository::ChunkProgressRepository;
use crate::retry::{Heartbeat, HeartbeatObserver};
use crate::store::{find_next_newline, FileStore};

/// Activities owned by chunk workflows.
pub struct ChunkActivities {
    store: Arc<dyn FileStore>,
    processor: Arc<dyn RowProcessor>,
    progress: Arc<dyn ChunkProgressRepository>,
    heartbeat: Heartbeat,
    heartbeat_observer: HeartbeatObserver,
}

impl ChunkActivities {
    pub fn new(
        store: Arc<dyn FileStore>,
        processor: Arc<dyn RowProcessor>,
        progress: Arc<dyn ChunkProgressRepository>,
    ) -> Self {
        let (heartbeat, heartbeat_observer) = Heartbeat::new();
        Self {
            store,
            processor,
            progress,
            heartbeat,
            heartbeat_observer,
        }
    }

    /// Liveness of the batch-processing activities.
    pub fn heartbeat(&self) -> HeartbeatObserver {
        self.heartbeat_observer.clone()
    }

    /// Compute the row-aligned byte range owned by `chunk_index`.
    ///
    /// The raw range is `[chunk_index * chunk_size, +chunk_size)` clamped at
    /// the file size. Both edges that fall inside the file are moved forward
    /// to the position just past the next line terminator, so every row is
    /// owned by exactly one chunk: the one whose range contains the row's
    /// opening byte. No terminator within `scan_window` bytes is a hard
    /// error, not a silent truncation.
    pub async fn calculate_chunk_boundaries(
        &self,
        directory: &str,
        filename: &str,
        chunk_index: u32,
        chunk_size_bytes: u64,
        scan_window: u64,
    ) -> Result<ChunkBoundaries> {
        let file_size = self.store.file_size(directory, filename).await?;

        let raw_start = chunk_index as u64 * chunk_size_bytes;
        let raw_end = (raw_start + chunk_size_bytes).min(file_size);

        let start_offset = if raw_start == 0 {
            0
        } else {
            align_forward(&*self.store, directory, filename, raw_start, scan_window).await?
        };

        let end_offset = if raw_end >= file_size {
            file_size
        } else {
            align_forward(&*self.store, directory, filename, raw_end, scan_window).await?
        };

        // A row wider than the raw chunk can swallow the whole range.
        let start_offset = start_offset.min(end_offset);

        let boundaries = ChunkBoundaries {
            start_offset,
            end_offset,
            actual_chunk_size: end_offset - start_offset,
        };
        tracing::debug!(
            chunk_index,
            start = boundaries.start_offset,
            end = boundaries.end_offset,
            size = boundaries.actual_chunk_size,
            "calculated chunk boundaries"
        );
        Ok(boundaries)
    }

    /// Read the bytes of `[start, end)` and count the rows strictly inside.
    /// On the chunk starting at offset 0 the header line is detected and
    /// excluded from the count.
    pub async fn read_chunk(
        &self,
        directory: &str,
        filename: &str,
        start: u64,
        end: u64,
    ) -> Result<ChunkData> {
        let data = self.store.read_range(directory, filename, start, end).await?;
        let includes_header = start == 0 && !data.is_empty();
        let chunk = ChunkData::new(data, includes_header);
        tracing::debug!(
            directory,
            filename,
            start,
            end,
            bytes = chunk.len(),
            rows = chunk.row_count(),
            "read chunk"
        );
        Ok(chunk)
    }

    /// Process one batch of rows through the pluggable row processor.
    /// Emits a liveness heartbeat per invocation.
    pub async fn process_row_batch(
        &self,
        job_id: &str,
        chunk_index: u32,
        rows: &[RawRow],
        enable_deduplication: bool,
    ) -> Result<BatchProcessingResult> {
        self.heartbeat.beat();
        let result = self
            .processor
            .process_batch(job_id, chunk_index, rows, enable_deduplication)
            .await?;
        self.heartbeat.beat();

        debug_assert_eq!(
            result.processed_count,
            result.valid_count + result.invalid_count + result.duplicate_count,
            "row processor broke the counter identity"
        );
        Ok(result)
    }

    /// Idempotent progress upsert; a later snapshot with equal or greater
    /// `processed_rows` supersedes the stored one.
    pub async fn update_chunk_progress(&self, progress: &ChunkProgress) -> Result<()> {
        self.heartbeat.beat();
        self.progress.upsert(progress).await
    }

    /// Persist a chunk-terminal failure for operator inspection. Never fatal
    /// to the caller.
    pub async fn record_chunk_failure(&self, progress: &ChunkProgress) {
        tracing::warn!(
            job_id = %progress.job_id,
            chunk_index = progress.chunk_index,
            error = progress.error_message.as_deref().unwrap_or("unknown"),
            "recording chunk failure"
        );
        if let Err(e) = self.progress.upsert(progress).await {
            tracing::error!(
                job_id = %progress.job_id,
                chunk_index = progress.chunk_index,
                error = %e,
                "failed to persist chunk failure record"
            );
        }
    }

    /// Idempotent chunk finalization.
    pub async fn finalize_chunk(&self, job_id: &str, chunk_index: u32) -> Result<()> {
        tracing::debug!(job_id, chunk_index, "finalized chunk");
        Ok(())
    }
}

async fn align_forward(
    store: &dyn FileStore,
    directory: &str,
    filename: &str,
    offset: u64,
    scan_window: u64,
) -> Result<u64> {
    match find_next_newline(store, directory, filename, offset, scan_window).await? {
        Some(aligned) => Ok(aligned),
        None => Err(ProcessingError::BoundaryAlignment {
            offset,
            window: scan_window,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{InMemoryDedupIndex, UserRowProcessor};
    use crate::repository::{InMemoryChunkProgressRepository, InMemoryFailedRecordRepository};
    use crate::store::LocalFileStore;

    async fn activities_over(content: &[u8]) -> (tempfile::TempDir, ChunkActivities) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::write(dir.path().join("in/data.csv"), content)
            .await
            .unwrap();

        let store = Arc::new(LocalFileStore::new(dir.path()));
        let failed = Arc::new(InMemoryFailedRecordRepository::new());
        let processor = Arc::new(UserRowProcessor::new(
            failed,
            Arc::new(InMemoryDedupIndex::new()),
        ));
        let progress = Arc::new(InMemoryChunkProgressRepository::new());
        (dir, ChunkActivities::new(store, processor, progress))
    }

    /// 1024-byte file with terminators at offsets 100, 250, 600, 1023.
    fn aligned_fixture() -> Vec<u8> {
        let mut data = vec![b'x'; 1024];
        for offset in [100usize, 250, 600, 1023] {
            data[offset] = b'\n';
        }
        data
    }

    #[tokio::test]
    async fn first_chunk_starts_at_zero() {
        let (_dir, activities) = activities_over(&aligned_fixture()).await;
        let b = activities
            .calculate_chunk_boundaries("in", "data.csv", 0, 300, 1024)
            .await
            .unwrap();
        assert_eq!(b.start_offset, 0);
        // End extends forward to the terminator at 600.
        assert_eq!(b.end_offset, 601);
        assert_eq!(b.actual_chunk_size, 601);
    }

    #[tokio::test]
    async fn boundaries_chain_and_cover_the_file() {
        let (_dir, activities) = activities_over(&aligned_fixture()).await;
        let file_size = 1024u64;
        let chunk_size = 300u64;
        let total_chunks = file_size.div_ceil(chunk_size) as u32;

        let mut boundaries = Vec::new();
        for index in 0..total_chunks {
            boundaries.push(
                activities
                    .calculate_chunk_boundaries("in", "data.csv", index, chunk_size, 1024)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(boundaries.first().unwrap().start_offset, 0);
        assert_eq!(boundaries.last().unwrap().end_offset, file_size);
        for pair in boundaries.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
        // Every edge is 0, EOF, or just past a terminator.
        for b in &boundaries {
            for edge in [b.start_offset, b.end_offset] {
                assert!(
                    edge == 0
                        || edge == file_size
                        || [101, 251, 601].contains(&edge),
                    "edge {edge} is not row-aligned"
                );
            }
        }
    }

    #[tokio::test]
    async fn a_row_wider_than_the_raw_chunk_yields_a_degenerate_chunk() {
        // Terminators at 600 and 1023 only: the row covering [0, 600] spans
        // two raw 300-byte chunks.
        let mut data = vec![b'x'; 1024];
        data[600] = b'\n';
        data[1023] = b'\n';
        let (_dir, activities) = activities_over(&data).await;

        let b1 = activities
            .calculate_chunk_boundaries("in", "data.csv", 1, 300, 1024)
            .await
            .unwrap();
        assert_eq!(b1.start_offset, 601);
        assert_eq!(b1.end_offset, 601);
        assert_eq!(b1.actual_chunk_size, 0);
    }

    #[tokio::test]
    async fn missing_terminator_in_window_is_a_hard_error() {
        // No newline anywhere near the start boundary of chunk 1.
        let data = vec![b'x'; 4096];
        let (_dir, activities) = activities_over(&data).await;
        let err = activities
            .calculate_chunk_boundaries("in", "data.csv", 1, 1024, 64)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::BoundaryAlignment { .. }));
    }

    #[tokio::test]
    async fn read_chunk_excludes_header_on_first_chunk_only() {
        let content = b"id,name,email,company_name,address\n1,a,a@x.com,c,d\n2,b,b@x.com,c,d\n";
        let (_dir, activities) = activities_over(content).await;

        let first = activities
            .read_chunk("in", "data.csv", 0, content.len() as u64)
            .await
            .unwrap();
        assert_eq!(first.row_count(), 2);

        // A later chunk over the same bytes counts every row.
        let later = activities
            .read_chunk("in", "data.csv", 36, content.len() as u64)
            .await
            .unwrap();
        assert_eq!(later.row_count(), 2);
    }

    #[tokio::test]
    async fn read_chunk_of_degenerate_range_is_empty() {
        let (_dir, activities) = activities_over(b"a,b,c,d,e\n").await;
        let chunk = activities.read_chunk("in", "data.csv", 10, 10).await.unwrap();
        assert!(chunk.is_empty());
        assert_eq!(chunk.row_count(), 0);
    }

    #[tokio::test]
    async fn process_row_batch_beats_the_heartbeat() {
        let (_dir, activities) = activities_over(b"irrelevant\n").await;
        let observer = activities.heartbeat();
        let rows = vec![RawRow {
            line_number: 1,
            text: "1,A,a@x.com,C,Addr".into(),
        }];
        let result = activities
            .process_row_batch("job", 0, &rows, true)
            .await
            .unwrap();
        assert_eq!(result.processed_count, 1);
        assert!(observer.count() >= 1);
    }
}
