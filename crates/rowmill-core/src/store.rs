//! File-bytes provider.
//!
//! The engine never touches the filesystem directly; it goes through the
//! [`FileStore`] trait so the same workflows run against local disk or an
//! object store.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{ProcessingError, Result};

/// Random-access range reader over the input files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Size of the file in bytes.
    async fn file_size(&self, directory: &str, filename: &str) -> Result<u64>;

    /// Bytes of the half-open range `[start, end)`, clamped at end of file.
    /// `start == end` yields an empty buffer; `start > end` is an error.
    async fn read_range(
        &self,
        directory: &str,
        filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>>;

    async fn exists(&self, directory: &str, filename: &str) -> Result<bool>;

    async fn last_modified(&self, directory: &str, filename: &str) -> Result<DateTime<Utc>>;
}

/// Offset just past the first `\n` at or after `offset`, scanning at most
/// `max_scan` bytes. `None` when no terminator lies within the window.
pub async fn find_next_newline(
    store: &dyn FileStore,
    directory: &str,
    filename: &str,
    offset: u64,
    max_scan: u64,
) -> Result<Option<u64>> {
    let window = store
        .read_range(directory, filename, offset, offset + max_scan)
        .await?;
    Ok(window
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| offset + i as u64 + 1))
}

/// [`FileStore`] over a local directory tree, rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    base_dir: PathBuf,
}

impl LocalFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, directory: &str, filename: &str) -> PathBuf {
        self.base_dir.join(directory).join(filename)
    }

    async fn open(&self, directory: &str, filename: &str) -> Result<tokio::fs::File> {
        let path = self.file_path(directory, filename);
        tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessingError::FileNotFound {
                    directory: directory.to_string(),
                    filename: filename.to_string(),
                }
            } else {
                ProcessingError::Io(e)
            }
        })
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn file_size(&self, directory: &str, filename: &str) -> Result<u64> {
        let file = self.open(directory, filename).await?;
        let meta = file.metadata().await?;
        Ok(meta.len())
    }

    async fn read_range(
        &self,
        directory: &str,
        filename: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        if start > end {
            return Err(ProcessingError::InvalidRange { start, end });
        }
        if start == end {
            return Ok(Vec::new());
        }

        let mut file = self.open(directory, filename).await?;
        let size = file.metadata().await?.len();
        if start >= size {
            return Ok(Vec::new());
        }
        let end = end.min(size);

        file.seek(SeekFrom::Start(start)).await?;
        let mut buffer = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buffer).await?;
        tracing::trace!(
            directory,
            filename,
            start,
            end,
            bytes = buffer.len(),
            "read range"
        );
        Ok(buffer)
    }

    async fn exists(&self, directory: &str, filename: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.file_path(directory, filename)).await?)
    }

    async fn last_modified(&self, directory: &str, filename: &str) -> Result<DateTime<Utc>> {
        let meta = tokio::fs::metadata(self.file_path(directory, filename)).await?;
        let modified = meta.modified()?;
        Ok(modified.into())
    }
}
