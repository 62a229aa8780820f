//! Pluggable row-level processing.
//!
//! The orchestration engine only sees counters coming back from a
//! [`RowProcessor`]; the row schema, validation rules, and downstream
//! persistence live behind this seam. [`UserRowProcessor`] is the stock
//! implementation for the `id,name,email,company_name,address` layout.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{BatchProcessingResult, FailedRecord, FailureType, RawRow};
use crate::repository::FailedRecordRepository;

/// Row-level parse/validate/persist, returning only counters.
///
/// Contract: `processed_count = valid_count + invalid_count +
/// duplicate_count`, and an individual bad row never raises — it is folded
/// into the invalid count and recorded as a [`FailedRecord`].
#[async_trait]
pub trait RowProcessor: Send + Sync {
    /// Process one batch of rows from a chunk.
    async fn process_batch(
        &self,
        job_id: &str,
        chunk_index: u32,
        rows: &[RawRow],
        enable_deduplication: bool,
    ) -> Result<BatchProcessingResult>;

    /// Retry a previously failed row. `Ok(true)` means the row was applied
    /// this time; `Ok(false)` means it is still failed.
    async fn reprocess(&self, record: &FailedRecord) -> Result<bool>;
}

/// Per-job row-identity index used for duplicate detection.
///
/// Uniqueness scope is the job: the first occurrence of a key wins, every
/// later occurrence in the same job is a duplicate.
#[async_trait]
pub trait DedupIndex: Send + Sync {
    /// Record the key and report whether this was its first occurrence.
    async fn first_seen(&self, job_id: &str, key: &str) -> Result<bool>;

    /// Drop all keys recorded for a job.
    async fn clear_job(&self, job_id: &str) -> Result<()>;
}

/// In-memory [`DedupIndex`].
#[derive(Clone, Default)]
pub struct InMemoryDedupIndex {
    seen: Arc<RwLock<HashSet<(String, String)>>>,
}

impl InMemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupIndex for InMemoryDedupIndex {
    async fn first_seen(&self, job_id: &str, key: &str) -> Result<bool> {
        Ok(self
            .seen
            .write()
            .await
            .insert((job_id.to_string(), key.to_string())))
    }

    async fn clear_job(&self, job_id: &str) -> Result<()> {
        self.seen.write().await.retain(|(job, _)| job != job_id);
        Ok(())
    }
}

/// One parsed user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub company_name: String,
    pub address: String,
}

impl UserRecord {
    /// Parse a raw delimited row. Returns a message when the row does not
    /// have the expected shape.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(raw.as_bytes());
        let record = match reader.records().next() {
            Some(Ok(record)) => record,
            Some(Err(e)) => return Err(format!("malformed row: {e}")),
            None => return Err("empty row".to_string()),
        };
        if record.len() < 5 {
            return Err(format!("expected 5 fields, found {}", record.len()));
        }
        let field = |i: usize| record.get(i).unwrap_or_default().trim().to_string();
        Ok(Self {
            id: field(0),
            name: field(1),
            email: field(2),
            company_name: field(3),
            address: field(4),
        })
    }

    /// Field-level validation errors; empty when the record is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("id is required".to_string());
        }
        if self.name.is_empty() {
            errors.push("name is required".to_string());
        }
        if self.email.is_empty() {
            errors.push("email is required".to_string());
        } else if !plausible_email(&self.email) {
            errors.push(format!("email is not valid: {}", self.email));
        }
        if self.company_name.is_empty() {
            errors.push("company_name is required".to_string());
        }
        if self.address.is_empty() {
            errors.push("address is required".to_string());
        }
        errors
    }
}

fn plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
        None => false,
    }
}

/// Stock [`RowProcessor`] for user rows.
///
/// Validation failures and unparseable rows become [`FailedRecord`]s;
/// duplicates (by row id, per job) are detected through the [`DedupIndex`]
/// when deduplication is enabled and are not re-applied downstream.
pub struct UserRowProcessor {
    failed: Arc<dyn FailedRecordRepository>,
    dedup: Arc<dyn DedupIndex>,
}

impl UserRowProcessor {
    pub fn new(failed: Arc<dyn FailedRecordRepository>, dedup: Arc<dyn DedupIndex>) -> Self {
        Self { failed, dedup }
    }

    async fn record_failure(
        &self,
        job_id: &str,
        chunk_index: u32,
        row: &RawRow,
        failure_type: FailureType,
        validation_errors: Vec<String>,
        error_message: String,
        row_id: Option<String>,
    ) -> Result<()> {
        self.failed
            .append(FailedRecord {
                job_id: job_id.to_string(),
                chunk_index,
                line_number: row.line_number,
                raw_row: row.text.clone(),
                failure_type,
                validation_errors,
                error_message,
                failure_time: Utc::now(),
                reprocessed: false,
                row_id,
            })
            .await
    }
}

#[async_trait]
impl RowProcessor for UserRowProcessor {
    async fn process_batch(
        &self,
        job_id: &str,
        chunk_index: u32,
        rows: &[RawRow],
        enable_deduplication: bool,
    ) -> Result<BatchProcessingResult> {
        let mut result = BatchProcessingResult::default();

        for row in rows {
            result.processed_count += 1;

            let record = match UserRecord::parse(&row.text) {
                Ok(record) => record,
                Err(message) => {
                    result.invalid_count += 1;
                    self.record_failure(
                        job_id,
                        chunk_index,
                        row,
                        FailureType::ParseError,
                        Vec::new(),
                        message,
                        None,
                    )
                    .await?;
                    continue;
                }
            };

            let errors = record.validate();
            if !errors.is_empty() {
                result.invalid_count += 1;
                let row_id = (!record.id.is_empty()).then(|| record.id.clone());
                self.record_failure(
                    job_id,
                    chunk_index,
                    row,
                    FailureType::ValidationError,
                    errors,
                    "row failed validation".to_string(),
                    row_id,
                )
                .await?;
                continue;
            }

            if enable_deduplication && !self.dedup.first_seen(job_id, &record.id).await? {
                result.duplicate_count += 1;
                self.record_failure(
                    job_id,
                    chunk_index,
                    row,
                    FailureType::DuplicateRow,
                    Vec::new(),
                    format!("row id {} already accepted in this job", record.id),
                    Some(record.id.clone()),
                )
                .await?;
                continue;
            }

            result.valid_count += 1;
        }

        tracing::debug!(
            job_id,
            chunk_index,
            processed = result.processed_count,
            valid = result.valid_count,
            invalid = result.invalid_count,
            duplicates = result.duplicate_count,
            "processed row batch"
        );
        Ok(result)
    }

    async fn reprocess(&self, record: &FailedRecord) -> Result<bool> {
        // A duplicate is still a duplicate; reprocessing cannot un-dedup it.
        if record.failure_type == FailureType::DuplicateRow {
            return Ok(false);
        }
        let parsed = match UserRecord::parse(&record.raw_row) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(false),
        };
        Ok(parsed.validate().is_empty())
    }
}
