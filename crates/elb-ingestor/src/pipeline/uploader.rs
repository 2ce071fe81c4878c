//! Uploader workers
//!
//! Workers drain the work queue in batches, turn each record into a
//! document keyed by its deterministic id and hand the batch to the
//! [`DocumentStore`]. Transient failures are retried with capped exponential
//! backoff; a batch that still fails is counted and dropped.

use chrono::{format::Item, format::StrftimeItems, DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use super::record::LogRecord;
use crate::error::{IngestError, IngestResult};
use crate::stats::Stats;
use crate::store::{BulkOutcome, DocumentStore, IndexedDocument, StoreError};

// ============================================================================
// Upload Constants
// ============================================================================

/// Default index name template (chrono strftime).
pub const DEFAULT_INDEX_PATTERN: &str = "logs-platform-%Y.%m.%d";

/// Default maximum documents per bulk request.
pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 500;

/// Default time to keep filling a batch after its first record.
pub const DEFAULT_UPLOAD_MAX_WAIT_MS: u64 = 1000;

/// Default store attempts per batch, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first retry delay.
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default retry delay cap.
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub batch_size: usize,
    pub max_wait: Duration,
    pub index_pattern: String,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            max_wait: Duration::from_millis(DEFAULT_UPLOAD_MAX_WAIT_MS),
            index_pattern: DEFAULT_INDEX_PATTERN.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> IngestResult<()> {
        if self.batch_size == 0 {
            return Err(IngestError::Config(
                "Upload batch size must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::Config(
                "Max attempts must be greater than 0".to_string(),
            ));
        }
        validate_index_pattern(&self.index_pattern)
    }
}

/// Reject empty patterns and strftime specifiers chrono cannot render.
pub fn validate_index_pattern(pattern: &str) -> IngestResult<()> {
    if pattern.trim().is_empty() {
        return Err(IngestError::Config("Index pattern must not be empty".to_string()));
    }
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(IngestError::Config(format!(
            "Invalid index pattern '{}'",
            pattern
        )));
    }
    Ok(())
}

/// Index name for a record timestamp. Patterns are validated at startup.
pub fn index_name(pattern: &str, timestamp: &DateTime<Utc>) -> String {
    let mut name = String::with_capacity(pattern.len() + 8);
    if write!(name, "{}", timestamp.format(pattern)).is_err() {
        return pattern.to_string();
    }
    name
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

pub struct Uploader {
    store: Arc<dyn DocumentStore>,
    queue: WorkQueue,
    config: UploadConfig,
    stats: Arc<Stats>,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queue: WorkQueue,
        config: UploadConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            stats,
        }
    }

    /// Start `n` workers. Each one exits after the queue is closed and drained.
    pub fn spawn_workers(self: &Arc<Self>, n: usize) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for worker_id in 0..n.max(1) {
            let uploader = Arc::clone(self);
            workers.spawn(async move { uploader.run_worker(worker_id).await });
        }
        workers
    }

    async fn run_worker(&self, worker_id: usize) {
        debug!(worker_id, "Uploader worker started");

        while let Some(batch) = self
            .queue
            .dequeue_batch(self.config.batch_size, self.config.max_wait)
            .await
        {
            self.stats.set_queue_depth(self.queue.len());
            self.ship(batch).await;
        }

        self.stats.set_queue_depth(self.queue.len());
        info!(worker_id, "Uploader worker drained");
    }

    pub fn to_documents(&self, batch: &[LogRecord]) -> Vec<IndexedDocument> {
        batch
            .iter()
            .map(|record| IndexedDocument {
                index: index_name(&self.config.index_pattern, &record.timestamp),
                id: record.id(),
                source: record.to_document(),
            })
            .collect()
    }

    /// Deliver one batch and account for the result.
    pub async fn ship(&self, batch: Vec<LogRecord>) {
        let docs = self.to_documents(&batch);
        let count = docs.len() as u64;

        match self.upsert_with_retry(&docs).await {
            Ok(outcome) => {
                Stats::incr(&self.stats.batches_written);
                Stats::add(&self.stats.documents_written, outcome.written as u64);
                Stats::add(&self.stats.documents_failed, outcome.failed as u64);
                if outcome.failed > 0 {
                    warn!(
                        written = outcome.written,
                        failed = outcome.failed,
                        "Store rejected part of a batch"
                    );
                } else {
                    debug!(documents = outcome.written, "Batch written");
                }
            },
            Err(e) => {
                Stats::incr(&self.stats.batch_failures);
                Stats::add(&self.stats.documents_failed, count);
                error!(documents = count, error = %e, "Dropping batch after delivery failure");
            },
        }
    }

    async fn upsert_with_retry(&self, docs: &[IndexedDocument]) -> Result<BulkOutcome, StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.bulk_upsert(docs).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = backoff_delay(self.config.retry_base, self.config.retry_max, attempt);
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch upload failed, retrying"
                    );
                    Stats::incr(&self.stats.store_retries);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
