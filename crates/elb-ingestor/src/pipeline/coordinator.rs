//! Pipeline coordinator
//!
//! Owns the discovery loop and the uploader workers:
//!
//! ```text
//! recover ─▶ discover ─▶ claim batch ─▶ one task per file ─▶ wait ─▶ discover ...
//!                                          │ parse + enqueue
//!                                          ▼
//!                                      WorkQueue ─▶ uploader workers ─▶ store
//! ```
//!
//! A new batch is claimed only after every task of the previous batch has
//! finished enqueueing, so a full queue throttles claiming. On shutdown the
//! loop stops claiming, in-flight files finish, the queue is closed and the
//! uploaders drain it before [`Coordinator::run`] returns.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::parser::{LineParser, RecordStream};
use super::queue::WorkQueue;
use super::uploader::{backoff_delay, UploadConfig, Uploader};
use crate::error::{IngestError, IngestResult};
use crate::source::{LogFile, LogStream, SourceAdapter};
use crate::stats::Stats;
use crate::store::DocumentStore;

// ============================================================================
// Coordinator Constants
// ============================================================================

/// Default number of files claimed per discovery cycle.
pub const DEFAULT_FILE_BATCH_SIZE: usize = 5;

/// Default work queue capacity in records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default number of uploader workers.
pub const DEFAULT_UPLOADER_WORKERS: usize = 2;

/// Default sleep when discovery finds nothing, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default sleep after a source failure, in seconds.
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 30;

/// Default attempts at moving a fully read file to the done area.
pub const DEFAULT_COMPLETE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub file_batch_size: usize,
    pub queue_capacity: usize,
    pub uploader_workers: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub complete_attempts: u32,
    pub upload: UploadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            file_batch_size: DEFAULT_FILE_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            uploader_workers: DEFAULT_UPLOADER_WORKERS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
            complete_attempts: DEFAULT_COMPLETE_ATTEMPTS,
            upload: UploadConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> IngestResult<()> {
        if self.file_batch_size == 0 {
            return Err(IngestError::Config(
                "File batch size must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(IngestError::Config(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.uploader_workers == 0 {
            return Err(IngestError::Config(
                "At least one uploader worker is required".to_string(),
            ));
        }
        if self.complete_attempts == 0 {
            return Err(IngestError::Config(
                "Complete attempts must be greater than 0".to_string(),
            ));
        }
        self.upload.validate()
    }
}

pub struct Coordinator {
    source: Arc<dyn SourceAdapter>,
    parser: LineParser,
    queue: WorkQueue,
    uploader: Arc<Uploader>,
    stats: Arc<Stats>,
    config: PipelineConfig,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        store: Arc<dyn DocumentStore>,
        parser: LineParser,
        config: PipelineConfig,
        stats: Arc<Stats>,
    ) -> Self {
        let queue = WorkQueue::new(config.queue_capacity);
        let uploader = Arc::new(Uploader::new(
            store,
            queue.clone(),
            config.upload.clone(),
            Arc::clone(&stats),
        ));

        Self {
            source,
            parser,
            queue,
            uploader,
            stats,
            config,
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` is cancelled, then drain and return.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> IngestResult<()> {
        info!(
            source = self.source.kind(),
            format = self.parser.format().name(),
            file_batch_size = self.config.file_batch_size,
            uploader_workers = self.config.uploader_workers,
            "Starting ingest pipeline"
        );

        self.recover().await;

        let mut uploaders = self.uploader.spawn_workers(self.config.uploader_workers);

        self.discovery_loop(&shutdown).await;

        info!("Discovery stopped, draining work queue");
        self.queue.close();
        while let Some(joined) = uploaders.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Uploader worker panicked");
            }
        }
        self.stats.set_queue_depth(self.queue.len());

        info!("Ingest pipeline stopped");
        Ok(())
    }

    async fn recover(&self) {
        match self.source.recover().await {
            Ok(recovered) => Stats::add(&self.stats.files_recovered, recovered as u64),
            Err(e) => {
                Stats::incr(&self.stats.adapter_errors);
                self.stats.set_source_healthy(false);
                error!(error = %e, "Startup recovery failed");
            },
        }
    }

    async fn discovery_loop(self: &Arc<Self>, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            let files = match self.source.discover(self.config.file_batch_size).await {
                Ok(files) => {
                    self.stats.set_source_healthy(true);
                    files
                },
                Err(e) => {
                    Stats::incr(&self.stats.adapter_errors);
                    error!(error = %e, backoff_secs = self.config.error_backoff.as_secs(), "Discovery failed");
                    if self.source_failed(shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            if files.is_empty() {
                debug!("No files to process");
                if sleep_or_cancel(self.config.poll_interval, shutdown).await {
                    break;
                }
                continue;
            }

            Stats::add(&self.stats.files_discovered, files.len() as u64);
            let failures = self.process_batch(files, shutdown).await;
            if failures > 0 {
                warn!(
                    failures,
                    backoff_secs = self.config.error_backoff.as_secs(),
                    "Source errors during batch, backing off"
                );
                if self.source_failed(shutdown).await {
                    break;
                }
            }
        }
    }

    /// Mark the source unhealthy and wait out the error backoff.
    /// Returns true when cancelled during the wait.
    async fn source_failed(&self, shutdown: &CancellationToken) -> bool {
        self.stats.set_source_healthy(false);
        sleep_or_cancel(self.config.error_backoff, shutdown).await
    }

    /// Claim each file and stream them concurrently; returns when all are done.
    ///
    /// The result is the number of files that hit a source error (claim,
    /// read or completion). Claim conflicts are not errors.
    async fn process_batch(self: &Arc<Self>, files: Vec<LogFile>, shutdown: &CancellationToken) -> usize {
        let mut tasks = JoinSet::new();
        let mut failures = 0;

        for mut file in files {
            if shutdown.is_cancelled() {
                break;
            }

            let stream = match self.source.claim(&mut file).await {
                Ok(stream) => stream,
                Err(e) if e.is_claim_conflict() => {
                    Stats::incr(&self.stats.claim_conflicts);
                    debug!(file = %file.location, "Claimed by another worker, skipping");
                    continue;
                },
                Err(e) => {
                    Stats::incr(&self.stats.adapter_errors);
                    error!(file = %file.location, error = %e, "Claim failed");
                    failures += 1;
                    continue;
                },
            };

            Stats::incr(&self.stats.files_claimed);
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { this.process_file(file, stream, &shutdown).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => {},
                Ok(false) => failures += 1,
                Err(e) => {
                    failures += 1;
                    error!(error = %e, "File task panicked");
                },
            }
        }

        failures
    }

    /// Returns false when the file was left in the processing area.
    #[instrument(skip(self, file, stream, shutdown), fields(file = %file.location))]
    async fn process_file(&self, mut file: LogFile, stream: LogStream, shutdown: &CancellationToken) -> bool {
        self.stats.file_started();

        let finished = match self.stream_file(stream).await {
            Ok(records) => match self.complete_with_retry(&mut file, shutdown).await {
                Ok(()) => {
                    Stats::incr(&self.stats.files_completed);
                    info!(records, "File processed");
                    true
                },
                Err(e) => {
                    error!(error = %e, "Failed to mark file done, left for recovery");
                    false
                },
            },
            Err(e) => {
                Stats::incr(&self.stats.adapter_errors);
                error!(error = %e, "File processing interrupted, left for recovery");
                false
            },
        };

        if !finished {
            Stats::incr(&self.stats.files_stranded);
        }
        self.stats.file_finished();
        finished
    }

    /// `complete` is idempotent, so a failed attempt is simply repeated with
    /// backoff until it succeeds, attempts run out or shutdown begins.
    async fn complete_with_retry(&self, file: &mut LogFile, shutdown: &CancellationToken) -> IngestResult<()> {
        let mut attempt = 1;
        loop {
            let err = match self.source.complete(file).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            Stats::incr(&self.stats.adapter_errors);
            self.stats.set_source_healthy(false);
            if attempt >= self.config.complete_attempts {
                return Err(err);
            }

            let delay = backoff_delay(self.config.upload.retry_base, self.config.error_backoff, attempt);
            warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "Completion failed, retrying");
            if sleep_or_cancel(delay, shutdown).await {
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// Parse every line and enqueue the records; returns the number enqueued.
    async fn stream_file(&self, stream: LogStream) -> IngestResult<u64> {
        let mut lines = RecordStream::new(stream);
        let mut enqueued = 0;

        while let Some(line) = lines.next_line().await? {
            Stats::incr(&self.stats.lines_read);

            match line.and_then(|line| self.parser.parse_line(&line)) {
                Ok(record) => {
                    if record.is_partial() {
                        Stats::incr(&self.stats.partial_records);
                    }
                    self.queue.enqueue(record).await?;
                    Stats::incr(&self.stats.records_enqueued);
                    enqueued += 1;
                },
                Err(e) => {
                    Stats::incr(&self.stats.parse_errors);
                    warn!(line = lines.line_number(), reason = %e.reason, "Skipping malformed line");
                },
            }
        }

        Ok(enqueued)
    }
}

/// Sleep for `duration`; true when woken by cancellation instead.
async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
