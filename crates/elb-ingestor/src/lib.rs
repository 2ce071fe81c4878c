//! ELB access-log ingestor
//!
//! Moves load-balancer access logs from a source (a local directory or an S3
//! bucket) into Elasticsearch:
//!
//! - [`source`]: file discovery and the Discovered → Claimed → Done lifecycle
//! - [`pipeline`]: line parsing, the bounded work queue, uploader workers and
//!   the coordinator that runs them
//! - [`store`]: idempotent bulk writes keyed by deterministic record ids
//! - [`health`]: liveness and counters over HTTP
//!
//! Files are only marked done after all of their records were queued, and
//! every record is written under an id derived from its content, so
//! reprocessing a file after a crash never duplicates documents.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod source;
pub mod stats;
pub mod storage;
pub mod store;

pub use config::{Config, FetchMode};
pub use error::{IngestError, IngestResult};
pub use pipeline::{Coordinator, LineParser, LogFormat, LogRecord, PipelineConfig, WorkQueue};
pub use source::{FileState, LogFile, SourceAdapter, SourceBackend};
pub use stats::{Stats, StatsSnapshot};
pub use store::{DocumentStore, ElasticsearchStore, IndexedDocument};
