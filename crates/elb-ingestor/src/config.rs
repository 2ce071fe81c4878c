//! Configuration management
//!
//! Everything comes from environment variables, with a `.env` file loaded
//! first when present. [`Config::from_lookup`] takes any key lookup so tests
//! never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};
use crate::pipeline::coordinator::{
    DEFAULT_COMPLETE_ATTEMPTS, DEFAULT_ERROR_BACKOFF_SECS, DEFAULT_FILE_BATCH_SIZE,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_QUEUE_CAPACITY, DEFAULT_UPLOADER_WORKERS,
};
use crate::pipeline::uploader::{
    DEFAULT_INDEX_PATTERN, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_MS,
    DEFAULT_UPLOAD_BATCH_SIZE, DEFAULT_UPLOAD_MAX_WAIT_MS,
};
use crate::pipeline::{LogFormat, PipelineConfig, UploadConfig};
use crate::source::Prefixes;
use crate::storage::config::StorageConfig;
use crate::store::elasticsearch::DEFAULT_REQUEST_TIMEOUT_SECS;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default object-store prefix holding new log files.
pub const DEFAULT_SEARCH_PREFIX: &str = "logs/";

/// Default object-store prefix for claimed files.
pub const DEFAULT_WORKING_PREFIX: &str = "logs-working/";

/// Default object-store prefix for finished files.
pub const DEFAULT_DONE_PREFIX: &str = "logs-done/";

/// Default health endpoint host. `0.0.0.0` listens on all interfaces.
pub const DEFAULT_LISTEN_HOST: &str = "localhost";

/// Default health endpoint port.
pub const DEFAULT_LISTEN_PORT: u16 = 13131;

/// Default log grammar.
pub const DEFAULT_LOG_FORMAT: &str = "classic";

/// Where log files come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    LocalFile {
        input_dir: PathBuf,
        processing_dir: PathBuf,
        processed_dir: PathBuf,
    },
    ObjectStore {
        storage: StorageConfig,
        search_prefix: String,
        working_prefix: String,
        done_prefix: String,
    },
    /// Backfill of the prefixes named in `list_file`; objects stay in place
    /// and progress is tracked by marker files under `work_dir`.
    FixedList {
        storage: StorageConfig,
        list_file: PathBuf,
        work_dir: PathBuf,
    },
}

impl FetchMode {
    pub fn name(&self) -> &'static str {
        match self {
            FetchMode::LocalFile { .. } => "local_file",
            FetchMode::ObjectStore { .. } => "s3",
            FetchMode::FixedList { .. } => "fixed_list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    /// Address to bind. `localhost` is resolved by the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    pub hosts: Vec<String>,
    pub request_timeout: Duration,
}

/// Full ingestor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub fetch: FetchMode,
    pub elasticsearch: ElasticsearchConfig,
    pub log_format: String,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn load() -> IngestResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> IngestResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| IngestError::Config(format!("{} must be set", key)))
        };

        let fetch = match required("ELB_INGESTOR_FETCH_MODE")?.to_ascii_lowercase().as_str() {
            "local_file" | "local" => FetchMode::LocalFile {
                input_dir: required("ELB_INGESTOR_INPUT_DIR")?.into(),
                processing_dir: required("ELB_INGESTOR_PROCESSING_DIR")?.into(),
                processed_dir: required("ELB_INGESTOR_PROCESSED_DIR")?.into(),
            },
            "s3" | "object_store" => FetchMode::ObjectStore {
                storage: StorageConfig::from_lookup(required("ELB_INGESTOR_BUCKET")?, &get),
                search_prefix: get("ELB_INGESTOR_SEARCH_PREFIX")
                    .unwrap_or_else(|| DEFAULT_SEARCH_PREFIX.to_string()),
                working_prefix: get("ELB_INGESTOR_WORKING_PREFIX")
                    .unwrap_or_else(|| DEFAULT_WORKING_PREFIX.to_string()),
                done_prefix: get("ELB_INGESTOR_DONE_PREFIX")
                    .unwrap_or_else(|| DEFAULT_DONE_PREFIX.to_string()),
            },
            "fixed_list" => FetchMode::FixedList {
                storage: StorageConfig::from_lookup(required("ELB_INGESTOR_BUCKET")?, &get),
                list_file: required("ELB_INGESTOR_LIST_FILE")?.into(),
                work_dir: required("ELB_INGESTOR_WORK_DIR")?.into(),
            },
            other => {
                return Err(IngestError::Config(format!(
                    "Unknown fetch mode '{}', expected 'local_file', 's3' or 'fixed_list'",
                    other
                )))
            },
        };

        let hosts = required("ELB_INGESTOR_ELASTICSEARCH_HOSTS")?
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        let config = Config {
            fetch,
            elasticsearch: ElasticsearchConfig {
                hosts,
                request_timeout: Duration::from_secs(parse_or(
                    &get,
                    "ELB_INGESTOR_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                )?),
            },
            log_format: get("ELB_INGESTOR_LOG_FORMAT")
                .unwrap_or_else(|| DEFAULT_LOG_FORMAT.to_string()),
            pipeline: PipelineConfig {
                file_batch_size: parse_or(
                    &get,
                    "ELB_INGESTOR_FILE_BATCH_SIZE",
                    DEFAULT_FILE_BATCH_SIZE,
                )?,
                queue_capacity: parse_or(&get, "ELB_INGESTOR_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
                uploader_workers: parse_or(
                    &get,
                    "ELB_INGESTOR_UPLOADER_WORKERS",
                    DEFAULT_UPLOADER_WORKERS,
                )?,
                poll_interval: Duration::from_secs(parse_or(
                    &get,
                    "ELB_INGESTOR_POLL_INTERVAL_SECS",
                    DEFAULT_POLL_INTERVAL_SECS,
                )?),
                error_backoff: Duration::from_secs(parse_or(
                    &get,
                    "ELB_INGESTOR_ERROR_BACKOFF_SECS",
                    DEFAULT_ERROR_BACKOFF_SECS,
                )?),
                complete_attempts: parse_or(
                    &get,
                    "ELB_INGESTOR_COMPLETE_ATTEMPTS",
                    DEFAULT_COMPLETE_ATTEMPTS,
                )?,
                upload: UploadConfig {
                    batch_size: parse_or(
                        &get,
                        "ELB_INGESTOR_UPLOAD_BATCH_SIZE",
                        DEFAULT_UPLOAD_BATCH_SIZE,
                    )?,
                    max_wait: Duration::from_millis(parse_or(
                        &get,
                        "ELB_INGESTOR_UPLOAD_MAX_WAIT_MS",
                        DEFAULT_UPLOAD_MAX_WAIT_MS,
                    )?),
                    index_pattern: get("ELB_INDEX_PATTERN")
                        .unwrap_or_else(|| DEFAULT_INDEX_PATTERN.to_string()),
                    max_attempts: parse_or(&get, "ELB_INGESTOR_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
                    retry_base: Duration::from_millis(parse_or(
                        &get,
                        "ELB_INGESTOR_RETRY_BASE_MS",
                        DEFAULT_RETRY_BASE_MS,
                    )?),
                    retry_max: Duration::from_millis(parse_or(
                        &get,
                        "ELB_INGESTOR_RETRY_MAX_MS",
                        DEFAULT_RETRY_MAX_MS,
                    )?),
                },
            },
            server: ServerConfig {
                host: get("ELB_INGESTOR_LISTEN_HOST")
                    .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
                port: parse_or(&get, "ELB_INGESTOR_LISTEN_PORT", DEFAULT_LISTEN_PORT)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> IngestResult<()> {
        match &self.fetch {
            FetchMode::LocalFile {
                input_dir,
                processing_dir,
                processed_dir,
            } => {
                if input_dir == processing_dir
                    || input_dir == processed_dir
                    || processing_dir == processed_dir
                {
                    return Err(IngestError::Config(
                        "Input, processing and processed directories must be distinct".to_string(),
                    ));
                }
            },
            FetchMode::ObjectStore {
                storage,
                search_prefix,
                working_prefix,
                done_prefix,
            } => {
                if storage.bucket.is_empty() {
                    return Err(IngestError::Config("Bucket name cannot be empty".to_string()));
                }
                Prefixes::new(search_prefix, working_prefix, done_prefix).validate()?;
            },
            FetchMode::FixedList { storage, .. } => {
                if storage.bucket.is_empty() {
                    return Err(IngestError::Config("Bucket name cannot be empty".to_string()));
                }
            },
        }

        if self.elasticsearch.hosts.is_empty() {
            return Err(IngestError::Config(
                "At least one Elasticsearch host is required".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(IngestError::Config(
                "Listen port must be greater than 0".to_string(),
            ));
        }

        self.log_format()?;
        self.pipeline.validate()
    }

    pub fn log_format(&self) -> IngestResult<LogFormat> {
        LogFormat::from_str(&self.log_format)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> IngestResult<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            IngestError::Config(format!("{} has invalid value '{}'", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> IngestResult<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    const LOCAL: &[(&str, &str)] = &[
        ("ELB_INGESTOR_FETCH_MODE", "local_file"),
        ("ELB_INGESTOR_INPUT_DIR", "/var/elb/in"),
        ("ELB_INGESTOR_PROCESSING_DIR", "/var/elb/processing"),
        ("ELB_INGESTOR_PROCESSED_DIR", "/var/elb/done"),
        ("ELB_INGESTOR_ELASTICSEARCH_HOSTS", "http://es1:9200, http://es2:9200"),
    ];

    #[test]
    fn test_local_defaults() {
        let config = load(LOCAL).unwrap();

        assert_eq!(config.fetch.name(), "local_file");
        assert_eq!(
            config.elasticsearch.hosts,
            vec!["http://es1:9200".to_string(), "http://es2:9200".to_string()]
        );
        assert_eq!(config.pipeline.file_batch_size, DEFAULT_FILE_BATCH_SIZE);
        assert_eq!(config.pipeline.upload.index_pattern, DEFAULT_INDEX_PATTERN);
        assert_eq!(config.server.bind_addr(), "localhost:13131");
        assert_eq!(config.log_format().unwrap().name(), "classic");
    }

    #[test]
    fn test_s3_mode_with_prefixes() {
        let config = load(&[
            ("ELB_INGESTOR_FETCH_MODE", "s3"),
            ("ELB_INGESTOR_BUCKET", "elb-logs"),
            ("ELB_INGESTOR_DONE_PREFIX", "archive/"),
            ("ELB_INGESTOR_ELASTICSEARCH_HOSTS", "http://es:9200"),
            ("S3_REGION", "eu-west-1"),
        ])
        .unwrap();

        match config.fetch {
            FetchMode::ObjectStore {
                storage,
                search_prefix,
                done_prefix,
                ..
            } => {
                assert_eq!(storage.bucket, "elb-logs");
                assert_eq!(storage.region, "eu-west-1");
                assert_eq!(search_prefix, DEFAULT_SEARCH_PREFIX);
                assert_eq!(done_prefix, "archive/");
            },
            other => panic!("unexpected fetch mode {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_values() {
        let err = load(&[("ELB_INGESTOR_FETCH_MODE", "local_file")]).unwrap_err();
        assert!(err.to_string().contains("ELB_INGESTOR_INPUT_DIR"));

        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("ELB_INGESTOR_FETCH_MODE"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut pairs = LOCAL.to_vec();
        pairs.push(("ELB_INGESTOR_QUEUE_CAPACITY", "lots"));
        assert!(matches!(load(&pairs), Err(IngestError::Config(_))));

        let mut pairs = LOCAL.to_vec();
        pairs.push(("ELB_INGESTOR_LOG_FORMAT", "w3c"));
        assert!(load(&pairs).is_err());

        let mut pairs = LOCAL.to_vec();
        pairs.push(("ELB_INGESTOR_FETCH_MODE", "ftp"));
        assert!(load(&pairs).is_err());
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let err = load(&[
            ("ELB_INGESTOR_FETCH_MODE", "s3"),
            ("ELB_INGESTOR_BUCKET", "elb-logs"),
            ("ELB_INGESTOR_SEARCH_PREFIX", "logs"),
            ("ELB_INGESTOR_ELASTICSEARCH_HOSTS", "http://es:9200"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_fixed_list_mode() {
        let config = load(&[
            ("ELB_INGESTOR_FETCH_MODE", "fixed_list"),
            ("ELB_INGESTOR_BUCKET", "elb-logs"),
            ("ELB_INGESTOR_LIST_FILE", "/etc/elb/backfill.txt"),
            ("ELB_INGESTOR_WORK_DIR", "/var/elb/work"),
            ("ELB_INGESTOR_COMPLETE_ATTEMPTS", "3"),
            ("ELB_INGESTOR_ELASTICSEARCH_HOSTS", "http://es:9200"),
        ])
        .unwrap();

        assert_eq!(config.fetch.name(), "fixed_list");
        assert_eq!(config.pipeline.complete_attempts, 3);
        match config.fetch {
            FetchMode::FixedList {
                storage,
                list_file,
                work_dir,
            } => {
                assert_eq!(storage.bucket, "elb-logs");
                assert_eq!(list_file, PathBuf::from("/etc/elb/backfill.txt"));
                assert_eq!(work_dir, PathBuf::from("/var/elb/work"));
            },
            other => panic!("unexpected fetch mode {:?}", other),
        }
    }

    #[test]
    fn test_fixed_list_requires_work_dir() {
        let err = load(&[
            ("ELB_INGESTOR_FETCH_MODE", "fixed_list"),
            ("ELB_INGESTOR_BUCKET", "elb-logs"),
            ("ELB_INGESTOR_LIST_FILE", "/etc/elb/backfill.txt"),
            ("ELB_INGESTOR_ELASTICSEARCH_HOSTS", "http://es:9200"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ELB_INGESTOR_WORK_DIR"));
    }

    #[test]
    fn test_directories_must_differ() {
        let mut pairs = LOCAL.to_vec();
        pairs.push(("ELB_INGESTOR_PROCESSED_DIR", "/var/elb/in"));
        assert!(load(&pairs).is_err());
    }
}
