//! Object storage access
//!
//! [`ObjectStore`] is the narrow set of bucket operations the object-store
//! source needs. [`Storage`] implements it on top of the AWS S3 SDK; tests
//! substitute an in-memory bucket.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::source::LogStream;

pub mod config;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("S3 {operation} failed for {key}: {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// One page of a listing; `next_token` is set while more pages remain
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

/// Bucket operations used by the object-store source.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix` in lexical order.
    async fn list(
        &self,
        prefix: &str,
        max_keys: Option<i32>,
        continuation: Option<String>,
    ) -> StorageResult<ListPage>;

    /// Server-side copy. Fails with [`StorageError::NotFound`] when the source is gone.
    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Open the object body as a buffered async reader.
    async fn open(&self, key: &str) -> StorageResult<LogStream>;
}

/// S3-backed object store
#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> anyhow::Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let mut s3_config_builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "elb-ingestor");
                aws_sdk_s3::Config::builder()
                    .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            None => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for Storage {
    #[instrument(skip(self))]
    async fn list(
        &self,
        prefix: &str,
        max_keys: Option<i32>,
        continuation: Option<String>,
    ) -> StorageResult<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_max_keys(max_keys)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| request_error("list", prefix, e))?;

        let entries = response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|k| ObjectEntry {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(|t| t.to_string())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    #[instrument(skip(self))]
    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let copy_source = format!("{}/{}", self.bucket, source_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| request_error("copy", source_key, e))?;

        debug!("Copied s3://{}/{} to {}", self.bucket, source_key, dest_key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error("delete", key, e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match request_error("head", key, e) {
                StorageError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self))]
    async fn open(&self, key: &str) -> StorageResult<LogStream> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error("get", key, e))?;

        Ok(Box::new(Box::pin(response.body.into_async_read())))
    }
}

fn request_error<E, R>(operation: &'static str, key: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_string);

    match code.as_deref() {
        Some("NoSuchKey") | Some("NotFound") => StorageError::NotFound {
            key: key.to_string(),
        },
        _ => StorageError::Request {
            operation,
            key: key.to_string(),
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}
