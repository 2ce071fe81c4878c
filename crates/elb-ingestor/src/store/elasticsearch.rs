//! Elasticsearch `_bulk` client
//!
//! Each batch becomes one NDJSON request of `index` actions keyed by `_id`.
//! Hosts are used round-robin; a transient failure on one host moves on to the
//! next before the error is reported to the uploader's retry loop.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{BulkOutcome, DocumentStore, IndexedDocument, StoreError};
use crate::error::{IngestError, IngestResult};

// ============================================================================
// Client Constants
// ============================================================================

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Longest response body excerpt carried in an error message.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct ElasticsearchStore {
    client: Client,
    hosts: Vec<String>,
    next_host: AtomicUsize,
}

impl ElasticsearchStore {
    pub fn new(hosts: Vec<String>, timeout: Duration) -> IngestResult<Self> {
        let hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| h.trim().trim_end_matches('/').to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(IngestError::Config(
                "At least one Elasticsearch host is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            hosts,
            next_host: AtomicUsize::new(0),
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// NDJSON body: an action line and a source line per document.
    pub fn bulk_body(docs: &[IndexedDocument]) -> Result<String, StoreError> {
        let mut body = String::new();
        for doc in docs {
            let action = json!({ "index": { "_index": doc.index, "_id": doc.id } });
            let action = serde_json::to_string(&action)
                .map_err(|e| StoreError::Permanent(format!("Failed to encode action: {}", e)))?;
            let source = serde_json::to_string(&doc.source)
                .map_err(|e| StoreError::Permanent(format!("Failed to encode document: {}", e)))?;
            body.push_str(&action);
            body.push('\n');
            body.push_str(&source);
            body.push('\n');
        }
        Ok(body)
    }

    #[instrument(skip(self, body, count))]
    async fn send(&self, host: &str, body: &str, count: usize) -> Result<BulkOutcome, StoreError> {
        let url = format!("{}/_bulk", host);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    StoreError::Permanent(format!("Invalid request to {}: {}", url, e))
                } else {
                    StoreError::Transient(format!("Request to {} failed: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(ERROR_BODY_LIMIT).collect();
            let message = format!("{} returned {}: {}", url, status, excerpt);
            return Err(if is_retryable_status(status) {
                StoreError::Transient(message)
            } else {
                StoreError::Permanent(message)
            });
        }

        let parsed: BulkResponse = response.json().await.map_err(|e| {
            StoreError::Transient(format!("Unreadable bulk response from {}: {}", url, e))
        })?;

        if !parsed.errors {
            return Ok(BulkOutcome {
                written: count,
                failed: 0,
            });
        }

        let mut failed = 0;
        let mut throttled = 0;
        for item in parsed.items.iter().flat_map(|entry| entry.values()) {
            if item.status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
                throttled += 1;
            } else if item.status >= 300 {
                if failed == 0 {
                    warn!(status = item.status, error = ?item.error, "Document rejected");
                }
                failed += 1;
            }
        }

        if throttled > 0 {
            return Err(StoreError::Transient(format!(
                "{} of {} documents throttled by {}",
                throttled, count, host
            )));
        }

        Ok(BulkOutcome {
            written: count.saturating_sub(failed),
            failed,
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn bulk_upsert(&self, docs: &[IndexedDocument]) -> Result<BulkOutcome, StoreError> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let body = Self::bulk_body(docs)?;
        let start = self.next_host.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.hosts.len() {
            let host = &self.hosts[(start + offset) % self.hosts.len()];
            match self.send(host, &body, docs.len()).await {
                Ok(outcome) => {
                    debug!(host = %host, written = outcome.written, failed = outcome.failed, "Bulk request done");
                    return Ok(outcome);
                },
                Err(e) if e.is_transient() => {
                    warn!(host = %host, error = %e, "Bulk request failed, trying next host");
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Transient("No hosts available".to_string())))
    }
}
