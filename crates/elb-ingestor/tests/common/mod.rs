//! Common test utilities for ELB ingestor integration tests
//!
//! In-memory stand-ins for the two external systems:
//!
//! - [`MemoryObjectStore`]: a bucket with lexical listing, pagination,
//!   copy/delete semantics matching S3 and per-operation fault injection
//! - [`MemoryDocumentStore`]: an id-keyed document store that records every
//!   bulk call, can be told to fail, and can be held closed to simulate a
//!   stalled cluster
//!
//! plus sample log lines and a pipeline configuration with short timers.

#![allow(dead_code)]

use async_trait::async_trait;
use elb_ingestor::pipeline::{PipelineConfig, UploadConfig};
use elb_ingestor::source::LogStream;
use elb_ingestor::storage::{ListPage, ObjectEntry, ObjectStore, StorageError, StorageResult};
use elb_ingestor::store::{BulkOutcome, DocumentStore, IndexedDocument, StoreError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Sample Lines
// ============================================================================

/// A well-formed Classic ELB line for client port `port`.
pub fn classic_line(port: u16) -> String {
    format!(
        r#"2024-03-01T12:00:{:02}.000000Z my-lb 192.168.1.10:{} 10.0.0.1:80 0.000086 0.001048 0.001337 200 200 0 57 "GET https://www.example.com:443/item/{} HTTP/1.1" "curl/7.38.0" DHE-RSA-AES128-SHA TLSv1.2"#,
        port % 60,
        port,
        port
    )
}

pub const MALFORMED_LINE: &str = "this line is not an access log entry";

/// Newline-terminated file body from lines.
pub fn file_body(lines: &[String]) -> String {
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

/// Pipeline settings with millisecond timers.
pub fn fast_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        file_batch_size: 5,
        queue_capacity: 100,
        uploader_workers: 2,
        poll_interval: Duration::from_millis(20),
        error_backoff: Duration::from_millis(50),
        complete_attempts: 3,
        upload: UploadConfig {
            batch_size: 50,
            max_wait: Duration::from_millis(20),
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(5),
            ..UploadConfig::default()
        },
    }
}

/// Poll `condition` every 10ms until it holds; panics after `timeout`.
pub async fn wait_until<F>(timeout: Duration, what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// In-memory Object Store
// ============================================================================

/// Bucket operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Copy,
    Delete,
    Open,
}

/// Injected failure for `op` on keys starting with `key_prefix`
#[derive(Debug)]
struct Fault {
    op: Op,
    key_prefix: String,
    remaining: usize,
}

pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    page_size: usize,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size,
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn put(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.lock().unwrap().insert(key.to_string(), body.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// Fail the next `times` calls of `op` whose key (the source key for
    /// copies, the prefix for listings) starts with `key_prefix`.
    pub fn fail(&self, op: Op, key_prefix: &str, times: usize) {
        self.faults.lock().unwrap().push(Fault {
            op,
            key_prefix: key_prefix.to_string(),
            remaining: times,
        });
    }

    /// Fail `op` on matching keys until [`MemoryObjectStore::clear_faults`].
    pub fn fail_always(&self, op: Op, key_prefix: &str) {
        self.fail(op, key_prefix, usize::MAX);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn set_fail_listing(&self, fail: bool) {
        if fail {
            self.fail_always(Op::List, "");
        } else {
            self.faults.lock().unwrap().retain(|f| f.op != Op::List);
        }
    }

    fn check(&self, op: Op, operation: &'static str, key: &str) -> StorageResult<()> {
        let mut faults = self.faults.lock().unwrap();
        let hit = faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && key.starts_with(f.key_prefix.as_str()));

        match hit {
            Some(fault) => {
                fault.remaining = fault.remaining.saturating_sub(1);
                Err(StorageError::Request {
                    operation,
                    key: key.to_string(),
                    message: "connection reset".to_string(),
                })
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(
        &self,
        prefix: &str,
        max_keys: Option<i32>,
        continuation: Option<String>,
    ) -> StorageResult<ListPage> {
        self.check(Op::List, "list", prefix)?;

        let limit = max_keys
            .map(|n| n.max(0) as usize)
            .unwrap_or(self.page_size)
            .min(self.page_size);
        let objects = self.objects.lock().unwrap();

        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| continuation.as_ref().map_or(true, |after| key.as_str() > after.as_str()));

        let entries: Vec<ObjectEntry> = matching
            .by_ref()
            .take(limit)
            .map(|(key, body)| ObjectEntry {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect();
        let more = matching.next().is_some();

        Ok(ListPage {
            next_token: if more {
                entries.last().map(|e| e.key.clone())
            } else {
                None
            },
            entries,
        })
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        self.check(Op::Copy, "copy", source_key)?;
        let mut objects = self.objects.lock().unwrap();
        let body = objects.get(source_key).cloned().ok_or_else(|| StorageError::NotFound {
            key: source_key.to_string(),
        })?;
        objects.insert(dest_key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check(Op::Delete, "delete", key)?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn open(&self, key: &str) -> StorageResult<LogStream> {
        self.check(Op::Open, "open", key)?;
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        Ok(Box::new(Cursor::new(body)))
    }
}

// ============================================================================
// In-memory Document Store
// ============================================================================

pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, (String, Value)>>,
    calls: Mutex<Vec<Vec<String>>>,
    failures: Mutex<VecDeque<StoreError>>,
    gate: watch::Sender<bool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            documents: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gate,
        }
    }

    /// Fail the next bulk calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Hold every bulk call until [`MemoryDocumentStore::open`].
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn document(&self, id: &str) -> Option<(String, Value)> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of every bulk call, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn total_writes(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk_upsert(&self, docs: &[IndexedDocument]) -> Result<BulkOutcome, StoreError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut documents = self.documents.lock().unwrap();
        for doc in docs {
            documents.insert(doc.id.clone(), (doc.index.clone(), doc.source.clone()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(docs.iter().map(|d| d.id.clone()).collect());

        Ok(BulkOutcome {
            written: docs.len(),
            failed: 0,
        })
    }
}
