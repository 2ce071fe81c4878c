//! Pipeline counters
//!
//! One [`Stats`] is shared by every task behind an `Arc`. All updates are
//! relaxed atomics; readers take a [`StatsSnapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct Stats {
    // fetcher
    pub files_discovered: AtomicU64,
    pub files_claimed: AtomicU64,
    pub files_completed: AtomicU64,
    pub files_recovered: AtomicU64,
    pub claim_conflicts: AtomicU64,
    pub adapter_errors: AtomicU64,
    pub files_in_flight: AtomicU64,
    pub files_stranded: AtomicU64,
    source_healthy: AtomicBool,

    // parser
    pub lines_read: AtomicU64,
    pub records_enqueued: AtomicU64,
    pub parse_errors: AtomicU64,
    pub partial_records: AtomicU64,

    // shipper
    pub batches_written: AtomicU64,
    pub batch_failures: AtomicU64,
    pub documents_written: AtomicU64,
    pub documents_failed: AtomicU64,
    pub store_retries: AtomicU64,
    pub queue_depth: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            files_discovered: AtomicU64::new(0),
            files_claimed: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            files_recovered: AtomicU64::new(0),
            claim_conflicts: AtomicU64::new(0),
            adapter_errors: AtomicU64::new(0),
            files_in_flight: AtomicU64::new(0),
            files_stranded: AtomicU64::new(0),
            source_healthy: AtomicBool::new(true),
            lines_read: AtomicU64::new(0),
            records_enqueued: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            partial_records: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
            documents_written: AtomicU64::new(0),
            documents_failed: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn file_started(&self) {
        self.files_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_finished(&self) {
        // never wraps below zero
        let _ = self
            .files_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn set_source_healthy(&self, healthy: bool) {
        self.source_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn source_healthy(&self) -> bool {
        self.source_healthy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = Self::get;
        StatsSnapshot {
            fetcher: FetcherSnapshot {
                files_discovered: get(&self.files_discovered),
                files_claimed: get(&self.files_claimed),
                files_completed: get(&self.files_completed),
                files_recovered: get(&self.files_recovered),
                claim_conflicts: get(&self.claim_conflicts),
                adapter_errors: get(&self.adapter_errors),
                files_in_flight: get(&self.files_in_flight),
                files_stranded: get(&self.files_stranded),
                source_healthy: self.source_healthy(),
            },
            parser: ParserSnapshot {
                lines_read: get(&self.lines_read),
                records_enqueued: get(&self.records_enqueued),
                parse_errors: get(&self.parse_errors),
                partial_records: get(&self.partial_records),
            },
            shipper: ShipperSnapshot {
                batches_written: get(&self.batches_written),
                batch_failures: get(&self.batch_failures),
                documents_written: get(&self.documents_written),
                documents_failed: get(&self.documents_failed),
                store_retries: get(&self.store_retries),
                queue_depth: get(&self.queue_depth),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fetcher: FetcherSnapshot,
    pub parser: ParserSnapshot,
    pub shipper: ShipperSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetcherSnapshot {
    pub files_discovered: u64,
    pub files_claimed: u64,
    pub files_completed: u64,
    pub files_recovered: u64,
    pub claim_conflicts: u64,
    pub adapter_errors: u64,
    pub files_in_flight: u64,
    /// Files left in the processing area after a failed read or completion
    pub files_stranded: u64,
    pub source_healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParserSnapshot {
    pub lines_read: u64,
    pub records_enqueued: u64,
    pub parse_errors: u64,
    pub partial_records: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShipperSnapshot {
    pub batches_written: u64,
    pub batch_failures: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    pub store_retries: u64,
    pub queue_depth: u64,
}
