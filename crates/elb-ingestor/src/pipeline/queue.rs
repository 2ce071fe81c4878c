//! Bounded work queue between parsers and uploaders
//!
//! Producers block when the queue is full; nothing is ever dropped. After
//! [`WorkQueue::close`] producers fail fast while consumers keep draining
//! whatever is left.

use async_channel::{Receiver, Sender};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::record::LogRecord;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("work queue is closed")]
pub struct QueueClosed;

/// Cloneable MPMC handle; all clones share one channel.
#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<LogRecord>,
    rx: Receiver<LogRecord>,
}

impl WorkQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub async fn enqueue(&self, record: LogRecord) -> Result<(), QueueClosed> {
        self.tx.send(record).await.map_err(|_| QueueClosed)
    }

    /// Wait for at least one record, then keep collecting until `max_n`
    /// records are in hand or `max_wait` has passed since the first arrived.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue_batch(&self, max_n: usize, max_wait: Duration) -> Option<Vec<LogRecord>> {
        let first = self.rx.recv().await.ok()?;
        let max_n = max_n.max(1);
        let mut batch = Vec::with_capacity(max_n.min(self.rx.len() + 1));
        batch.push(first);

        let deadline = Instant::now() + max_wait;
        while batch.len() < max_n {
            if let Ok(record) = self.rx.try_recv() {
                batch.push(record);
                continue;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Ok(record)) => batch.push(record),
                // closed and drained, or out of time
                Ok(Err(_)) | Err(_) => break,
            }
        }

        Some(batch)
    }

    /// Stop accepting records. Already queued records remain receivable.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map};

    fn record(n: i64) -> LogRecord {
        let mut fields = Map::new();
        fields.insert("n".to_string(), json!(n));
        LogRecord::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), fields)
    }

    #[tokio::test]
    async fn test_fifo_batches() {
        let queue = WorkQueue::new(10);
        for n in 0..5 {
            queue.enqueue(record(n)).await.unwrap();
        }

        let batch = queue.dequeue_batch(3, Duration::from_millis(10)).await.unwrap();
        let ns: Vec<_> = batch.iter().map(|r| r.fields["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_after_max_wait() {
        let queue = WorkQueue::new(10);
        queue.enqueue(record(1)).await.unwrap();

        let started = Instant::now();
        let batch = queue.dequeue_batch(100, Duration::from_millis(250)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_enqueue_blocks_when_full() {
        let queue = WorkQueue::new(2);
        queue.enqueue(record(1)).await.unwrap();
        queue.enqueue(record(2)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.enqueue(record(3))).await;
        assert!(blocked.is_err());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = WorkQueue::new(4);
        queue.enqueue(record(1)).await.unwrap();
        queue.close();

        assert_eq!(queue.enqueue(record(2)).await, Err(QueueClosed));
        let batch = queue.dequeue_batch(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(queue.dequeue_batch(10, Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = WorkQueue::new(4);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_batch(10, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
