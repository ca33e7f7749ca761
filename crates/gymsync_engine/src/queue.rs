//! Outbound operation queue.

use crate::error::{SyncError, SyncResult};
use gymsync_protocol::SyncOperation;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::warn;

/// An operation waiting for transmission, with its delivery attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    /// The operation.
    pub operation: SyncOperation,
    /// Transmission attempts already made.
    pub attempts: u32,
}

impl QueuedOperation {
    /// Wraps a fresh operation.
    pub fn new(operation: SyncOperation) -> Self {
        Self {
            operation,
            attempts: 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueuedOperation>,
    closed: bool,
    warned: bool,
}

/// FIFO buffer of outbound operations.
///
/// Any number of producers may enqueue concurrently; exactly one consumer
/// (the sender loop) dequeues. Operations that fail transmission go back to
/// the front so per-table order is kept.
#[derive(Debug)]
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: Option<usize>,
    warn_threshold: usize,
}

impl OperationQueue {
    /// Creates a queue; `capacity` of `None` means unbounded.
    pub fn new(capacity: Option<usize>, warn_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity,
            warn_threshold,
        }
    }

    /// Creates an unbounded queue.
    pub fn unbounded() -> Self {
        Self::new(None, usize::MAX)
    }

    /// Appends an operation and returns the new queue length.
    pub fn enqueue(&self, operation: SyncOperation) -> SyncResult<usize> {
        let len = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SyncError::Stopped);
            }
            if let Some(capacity) = self.capacity {
                if inner.entries.len() >= capacity {
                    return Err(SyncError::QueueFull { capacity });
                }
            }
            inner.entries.push_back(QueuedOperation::new(operation));
            let len = inner.entries.len();
            if len > self.warn_threshold && !inner.warned {
                inner.warned = true;
                warn!(
                    queue_len = len,
                    threshold = self.warn_threshold,
                    "outbound queue is backing up"
                );
            } else if len <= self.warn_threshold {
                inner.warned = false;
            }
            len
        };
        self.notify.notify_one();
        Ok(len)
    }

    /// Puts an operation back at the head of the queue for another attempt.
    ///
    /// Returns false if the queue has been closed in the meantime.
    pub fn requeue_front(&self, entry: QueuedOperation) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.entries.push_front(entry);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next operation.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueuedOperation> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(entry) = inner.entries.pop_front() {
                    return Some(entry);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Takes the next operation without waiting.
    pub fn try_dequeue(&self) -> Option<QueuedOperation> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.entries.pop_front()
    }

    /// Returns the most recently queued operation for `(table, record_id)`.
    pub fn find_pending(&self, table: &str, record_id: &str) -> Option<SyncOperation> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .find(|entry| same_record(&entry.operation, table, record_id))
            .map(|entry| entry.operation.clone())
    }

    /// Drops every queued operation for `(table, record_id)` and returns how
    /// many were removed.
    pub fn discard_pending(&self, table: &str, record_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|entry| !same_record(&entry.operation, table, record_id));
        before - inner.entries.len()
    }

    /// Swaps the most recently queued operation for `(table, record_id)` for
    /// `operation`, keeping its position and attempt count.
    ///
    /// Returns false if no such operation is queued.
    pub fn replace_pending(&self, table: &str, record_id: &str, operation: SyncOperation) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .entries
            .iter_mut()
            .rev()
            .find(|entry| same_record(&entry.operation, table, record_id))
        {
            Some(entry) => {
                entry.operation = operation;
                true
            }
            None => false,
        }
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Returns true once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the queue, wakes the consumer and discards what is left.
    ///
    /// Returns the number of discarded operations.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let discarded = inner.entries.len();
            inner.entries.clear();
            discarded
        };
        self.notify.notify_one();
        discarded
    }
}

fn same_record(operation: &SyncOperation, table: &str, record_id: &str) -> bool {
    operation.table() == table && operation.record_id().as_deref() == Some(record_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gymsync_protocol::{into_record, OperationType, Origin};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn op(id: &str, table: &str, data: serde_json::Value) -> SyncOperation {
        SyncOperation::new(
            id,
            table,
            OperationType::Update,
            into_record(data).unwrap(),
            Utc::now(),
            Origin::new("u1", "d1"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fifo_order() {
        let queue = OperationQueue::unbounded();
        queue.enqueue(op("a", "pagos", json!({"id": 1}))).unwrap();
        queue.enqueue(op("b", "pagos", json!({"id": 2}))).unwrap();
        queue.enqueue(op("c", "clases", json!({"id": 1}))).unwrap();
        assert_eq!(queue.len(), 3);

        let ids: Vec<String> = [
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
        ]
        .iter()
        .map(|entry| entry.operation.id().to_string())
        .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(OperationQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(op("a", "pagos", json!({"id": 1}))).unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation.id(), "a");
        assert_eq!(entry.attempts, 0);
    }

    #[tokio::test]
    async fn close_wakes_consumer() {
        let queue = Arc::new(OperationQueue::unbounded());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert!(matches!(
            queue.enqueue(op("a", "pagos", json!({"id": 1}))),
            Err(SyncError::Stopped)
        ));
    }

    #[test]
    fn bounded_queue_rejects_overflow() {
        let queue = OperationQueue::new(Some(2), 1);
        queue.enqueue(op("a", "pagos", json!({"id": 1}))).unwrap();
        queue.enqueue(op("b", "pagos", json!({"id": 2}))).unwrap();
        let err = queue.enqueue(op("c", "pagos", json!({"id": 3}))).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull { capacity: 2 }));
    }

    #[test]
    fn requeue_goes_to_front() {
        let queue = OperationQueue::unbounded();
        queue.enqueue(op("a", "pagos", json!({"id": 1}))).unwrap();
        queue.enqueue(op("b", "pagos", json!({"id": 2}))).unwrap();

        let mut first = queue.try_dequeue().unwrap();
        first.attempts += 1;
        assert!(queue.requeue_front(first));

        let again = queue.try_dequeue().unwrap();
        assert_eq!(again.operation.id(), "a");
        assert_eq!(again.attempts, 1);
    }

    #[test]
    fn find_pending_returns_latest_for_record() {
        let queue = OperationQueue::unbounded();
        queue
            .enqueue(op("a", "pagos", json!({"id": 7, "monto": 10})))
            .unwrap();
        queue
            .enqueue(op("b", "pagos", json!({"id": "7", "monto": 20})))
            .unwrap();
        queue.enqueue(op("c", "clases", json!({"id": 7}))).unwrap();

        let pending = queue.find_pending("pagos", "7").unwrap();
        assert_eq!(pending.id(), "b");
        assert!(queue.find_pending("pagos", "8").is_none());
    }

    #[test]
    fn discard_pending_drops_only_that_record() {
        let queue = OperationQueue::unbounded();
        queue.enqueue(op("a", "pagos", json!({"id": 7, "monto": 10}))).unwrap();
        queue.enqueue(op("b", "pagos", json!({"id": 8}))).unwrap();
        queue.enqueue(op("c", "pagos", json!({"id": 7, "monto": 20}))).unwrap();

        assert_eq!(queue.discard_pending("pagos", "7"), 2);
        assert_eq!(queue.discard_pending("pagos", "7"), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_dequeue().unwrap().operation.id(), "b");
    }

    #[test]
    fn replace_pending_keeps_position_and_attempts() {
        let queue = OperationQueue::unbounded();
        queue.enqueue(op("a", "asistencias", json!({"id": 1, "visitas": 2}))).unwrap();
        queue.enqueue(op("b", "asistencias", json!({"id": 2}))).unwrap();
        let mut first = queue.try_dequeue().unwrap();
        first.attempts = 2;
        assert!(queue.requeue_front(first));

        let merged = op("a", "asistencias", json!({"id": 1, "visitas": 5}));
        assert!(queue.replace_pending("asistencias", "1", merged));
        assert!(!queue.replace_pending("asistencias", "3", op("z", "asistencias", json!({"id": 3}))));

        let head = queue.try_dequeue().unwrap();
        assert_eq!(head.operation.data()["visitas"], json!(5));
        assert_eq!(head.attempts, 2);
        assert_eq!(queue.try_dequeue().unwrap().operation.id(), "b");
    }

    #[test]
    fn close_discards_remaining() {
        let queue = OperationQueue::unbounded();
        queue.enqueue(op("a", "pagos", json!({"id": 1}))).unwrap();
        queue.enqueue(op("b", "pagos", json!({"id": 2}))).unwrap();
        assert_eq!(queue.close(), 2);
        assert!(queue.is_closed());
        assert!(queue.try_dequeue().is_none());
        assert!(!queue.requeue_front(QueuedOperation::new(op(
            "c",
            "pagos",
            json!({"id": 3})
        ))));
    }
}
