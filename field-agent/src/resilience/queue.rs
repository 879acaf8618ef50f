//! Bounded priority queue for operations attempted while offline.

use super::error::NetworkError;
use futures_util::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_QUEUE_EXPIRY: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_OPERATION_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

/// Replayable unit of deferred work.
pub type OperationFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), NetworkError>> + Send + Sync>;

pub struct QueuedOperation {
    pub id: Uuid,
    pub priority: Priority,
    pub payload: OperationFn,
    pub created_at: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    seq: u64,
}

impl QueuedOperation {
    pub fn new(priority: Priority, max_retries: u32, payload: OperationFn) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            payload,
            created_at: Instant::now(),
            retry_count: 0,
            max_retries,
            last_error: None,
            seq: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

// Max-heap order: priority desc, then oldest first, then insertion order
impl Ord for QueuedOperation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedOperation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedOperation {}

struct QueueInner {
    heap: BinaryHeap<QueuedOperation>,
    next_seq: u64,
}

pub struct OperationQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
}

impl OperationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Add an operation. Returns false without blocking when the queue is full.
    pub async fn enqueue(&self, mut op: QueuedOperation) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.heap.len() >= self.capacity {
            warn!(
                "Operation queue full ({} entries), rejecting operation {}",
                self.capacity, op.id
            );
            return false;
        }

        op.seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(op);
        true
    }

    pub async fn dequeue(&self) -> Option<QueuedOperation> {
        self.inner.lock().await.heap.pop()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }

    /// Drop every entry older than `max_age`, whatever its retry count.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.heap.len();
        inner.heap.retain(|op| op.age() <= max_age);
        let dropped = before - inner.heap.len();

        if dropped > 0 {
            info!("Dropped {} expired queued operations", dropped);
        }
        dropped
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn noop() -> OperationFn {
        Arc::new(|| async { Ok(()) }.boxed())
    }

    #[tokio::test]
    async fn test_priority_then_age_order() {
        let queue = OperationQueue::new(10);
        let low = QueuedOperation::new(Priority::Low, 3, noop());
        let high_first = QueuedOperation::new(Priority::High, 3, noop());
        let high_second = QueuedOperation::new(Priority::High, 3, noop());
        let critical = QueuedOperation::new(Priority::Critical, 3, noop());

        let expected = [critical.id, high_first.id, high_second.id, low.id];

        assert!(queue.enqueue(low).await);
        assert!(queue.enqueue(high_first).await);
        assert!(queue.enqueue(high_second).await);
        assert!(queue.enqueue(critical).await);

        for id in expected {
            assert_eq!(queue.dequeue().await.map(|op| op.id), Some(id));
        }
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_fails_closed_when_full() {
        let queue = OperationQueue::new(2);
        assert!(queue.enqueue(QueuedOperation::new(Priority::Normal, 3, noop())).await);
        assert!(queue.enqueue(QueuedOperation::new(Priority::Normal, 3, noop())).await);
        assert!(!queue.enqueue(QueuedOperation::new(Priority::Critical, 3, noop())).await);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_regardless_of_retries() {
        let queue = OperationQueue::new(10);
        let mut old = QueuedOperation::new(Priority::Critical, 100, noop());
        old.retry_count = 0;
        assert!(queue.enqueue(old).await);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(queue.enqueue(QueuedOperation::new(Priority::Low, 3, noop())).await);

        tokio::time::advance(Duration::from_secs(2 * 3600)).await;
        let dropped = queue.sweep_expired(Duration::from_secs(2 * 3600 + 60)).await;

        assert_eq!(dropped, 1);
        let remaining = queue.dequeue().await.unwrap();
        assert_eq!(remaining.priority, Priority::Low);
    }
}
