//! Durable overflow queue for embedding requests the worker could not serve.
//!
//! Items are FIFO. A drain runs whenever a long-lived connection to the
//! worker is (re)established, before that connection serves new callers.
//! A failed item stays queued with its attempt count bumped until it hits
//! the attempt limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::worker::error::{EmbedError, QueueError};

/// Attempts before a queued item is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

/// One queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub text: String,
    pub enqueued_at_ms: i64,
    pub attempts: u32,
}

/// Stored outcome of a queued request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueResult {
    pub id: i64,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub vector: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Persistence behind the overflow queue.
pub trait QueueStore: Send + Sync + fmt::Debug {
    /// Append `text`; identical pending text is coalesced onto the existing item.
    /// Returns the item id and whether a new row was written.
    fn push(&self, text: &str) -> Result<(i64, bool), QueueError>;

    /// Oldest pending item.
    fn next_pending(&self) -> Result<Option<QueueItem>, QueueError>;

    fn complete(&self, id: i64, vector: &[f64]) -> Result<(), QueueError>;

    /// Bump the attempt count; the item is marked failed once `max_attempts` is reached.
    fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<ItemStatus, QueueError>;

    fn result(&self, id: i64) -> Result<Option<QueueResult>, QueueError>;

    fn pending_count(&self) -> Result<usize, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Delete completed and failed items last touched before `older_than` ago.
    fn cleanup_finished(&self, older_than: Duration) -> Result<usize, QueueError>;
}

type Completion = Result<Vec<f64>, EmbedError>;

/// Handle for an embedding that will be produced by a later drain.
#[derive(Debug)]
pub struct PendingEmbedding {
    id: i64,
    rx: Receiver<Completion>,
}

impl PendingEmbedding {
    /// Queue item id; also valid for [`OverflowQueue::result`] from another process.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Wait up to `timeout`. `None` means the item is still queued.
    pub fn wait(&self, timeout: Duration) -> Option<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EmbedError::ShutDown)),
        }
    }

    /// Non-blocking check.
    pub fn try_result(&self) -> Option<Completion> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EmbedError::ShutDown)),
        }
    }
}

/// Resets the draining flag even if the embed callback panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// FIFO backlog of embedding requests with in-process completion handles.
pub struct OverflowQueue {
    store: Box<dyn QueueStore>,
    waiters: Mutex<HashMap<i64, Vec<Sender<Completion>>>>,
    max_attempts: u32,
    draining: AtomicBool,
}

impl fmt::Debug for OverflowQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowQueue")
            .field("store", &self.store)
            .field("max_attempts", &self.max_attempts)
            .field("waiting", &self.waiters.lock().len())
            .finish()
    }
}

impl OverflowQueue {
    pub fn new(store: Box<dyn QueueStore>, max_attempts: u32) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            draining: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, text: &str) -> Result<PendingEmbedding, QueueError> {
        let (id, inserted) = self.store.push(text)?;
        let (tx, rx) = unbounded();
        self.waiters.lock().entry(id).or_default().push(tx);
        if inserted {
            info!(id, text_len = text.len(), "Embedding request queued for later");
        } else {
            debug!(id, "Joined identical queued embedding request");
        }
        // A concurrent drain may have finished the item before the waiter was registered.
        if let Some(stored) = self.store.result(id)?
            && stored.status != ItemStatus::Pending
        {
            debug!(id, status = stored.status.as_str(), "Queued item finished during enqueue");
            self.resolve_finished(stored);
        }
        Ok(PendingEmbedding { id, rx })
    }

    fn resolve_finished(&self, stored: QueueResult) {
        match stored.status {
            ItemStatus::Pending => {}
            ItemStatus::Completed => {
                if let Some(vector) = stored.vector {
                    self.notify(stored.id, |_| Ok(vector.clone()));
                }
            }
            ItemStatus::Failed => {
                let attempts = stored.attempts;
                let last_error = stored.last_error.unwrap_or_default();
                self.notify(stored.id, |id| {
                    Err(EmbedError::Queue(QueueError::Abandoned {
                        id,
                        attempts,
                        last_error: last_error.clone(),
                    }))
                });
            }
        }
    }

    /// Embed queued items oldest-first until the queue is empty or one fails.
    ///
    /// Returns the number of items completed. A drain already in progress on
    /// this queue makes the call a no-op.
    pub fn drain<F>(&self, mut embed: F) -> Result<usize, QueueError>
    where
        F: FnMut(&str) -> Result<Vec<f64>, EmbedError>,
    {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let _guard = DrainGuard(&self.draining);
        let mut completed = 0;
        while let Some(item) = self.store.next_pending()? {
            match embed(&item.text) {
                Ok(vector) => {
                    self.store.complete(item.id, &vector)?;
                    self.notify(item.id, |_| Ok(vector.clone()));
                    completed += 1;
                }
                Err(err) => {
                    let message = err.to_string();
                    let status = self.store.record_failure(item.id, &message, self.max_attempts)?;
                    if status == ItemStatus::Failed {
                        warn!(id = item.id, attempts = item.attempts + 1, error = %message, "Abandoning queued embedding");
                        let attempts = item.attempts + 1;
                        self.notify(item.id, |id| {
                            Err(EmbedError::Queue(QueueError::Abandoned {
                                id,
                                attempts,
                                last_error: message.clone(),
                            }))
                        });
                    } else {
                        debug!(id = item.id, error = %message, "Queued embedding failed, will retry on next drain");
                    }
                    break;
                }
            }
        }
        if completed > 0 {
            info!(completed, "Drained overflow queue");
        }
        Ok(completed)
    }

    fn notify(&self, id: i64, make: impl Fn(i64) -> Completion) {
        if let Some(senders) = self.waiters.lock().remove(&id) {
            for tx in senders {
                let _ = tx.send(make(id));
            }
        }
    }

    /// Stored outcome for `id`, including items queued by an earlier process.
    pub fn result(&self, id: i64) -> Result<Option<QueueResult>, QueueError> {
        self.store.result(id)
    }

    pub fn pending_count(&self) -> Result<usize, QueueError> {
        self.store.pending_count()
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats()
    }

    pub fn cleanup_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        self.store.cleanup_finished(older_than)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteQueueStore;

    fn queue(max_attempts: u32) -> OverflowQueue {
        OverflowQueue::new(Box::new(SqliteQueueStore::open_in_memory().unwrap()), max_attempts)
    }

    #[test]
    fn drain_resolves_pending_in_fifo_order() {
        let q = queue(DEFAULT_MAX_ATTEMPTS);
        let a = q.enqueue("a").unwrap();
        let b = q.enqueue("bb").unwrap();
        assert!(a.try_result().is_none());
        let mut seen = Vec::new();
        let drained = q
            .drain(|text| {
                seen.push(text.to_string());
                Ok(vec![text.len() as f64])
            })
            .unwrap();
        assert_eq!(drained, 2);
        assert_eq!(seen, vec!["a", "bb"]);
        assert_eq!(a.wait(Duration::from_secs(1)).unwrap().unwrap(), vec![1.0]);
        assert_eq!(b.wait(Duration::from_secs(1)).unwrap().unwrap(), vec![2.0]);
        assert_eq!(q.pending_count().unwrap(), 0);
    }

    #[test]
    fn failure_stops_drain_and_requeues() {
        let q = queue(3);
        let a = q.enqueue("a").unwrap();
        let _b = q.enqueue("b").unwrap();
        let mut calls = 0;
        let drained = q
            .drain(|_| {
                calls += 1;
                Err(EmbedError::connection_lost("/tmp/q.sock"))
            })
            .unwrap();
        assert_eq!(drained, 0);
        assert_eq!(calls, 1);
        assert!(a.try_result().is_none());
        let stored = q.result(a.id()).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(q.pending_count().unwrap(), 2);
    }

    #[test]
    fn item_is_abandoned_after_max_attempts() {
        let q = queue(2);
        let pending = q.enqueue("doomed").unwrap();
        for _ in 0..2 {
            q.drain(|_| Err(EmbedError::Worker("bad text".into()))).unwrap();
        }
        match pending.wait(Duration::from_secs(1)) {
            Some(Err(EmbedError::Queue(QueueError::Abandoned { attempts, .. }))) => assert_eq!(attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.stats().unwrap().failed, 1);
    }

    #[test]
    fn duplicate_text_shares_one_item() {
        let q = queue(DEFAULT_MAX_ATTEMPTS);
        let first = q.enqueue("same").unwrap();
        let second = q.enqueue("same").unwrap();
        assert_eq!(first.id(), second.id());
        let mut calls = 0;
        q.drain(|_| {
            calls += 1;
            Ok(vec![1.0])
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert!(first.wait(Duration::from_secs(1)).unwrap().is_ok());
        assert!(second.wait(Duration::from_secs(1)).unwrap().is_ok());
    }

    /// Finishes every pushed item before the queue registers its waiter.
    #[derive(Debug)]
    struct FinishOnPush {
        inner: SqliteQueueStore,
        fail: bool,
    }

    impl QueueStore for FinishOnPush {
        fn push(&self, text: &str) -> Result<(i64, bool), QueueError> {
            let (id, inserted) = self.inner.push(text)?;
            if self.fail {
                self.inner.record_failure(id, "worker rejected text", 1)?;
            } else {
                self.inner.complete(id, &[text.len() as f64])?;
            }
            Ok((id, inserted))
        }

        fn next_pending(&self) -> Result<Option<QueueItem>, QueueError> {
            self.inner.next_pending()
        }

        fn complete(&self, id: i64, vector: &[f64]) -> Result<(), QueueError> {
            self.inner.complete(id, vector)
        }

        fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<ItemStatus, QueueError> {
            self.inner.record_failure(id, error, max_attempts)
        }

        fn result(&self, id: i64) -> Result<Option<QueueResult>, QueueError> {
            self.inner.result(id)
        }

        fn pending_count(&self) -> Result<usize, QueueError> {
            self.inner.pending_count()
        }

        fn stats(&self) -> Result<QueueStats, QueueError> {
            self.inner.stats()
        }

        fn cleanup_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
            self.inner.cleanup_finished(older_than)
        }
    }

    #[test]
    fn item_completed_before_waiter_registers_still_resolves() {
        let store = FinishOnPush {
            inner: SqliteQueueStore::open_in_memory().unwrap(),
            fail: false,
        };
        let q = OverflowQueue::new(Box::new(store), DEFAULT_MAX_ATTEMPTS);
        let pending = q.enqueue("raced").unwrap();
        let vector = pending.try_result().expect("resolved at enqueue").unwrap();
        assert_eq!(vector, vec![5.0]);
        assert_eq!(q.waiters.lock().len(), 0);
    }

    #[test]
    fn item_abandoned_before_waiter_registers_still_resolves() {
        let store = FinishOnPush {
            inner: SqliteQueueStore::open_in_memory().unwrap(),
            fail: true,
        };
        let q = OverflowQueue::new(Box::new(store), DEFAULT_MAX_ATTEMPTS);
        let pending = q.enqueue("raced").unwrap();
        match pending.try_result() {
            Some(Err(EmbedError::Queue(QueueError::Abandoned { id, attempts, last_error }))) => {
                assert_eq!(id, pending.id());
                assert_eq!(attempts, 1);
                assert_eq!(last_error, "worker rejected text");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.waiters.lock().len(), 0);
    }

    #[test]
    fn nested_drain_is_a_no_op() {
        let q = queue(DEFAULT_MAX_ATTEMPTS);
        q.enqueue("x").unwrap();
        let drained = q
            .drain(|_| {
                assert!(q.is_draining());
                assert_eq!(q.drain(|_| Ok(vec![0.0])).unwrap(), 0);
                Ok(vec![1.0])
            })
            .unwrap();
        assert_eq!(drained, 1);
        assert!(!q.is_draining());
    }
}
