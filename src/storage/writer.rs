use super::DurableStore;
use crate::config::WriteRetryPolicy;
use crate::core::{EntityId, EntityRecord, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{Level, event};

/// A durable mutation waiting to be mirrored to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(EntityRecord),
    Delete(EntityId),
}

impl WriteOp {
    pub fn id(&self) -> &EntityId {
        match self {
            WriteOp::Put(record) => &record.id,
            WriteOp::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    op: WriteOp,
    attempts: u32,
    not_before: Instant,
}

/// Outcome of one pass over the pending writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    pub still_pending: usize,
}

/// Asynchronous write-through in front of a [`DurableStore`].
///
/// Pending operations are keyed by entity id, so a newer mutation replaces an
/// older one that has not been written yet: the latest in-memory state is what
/// reaches the store. A failed write is re-queued with exponential backoff
/// unless a newer operation for the same id arrived meanwhile.
pub struct WriteThrough {
    store: Arc<dyn DurableStore>,
    retry: WriteRetryPolicy,
    pending: Mutex<HashMap<EntityId, PendingWrite>>,
    // Serializes passes so two flushes never write the same id out of order.
    pass: Mutex<()>,
    written_total: AtomicU64,
    failures_total: AtomicU64,
}

impl WriteThrough {
    pub fn new(store: Arc<dyn DurableStore>, retry: WriteRetryPolicy) -> Self {
        Self {
            store,
            retry,
            pending: Mutex::new(HashMap::new()),
            pass: Mutex::new(()),
            written_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub async fn enqueue(&self, op: WriteOp) {
        let mut pending = self.pending.lock().await;
        pending.insert(
            op.id().clone(),
            PendingWrite {
                op,
                attempts: 0,
                not_before: Instant::now(),
            },
        );
    }

    pub async fn enqueue_put(&self, record: EntityRecord) {
        self.enqueue(WriteOp::Put(record)).await;
    }

    pub async fn enqueue_delete(&self, id: EntityId) {
        self.enqueue(WriteOp::Delete(id)).await;
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending_op(&self, id: &EntityId) -> Option<WriteOp> {
        self.pending.lock().await.get(id).map(|p| p.op.clone())
    }

    pub fn written_total(&self) -> u64 {
        self.written_total.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    /// Writes every operation whose backoff has elapsed. Called by the flush worker.
    pub async fn process_due(&self) -> FlushReport {
        self.run_pass(false).await
    }

    /// Writes every pending operation once, ignoring backoff.
    pub async fn flush(&self) -> FlushReport {
        self.run_pass(true).await
    }

    /// Drains pending writes for shutdown, retrying failed ones up to
    /// `shutdown_attempts` passes.
    pub async fn drain(&self) -> FlushReport {
        let passes = self.retry.shutdown_attempts.max(1);
        let mut total = FlushReport::default();
        for attempt in 1..=passes {
            let report = self.flush().await;
            total.written += report.written;
            total.failed += report.failed;
            total.still_pending = report.still_pending;
            if report.still_pending == 0 {
                break;
            }
            if attempt < passes {
                sleep(Duration::from_millis(self.retry.backoff_ms(attempt))).await;
            }
        }
        total
    }

    async fn run_pass(&self, ignore_backoff: bool) -> FlushReport {
        let _pass = self.pass.lock().await;
        let now = Instant::now();
        let due = {
            let mut pending = self.pending.lock().await;
            let ids = pending
                .iter()
                .filter(|(_, write)| ignore_backoff || write.not_before <= now)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect::<Vec<_>>()
        };

        let mut report = FlushReport::default();
        for write in due {
            match self.execute(&write.op).await {
                Ok(()) => {
                    report.written += 1;
                    self.written_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    report.failed += 1;
                    self.failures_total.fetch_add(1, Ordering::Relaxed);
                    self.requeue(write, &err.to_string()).await;
                }
            }
        }

        report.still_pending = self.pending.lock().await.len();
        report
    }

    async fn execute(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Put(record) => self.store.put(record).await,
            WriteOp::Delete(id) => self.store.delete(id).await,
        }
    }

    async fn requeue(&self, write: PendingWrite, error: &str) {
        let mut pending = self.pending.lock().await;
        let id = write.op.id().clone();
        if pending.contains_key(&id) {
            // Superseded by a newer mutation; the failed one is obsolete.
            return;
        }

        let attempts = write.attempts.saturating_add(1);
        let backoff_ms = self.retry.backoff_ms(attempts);
        event!(
            Level::WARN,
            entity_id = %id,
            attempts,
            backoff_ms,
            error = %error,
            "durable write failed, retrying"
        );
        pending.insert(
            id,
            PendingWrite {
                op: write.op,
                attempts,
                not_before: Instant::now() + Duration::from_millis(backoff_ms),
            },
        );
    }
}
