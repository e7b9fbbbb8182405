use crate::{AuditRecord, SinkError, SinkResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable destination for audit records.
///
/// Implementations must accept concurrent calls. A failed `insert_many`
/// means some or all of the batch may be missing; resubmitting the same
/// records must be safe.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()>;
    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()>;
    /// Release the underlying connection. Called once at shutdown; further
    /// calls are no-ops.
    async fn close(&self) -> SinkResult<()>;
}

#[async_trait]
impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()> {
        (**self).insert_one(record).await
    }
    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()> {
        (**self).insert_many(records).await
    }
    async fn close(&self) -> SinkResult<()> {
        (**self).close().await
    }
}

// ---------------- In-Memory Implementation (Tests / local dev) ----------------

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    inner: Arc<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    stored: Mutex<Vec<AuditRecord>>,
    batches: Mutex<Vec<usize>>,
    single_calls: AtomicUsize,
    failures_left: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` insert calls fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.inner.failures_left.store(n, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.inner.stored.lock().await.clone()
    }

    /// Sizes of every successful `insert_many` call, in call order.
    pub async fn batches(&self) -> Vec<usize> {
        self.inner.batches.lock().await.clone()
    }

    pub fn single_inserts(&self) -> usize {
        self.inner.single_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> SinkResult<()> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        let injected = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()> {
        self.check_writable()?;
        self.inner.single_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.stored.lock().await.push(record.clone());
        Ok(())
    }

    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()> {
        self.check_writable()?;
        // Hold both locks so a batch lands as one unit for concurrent readers.
        let mut stored = self.inner.stored.lock().await;
        let mut batches = self.inner.batches.lock().await;
        stored.extend_from_slice(records);
        batches.push(records.len());
        Ok(())
    }

    async fn close(&self) -> SinkResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
