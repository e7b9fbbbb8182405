#![allow(dead_code)]

use async_trait::async_trait;
use audit_pump::{GroupEvent, GroupMember, HandlerError, MessageHandler, PartitionId, RawMessage, SourceError};
use common_audit::{encode, AuditRecord, AuditSink, SinkResult};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const TOPIC: &str = "iam";

pub fn record(username: &str, timestamp: i64) -> AuditRecord {
    AuditRecord {
        timestamp,
        username: username.to_string(),
        effect: "allow".into(),
        conclusion: "policy matched".into(),
        request: format!("{{\"subject\":\"{username}\"}}"),
        policies: "[\"p1\"]".into(),
        deciders: "[\"d1\"]".into(),
    }
}

pub fn partition(n: i32) -> PartitionId {
    PartitionId::new(TOPIC, n)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Same as [`wait_until`] for checks that need to await.
pub async fn wait_until_async<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------- Fake consumer group member ----------------

/// Scripted group member. Tests push assignment changes and records in the
/// order the broker would deliver them; acknowledgements are recorded as
/// committed offsets (next offset to read, per partition).
#[derive(Default)]
pub struct FakeMember {
    events: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<GroupEvent, SourceError>>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Result<GroupEvent, SourceError>>>>,
    assigned: Mutex<HashSet<PartitionId>>,
    marks: Mutex<Vec<(PartitionId, i64)>>,
    committed: Mutex<HashMap<PartitionId, i64>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl FakeMember {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events: tokio::sync::Mutex::new(Some(rx)),
            tx: Mutex::new(Some(tx)),
            ..Self::default()
        })
    }

    /// A member that resumes from offsets committed by an earlier session.
    pub fn resuming_from(previous: &FakeMember) -> Arc<Self> {
        let member = Self::new();
        *member.committed.lock().unwrap() = previous.committed.lock().unwrap().clone();
        member
    }

    fn push(&self, event: Result<GroupEvent, SourceError>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn assign(&self, partitions: &[PartitionId]) {
        self.assigned.lock().unwrap().extend(partitions.iter().cloned());
        self.push(Ok(GroupEvent::Assigned(partitions.to_vec())));
    }

    /// Live assignment without the matching event, as when a record is
    /// fetched in the same poll that ran the assign callback.
    pub fn assign_silently(&self, partitions: &[PartitionId]) {
        self.assigned.lock().unwrap().extend(partitions.iter().cloned());
    }

    /// Broker-side revocation: the claim is gone at once, the worker learns
    /// about it on its next poll.
    pub fn revoke(&self, partitions: &[PartitionId]) {
        {
            let mut assigned = self.assigned.lock().unwrap();
            for p in partitions {
                assigned.remove(p);
            }
        }
        self.push(Ok(GroupEvent::Revoked(partitions.to_vec())));
    }

    pub fn deliver(&self, partition: i32, offset: i64, payload: Vec<u8>) {
        self.push(Ok(GroupEvent::Record(RawMessage::from_partition(
            TOPIC,
            partition,
            offset,
            Some(format!("key-{offset}").into_bytes()),
            payload,
        ))));
    }

    /// Redeliver a partition's log from the committed offset, the way a
    /// restarted consumer would.
    pub fn replay(&self, n: i32, log: &[Vec<u8>]) {
        let from = self.committed(&partition(n)).unwrap_or(0);
        for (offset, payload) in log.iter().enumerate().skip(from as usize) {
            self.deliver(n, offset as i64, payload.clone());
        }
    }

    pub fn fail(&self, err: SourceError) {
        self.push(Err(err));
    }

    pub fn marks(&self) -> Vec<(PartitionId, i64)> {
        self.marks.lock().unwrap().clone()
    }

    pub fn marked_offsets(&self) -> Vec<i64> {
        self.marks().into_iter().map(|(_, offset)| offset).collect()
    }

    pub fn committed(&self, partition: &PartitionId) -> Option<i64> {
        self.committed.lock().unwrap().get(partition).copied()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupMember for FakeMember {
    async fn next_event(&self) -> Result<GroupEvent, SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        let mut events = self.events.lock().await;
        match events.as_mut() {
            Some(rx) => rx.recv().await.unwrap_or(Err(SourceError::Closed)),
            None => Err(SourceError::Closed),
        }
    }

    fn mark(&self, message: &RawMessage) -> Result<(), SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        let partition = message.partition_id().ok_or(SourceError::Transient("no partition".into()))?;
        let offset = message.offset().unwrap_or_default();
        if !self.is_assigned(&partition) {
            return Err(SourceError::NotAssigned(partition));
        }
        self.marks.lock().unwrap().push((partition.clone(), offset));
        let mut committed = self.committed.lock().unwrap();
        let next = committed.entry(partition).or_insert(0);
        *next = (*next).max(offset + 1);
        Ok(())
    }

    fn is_assigned(&self, partition: &PartitionId) -> bool {
        self.assigned.lock().unwrap().contains(partition)
    }

    fn close(&self) -> Result<(), SourceError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Ends a pending `next_event` once the queue is drained.
            self.tx.lock().unwrap().take();
        }
        Ok(())
    }
}

// ---------------- Handlers ----------------

/// Wraps a handler and records, for each call, which offsets of the
/// member were already acknowledged when the call began.
pub struct AckTrackingHandler<H> {
    inner: H,
    member: Arc<FakeMember>,
    seen: Mutex<Vec<(i64, Vec<i64>)>>,
}

impl<H: MessageHandler> AckTrackingHandler<H> {
    pub fn new(inner: H, member: Arc<FakeMember>) -> Self {
        Self { inner, member, seen: Mutex::new(Vec::new()) }
    }

    pub fn seen(&self) -> Vec<(i64, Vec<i64>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for AckTrackingHandler<H> {
    async fn handle(&self, message: &RawMessage) -> Result<(), HandlerError> {
        let offset = message.offset().unwrap_or_default();
        self.seen.lock().unwrap().push((offset, self.member.marked_offsets()));
        self.inner.handle(message).await
    }
}

/// Handler that parks inside every call until released.
#[derive(Default)]
pub struct ParkedHandler {
    pub entered: Notify,
    pub release: Notify,
    calls: AtomicUsize,
}

impl ParkedHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for ParkedHandler {
    async fn handle(&self, _message: &RawMessage) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

// ---------------- Sinks ----------------

/// Sink whose `insert_many` parks until released, so a drain can be held
/// open while another instance ticks.
pub struct ParkedSink<S> {
    inner: S,
    pub entered: Notify,
    pub release: Notify,
}

impl<S: AuditSink> ParkedSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, entered: Notify::new(), release: Notify::new() }
    }
}

#[async_trait]
impl<S: AuditSink> AuditSink for ParkedSink<S> {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()> {
        self.inner.insert_one(record).await
    }

    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.insert_many(records).await
    }

    async fn close(&self) -> SinkResult<()> {
        self.inner.close().await
    }
}

pub fn payload(username: &str, timestamp: i64) -> Vec<u8> {
    encode(&record(username, timestamp))
}

// ---------------- Log capture ----------------

/// In-memory log sink for asserting on emitted warnings.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Installs a fmt subscriber writing here for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
