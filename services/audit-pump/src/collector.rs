//! Consumer-group collector.
//!
//! Each pool slot gets its own [`GroupMember`] and its own worker task. A
//! worker handles a record and acknowledges it on the same task, in partition
//! order, and only after the handler succeeded. Rebalance events arrive
//! through the same `next_event` stream as records, so a handler call is
//! always finished before the revocation that follows it is processed.

use crate::handler::MessageHandler;
use crate::pump::Pump;
use crate::source::{GroupEvent, GroupMember, PartitionId, RawMessage, SourceError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Stable,
    Rebalancing,
    Revoked,
    Closed,
}

impl SessionState {
    pub fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Joining)
                | (Joining, Stable)
                | (Stable, Stable)
                | (Joining, Rebalancing)
                | (Stable, Rebalancing)
                | (Rebalancing, Revoked)
                | (Revoked, Joining)
                | (_, Closed)
        )
    }
}

/// Start-up barrier for the whole pool: opened by the first worker that
/// receives an assignment, reset by any worker that loses partitions.
///
/// Under the eager assignment protocol every member is revoked in the same
/// rebalance, so a reset means the pool as a whole is rejoining.
#[derive(Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once open.
        let _ = rx.wait_for(|open| *open).await;
    }
}

pub struct Collector {
    members: Vec<Arc<dyn GroupMember>>,
    handler: Arc<dyn MessageHandler>,
    gate: ReadyGate,
    state: Arc<watch::Sender<SessionState>>,
    stop: CancellationToken,
    closed: AtomicBool,
    rejoin_backoff: Duration,
}

impl Collector {
    pub fn new(members: Vec<Arc<dyn GroupMember>>, handler: Arc<dyn MessageHandler>) -> Self {
        let (state, _rx) = watch::channel(SessionState::Idle);
        Self {
            members,
            handler,
            gate: ReadyGate::new(),
            state: Arc::new(state),
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            rejoin_backoff: Duration::from_secs(1),
        }
    }

    /// Pause between a failed consume call and the next attempt.
    pub fn with_rejoin_backoff(mut self, backoff: Duration) -> Self {
        self.rejoin_backoff = backoff;
        self
    }

    pub fn ready_gate(&self) -> &ReadyGate {
        &self.gate
    }

    /// Most recent transition made by any worker. This is a pool-level view,
    /// not the state of a particular member.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn pool_size(&self) -> usize {
        self.members.len()
    }
}

#[async_trait]
impl Pump for Collector {
    async fn start(&self, cancel: CancellationToken) {
        if self.members.is_empty() {
            warn!("collector has no group members; nothing to consume");
            return;
        }

        let mut workers = JoinSet::new();
        for (id, member) in self.members.iter().enumerate() {
            let worker = Worker {
                id,
                member: Arc::clone(member),
                handler: Arc::clone(&self.handler),
                gate: self.gate.clone(),
                state: Arc::clone(&self.state),
                cancel: cancel.clone(),
                stop: self.stop.clone(),
                rejoin_backoff: self.rejoin_backoff,
            };
            workers.spawn(worker.run());
        }

        let ready = self.gate.wait();
        tokio::pin!(ready);
        let mut announced = false;
        loop {
            tokio::select! {
                _ = &mut ready, if !announced => {
                    announced = true;
                    info!(pool = self.members.len(), "audit consumers are up and running");
                }
                joined = workers.join_next() => match joined {
                    Some(Err(err)) => error!(?err, "collector worker aborted"),
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }
        info!("audit collector stopped");
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();
        let mut first_err: Option<SourceError> = None;
        for (id, member) in self.members.iter().enumerate() {
            if let Err(err) = member.close() {
                warn!(worker = id, error = %err, "failed to close consumer group member");
                first_err.get_or_insert(err);
            }
        }
        self.state.send_replace(SessionState::Closed);
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

struct Worker {
    id: usize,
    member: Arc<dyn GroupMember>,
    handler: Arc<dyn MessageHandler>,
    gate: ReadyGate,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    stop: CancellationToken,
    rejoin_backoff: Duration,
}

/// Claims held by one worker in its current session.
struct Session {
    state: SessionState,
    owned: HashSet<PartitionId>,
    /// Partitions with a record that failed to store. Later records there are
    /// still written but not acknowledged, so the committed position stays in
    /// front of the failed one until the partition changes hands.
    pinned: HashSet<PartitionId>,
}

impl Worker {
    async fn run(self) {
        let mut session = Session { state: SessionState::Idle, owned: HashSet::new(), pinned: HashSet::new() };
        self.advance(&mut session, SessionState::Joining);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                event = self.member.next_event() => event,
            };

            match event {
                Ok(GroupEvent::Assigned(partitions)) => self.on_assigned(&mut session, partitions),
                Ok(GroupEvent::Revoked(partitions)) => self.on_revoked(&mut session, partitions),
                Ok(GroupEvent::Record(message)) => self.on_record(&mut session, message).await,
                Err(SourceError::Closed) => break,
                Err(err) => {
                    warn!(worker = self.id, error = %err, "consumer group error; retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.rejoin_backoff) => {}
                    }
                }
            }
        }

        self.advance(&mut session, SessionState::Closed);
        debug!(worker = self.id, "collector worker exited");
    }

    fn advance(&self, session: &mut Session, next: SessionState) {
        if !session.state.can_move_to(next) {
            debug!(worker = self.id, from = ?session.state, to = ?next, "unexpected session transition");
        }
        session.state = next;
        self.state.send_replace(next);
    }

    fn on_assigned(&self, session: &mut Session, partitions: Vec<PartitionId>) {
        info!(worker = self.id, assigned = ?partitions, "partitions assigned");
        session.owned.extend(partitions);
        self.advance(session, SessionState::Stable);
        self.gate.open();
    }

    fn on_revoked(&self, session: &mut Session, partitions: Vec<PartitionId>) {
        self.advance(session, SessionState::Rebalancing);
        for partition in &partitions {
            session.owned.remove(partition);
            session.pinned.remove(partition);
        }
        info!(worker = self.id, revoked = ?partitions, "partitions revoked");
        self.advance(session, SessionState::Revoked);
        self.gate.reset();
        self.advance(session, SessionState::Joining);
    }

    async fn on_record(&self, session: &mut Session, message: RawMessage) {
        let Some(partition) = message.partition_id() else {
            warn!(worker = self.id, identity = ?message.identity, "non-partitioned message on a group member; ignoring");
            return;
        };
        if !session.owned.contains(&partition) {
            if !self.member.is_assigned(&partition) {
                // Left unacknowledged; the current owner reads it again.
                debug!(worker = self.id, %partition, "record for a partition this worker does not own; skipping");
                return;
            }
            // The record overtook its assignment event.
            debug!(worker = self.id, %partition, "adopting partition ahead of its assignment event");
            self.on_assigned(session, vec![partition.clone()]);
        }

        debug!(
            worker = self.id,
            topic = %partition.topic,
            partition = partition.partition,
            offset = ?message.offset(),
            key = %String::from_utf8_lossy(message.key.as_deref().unwrap_or_default()),
            "consume message"
        );

        match self.handler.handle(&message).await {
            Ok(()) => self.acknowledge(session, &partition, &message),
            Err(err) => {
                warn!(
                    worker = self.id,
                    %partition,
                    offset = ?message.offset(),
                    error = %err,
                    "audit message not stored; leaving it unacknowledged for redelivery"
                );
                session.pinned.insert(partition);
            }
        }
    }

    fn acknowledge(&self, session: &Session, partition: &PartitionId, message: &RawMessage) {
        if session.pinned.contains(partition) {
            debug!(worker = self.id, %partition, "partition holds an unstored message; not acknowledging");
            return;
        }
        // The claim may have been revoked while the handler ran.
        if !session.owned.contains(partition) || !self.member.is_assigned(partition) {
            debug!(worker = self.id, %partition, "partition no longer owned; not acknowledging");
            return;
        }
        if let Err(err) = self.member.mark(message) {
            warn!(worker = self.id, %partition, error = %err, "failed to acknowledge audit message");
        }
    }
}
