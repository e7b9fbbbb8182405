use super::{GroupEvent, GroupMember, PartitionId, RawMessage, SourceError};
use crate::config::KafkaConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientContext, TopicPartitionList};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Routes rebalance callbacks into the member's event stream.
///
/// librdkafka runs these callbacks while the consumer is being polled, i.e.
/// inside `next_event`, so they never overlap a handler call on the same
/// worker.
struct GroupContext {
    worker: usize,
    events: mpsc::UnboundedSender<GroupEvent>,
    assigned: Mutex<HashSet<PartitionId>>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            {
                let mut assigned = self.assigned.lock().unwrap_or_else(PoisonError::into_inner);
                for p in &partitions {
                    assigned.remove(p);
                }
            }
            debug!(worker = self.worker, revoked = ?partitions, "kafka revoke");
            let _ = self.events.send(GroupEvent::Revoked(partitions));
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                self.assigned
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(partitions.iter().cloned());
                debug!(worker = self.worker, assigned = ?partitions, "kafka assign");
                let _ = self.events.send(GroupEvent::Assigned(partitions));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => warn!(worker = self.worker, ?err, "kafka rebalance error"),
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<PartitionId> {
    tpl.elements().iter().map(|e| PartitionId::new(e.topic(), e.partition())).collect()
}

/// One consumer in the audit consumer group.
pub struct KafkaGroupMember {
    consumer: StreamConsumer<GroupContext>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    /// Record fetched in the same poll that queued a rebalance event; it is
    /// handed out right after that event.
    held: Mutex<Option<RawMessage>>,
    closed: AtomicBool,
}

impl KafkaGroupMember {
    pub fn join(config: &KafkaConfig, worker: usize) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = GroupContext { worker, events: tx, assigned: Mutex::new(HashSet::new()) };
        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", format!("{}-{}", config.group_id, worker))
            .set("enable.partition.eof", "false")
            // Offsets are stored only after a record was written, then
            // committed in the background.
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", if config.from_beginning { "earliest" } else { "latest" })
            .set("partition.assignment.strategy", "roundrobin")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create_with_context(context)
            .context("failed to create kafka consumer")?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("failed to subscribe to topic {}", config.topic))?;
        Ok(Self {
            consumer,
            events: tokio::sync::Mutex::new(rx),
            held: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// One member per pool slot, all in the same group.
    pub fn join_pool(config: &KafkaConfig) -> Result<Vec<Self>> {
        (0..config.pool_size).map(|worker| Self::join(config, worker)).collect()
    }
}

#[async_trait]
impl GroupMember for KafkaGroupMember {
    async fn next_event(&self) -> Result<GroupEvent, SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        let mut events = self.events.lock().await;
        if let Ok(event) = events.try_recv() {
            return Ok(event);
        }
        if let Some(message) = self.held.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Ok(GroupEvent::Record(message));
        }
        tokio::select! {
            biased;
            Some(event) = events.recv() => Ok(event),
            received = self.consumer.recv() => {
                let message = received.map_err(|e| SourceError::Transient(e.to_string()))?;
                let message = RawMessage::from_partition(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                    message.key().map(<[u8]>::to_vec),
                    message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                );
                // Rebalance callbacks run inside this poll; their events go
                // out before the record they raced with.
                match events.try_recv() {
                    Ok(event) => {
                        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
                        Ok(event)
                    }
                    Err(_) => Ok(GroupEvent::Record(message)),
                }
            }
        }
    }

    fn mark(&self, message: &RawMessage) -> Result<(), SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }
        let (Some(partition), Some(offset)) = (message.partition_id(), message.offset()) else {
            return Err(SourceError::Transient("message has no partition identity".into()));
        };
        if !self.is_assigned(&partition) {
            return Err(SourceError::NotAssigned(partition));
        }
        // The stored offset is the next one to read.
        self.consumer
            .store_offset(&partition.topic, partition.partition, offset + 1)
            .map_err(|e| SourceError::Transient(e.to_string()))
    }

    fn is_assigned(&self, partition: &PartitionId) -> bool {
        self.consumer
            .context()
            .assigned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(partition)
    }

    fn close(&self) -> Result<(), SourceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Leaves the group; the consumer handle itself is released on drop.
        self.consumer.unsubscribe();
        Ok(())
    }
}
