//! Message source adapters: a consumer-group member over a partitioned log,
//! and an atomically drained list queue.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod queue;

pub use queue::{AtomicQueue, InMemoryAuditQueue, RedisAuditQueue};

#[derive(Debug, Error)]
pub enum SourceError {
    /// Coordinator unavailable, rebalance in progress, broker I/O. Retried.
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("partition {0} is not assigned to this member")]
    NotAssigned(PartitionId),
    #[error("source closed")]
    Closed,
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for SourceError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentity {
    Partition { topic: String, partition: i32, offset: i64 },
    Queue { key: String },
}

/// One unit of work as delivered by a source. Owned only until it has been
/// decoded and committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub identity: SourceIdentity,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn from_partition(topic: impl Into<String>, partition: i32, offset: i64, key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self { identity: SourceIdentity::Partition { topic: topic.into(), partition, offset }, key, payload }
    }

    pub fn partition_id(&self) -> Option<PartitionId> {
        match &self.identity {
            SourceIdentity::Partition { topic, partition, .. } => Some(PartitionId::new(topic.clone(), *partition)),
            SourceIdentity::Queue { .. } => None,
        }
    }

    pub fn offset(&self) -> Option<i64> {
        match self.identity {
            SourceIdentity::Partition { offset, .. } => Some(offset),
            SourceIdentity::Queue { .. } => None,
        }
    }
}

/// What a group member observes while its session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// The group settled and handed these partitions to this member. An empty
    /// list still means the pool is stable.
    Assigned(Vec<PartitionId>),
    /// These partitions are being taken away. The member only proceeds with
    /// the revocation once this event has been fully processed.
    Revoked(Vec<PartitionId>),
    Record(RawMessage),
}

/// One member of a consumer group, owned by one collector worker.
///
/// `next_event` delivers rebalances and records strictly in the order the
/// protocol produced them; `mark` acknowledges a record on the current
/// session. Both are driven from the same worker task.
#[async_trait]
pub trait GroupMember: Send + Sync {
    async fn next_event(&self) -> Result<GroupEvent, SourceError>;

    fn mark(&self, message: &RawMessage) -> Result<(), SourceError>;

    /// Whether the member's live session still owns the partition.
    fn is_assigned(&self, partition: &PartitionId) -> bool;

    /// Leave the group and release broker-side resources. Idempotent.
    fn close(&self) -> Result<(), SourceError>;
}
