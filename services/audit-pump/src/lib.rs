pub mod collector;
pub mod config;
pub mod drainer;
pub mod handler;
pub mod lease;
pub mod pump;
pub mod shutdown;
pub mod source;
pub mod store;

// Re-export key types for the binary and tests
pub use crate::collector::{Collector, ReadyGate, SessionState};
pub use crate::config::{KafkaConfig, PumpConfig, PumpMode, RedisConfig, StoreConfig};
pub use crate::drainer::{Drainer, DrainerConfig, TickOutcome};
pub use crate::handler::{HandlerError, MessageHandler, RecordWriter};
pub use crate::lease::{InMemoryLeaseService, Lease, LeaseError, LeaseService, RedisLeaseService};
pub use crate::pump::Pump;
pub use crate::shutdown::{create_shutdown_token, ShutdownHooks};
pub use crate::source::{
    AtomicQueue, GroupEvent, GroupMember, InMemoryAuditQueue, PartitionId, RawMessage, RedisAuditQueue,
    SourceError, SourceIdentity,
};
pub use crate::store::PgAuditStore;
