pub mod codec;
pub mod model;
pub mod retry;
pub mod sink;

pub use codec::{decode, decode_batch, encode};
pub use model::{AuditRecord, DecodeError, SinkError, SinkResult};
pub use retry::{retry_with_backoff, RetryConfig, RetryingSink};
pub use sink::{AuditSink, InMemoryAuditSink};
