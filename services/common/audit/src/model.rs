use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One authorization decision as recorded by the authorization server.
///
/// Records carry no identity of their own; the same logical decision may be
/// delivered more than once and storage has to tolerate that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Decision time in epoch milliseconds.
    pub timestamp: i64,
    pub username: String,
    /// `allow` or `deny`.
    pub effect: String,
    pub conclusion: String,
    /// Serialized request descriptor.
    pub request: String,
    pub policies: String,
    pub deciders: String,
}

impl AuditRecord {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Copy of the record with the bulky policy/decider detail removed.
    pub fn without_details(&self) -> Self {
        Self { policies: String::new(), deciders: String::new(), ..self.clone() }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed audit record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
    #[error("audit store rejected write: {0}")]
    Rejected(String),
    #[error("audit store attempt timed out")]
    Timeout,
    #[error("audit store closed")]
    Closed,
}

pub type SinkResult<T> = Result<T, SinkError>;
