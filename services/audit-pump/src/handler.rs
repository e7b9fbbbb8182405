use crate::source::RawMessage;
use async_trait::async_trait;
use common_audit::{decode, AuditSink, SinkError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Per-record callback run by a collector worker.
///
/// `Ok` lets the worker acknowledge the record; `Err` leaves it
/// unacknowledged so the source redelivers it. Keep it well under the
/// group's session timeout.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &RawMessage) -> Result<(), HandlerError>;
}

/// Decodes each record and writes it on its own.
pub struct RecordWriter {
    sink: Arc<dyn AuditSink>,
    omit_details: bool,
}

impl RecordWriter {
    pub fn new(sink: Arc<dyn AuditSink>, omit_details: bool) -> Self {
        Self { sink, omit_details }
    }
}

#[async_trait]
impl MessageHandler for RecordWriter {
    async fn handle(&self, message: &RawMessage) -> Result<(), HandlerError> {
        let record = match decode(&message.payload) {
            Ok(record) => record,
            Err(err) => {
                // Redelivery cannot fix a malformed payload, so it is consumed.
                warn!(identity = ?message.identity, error = %err, "dropping undecodable audit message");
                return Ok(());
            }
        };
        let record = if self.omit_details { record.without_details() } else { record };
        self.sink.insert_one(&record).await?;
        debug!(identity = ?message.identity, username = %record.username, "audit record stored");
        Ok(())
    }
}
