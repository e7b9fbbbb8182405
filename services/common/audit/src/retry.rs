use crate::{AuditRecord, AuditSink, SinkError, SinkResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry policy for store calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Delay before each retry; the last entry repeats when the schedule is
    /// shorter than `max_retries`.
    pub backoff_schedule: Vec<Duration>,
    /// Timeout per individual attempt.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_schedule: vec![Duration::from_millis(200), Duration::from_secs(1)],
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn none(timeout: Duration) -> Self {
        Self { max_retries: 0, backoff_schedule: Vec::new(), timeout }
    }

    fn backoff_for(&self, attempt: usize) -> Duration {
        self.backoff_schedule
            .get(attempt)
            .or_else(|| self.backoff_schedule.last())
            .copied()
            .unwrap_or(Duration::from_millis(200))
    }
}

/// Run `f` up to `1 + max_retries` times. `Closed` is terminal and returned
/// immediately.
pub async fn retry_with_backoff<F, Fut>(config: &RetryConfig, op: &'static str, mut f: F) -> SinkResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SinkResult<()>>,
{
    let mut last_error = SinkError::Timeout;
    for attempt in 0..=config.max_retries {
        match tokio::time::timeout(config.timeout, f()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(SinkError::Closed)) => return Err(SinkError::Closed),
            Ok(Err(err)) => last_error = err,
            Err(_elapsed) => last_error = SinkError::Timeout,
        }
        if attempt < config.max_retries {
            let delay = config.backoff_for(attempt);
            warn!(op, attempt, error = %last_error, ?delay, "audit store call failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }
    Err(last_error)
}

/// Decorates a sink with bounded per-call retries. Once the budget is spent
/// the error goes back to the caller, which drops the batch.
pub struct RetryingSink<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: AuditSink> RetryingSink<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: AuditSink> AuditSink for RetryingSink<S> {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()> {
        retry_with_backoff(&self.config, "insert_one", || self.inner.insert_one(record)).await
    }

    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        retry_with_backoff(&self.config, "insert_many", || self.inner.insert_many(records)).await
    }

    async fn close(&self) -> SinkResult<()> {
        self.inner.close().await
    }
}
