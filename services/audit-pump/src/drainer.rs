use crate::lease::{Lease, LeaseService};
use crate::pump::Pump;
use crate::source::AtomicQueue;
use async_trait::async_trait;
use common_audit::{decode_batch, AuditSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DrainerConfig {
    pub queue_key: String,
    pub lease_name: String,
    pub lease_ttl: Duration,
    /// Minimum lease time that must remain before the queue is cleared.
    pub lease_margin: Duration,
    pub interval: Duration,
    pub omit_details: bool,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance holds the lease.
    Busy,
    /// The lock service could not be reached; treated like `Busy`.
    LockUnavailable,
    /// The lease was already too close to expiry to drain safely.
    LeaseExpiring,
    DrainFailed,
    Stored { stored: usize, dropped: usize },
    /// The snapshot left the queue but the store refused it.
    StoreFailed { lost: usize, dropped: usize },
}

/// Lease-guarded batch pump: on every tick, become the only drainer
/// cluster-wide and move the whole queue to storage in one write.
pub struct Drainer {
    leases: Arc<dyn LeaseService>,
    queue: Arc<dyn AtomicQueue>,
    sink: Arc<dyn AuditSink>,
    config: DrainerConfig,
    stop: CancellationToken,
}

impl Drainer {
    pub fn new(
        leases: Arc<dyn LeaseService>,
        queue: Arc<dyn AtomicQueue>,
        sink: Arc<dyn AuditSink>,
        config: DrainerConfig,
    ) -> Self {
        Self { leases, queue, sink, config, stop: CancellationToken::new() }
    }

    pub fn config(&self) -> &DrainerConfig {
        &self.config
    }

    pub async fn tick(&self) -> TickOutcome {
        let lease = match self.leases.try_acquire(&self.config.lease_name, self.config.lease_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(lease = %self.config.lease_name, "drain lease held by another instance; skipping tick");
                return TickOutcome::Busy;
            }
            Err(err) => {
                warn!(error = %err, lease = %self.config.lease_name, "could not acquire drain lease; skipping tick");
                return TickOutcome::LockUnavailable;
            }
        };

        let outcome = self.drain_under(&lease).await;

        if let Err(err) = self.leases.release(&lease).await {
            warn!(error = %err, lease = %lease.name, "failed to release drain lease; leaving it to expire");
        }
        outcome
    }

    async fn drain_under(&self, lease: &Lease) -> TickOutcome {
        // Clearing the queue is the destructive step; never do it on a lease
        // that may already belong to someone else.
        if !lease.holds_for(self.config.lease_margin) {
            warn!(lease = %lease.name, remaining = ?lease.remaining(), "drain lease too close to expiry; skipping drain");
            return TickOutcome::LeaseExpiring;
        }

        let payloads = match self.queue.drain_all(&self.config.queue_key).await {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(error = %err, queue = %self.config.queue_key, "failed to drain audit queue");
                return TickOutcome::DrainFailed;
            }
        };

        let total = payloads.len();
        let (mut records, dropped) = decode_batch(payloads);
        if self.config.omit_details {
            records = records.iter().map(|r| r.without_details()).collect();
        }

        if records.is_empty() {
            debug!(total, dropped, "nothing to store this tick");
            return TickOutcome::Stored { stored: 0, dropped };
        }

        match self.sink.insert_many(&records).await {
            Ok(()) => {
                info!(stored = records.len(), dropped, "audit batch stored");
                TickOutcome::Stored { stored: records.len(), dropped }
            }
            Err(err) => {
                // The queue is already cleared: this batch is lost, and only this one.
                error!(error = %err, lost = records.len(), dropped, "failed to store audit batch");
                TickOutcome::StoreFailed { lost: records.len(), dropped }
            }
        }
    }
}

#[async_trait]
impl Pump for Drainer {
    async fn start(&self, cancel: CancellationToken) {
        info!(
            queue = %self.config.queue_key,
            interval = ?self.config.interval,
            lease_ttl = ?self.config.lease_ttl,
            "audit drainer started"
        );
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!("audit drainer stopped");
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stop.cancel();
        Ok(())
    }
}
