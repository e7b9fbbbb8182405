use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// An ingestion strategy. One is selected per deployment.
#[async_trait]
pub trait Pump: Send + Sync {
    /// Run until `cancel` fires or `stop` is called. Recoverable failures are
    /// logged inside; nothing surfaces from steady-state operation.
    async fn start(&self, cancel: CancellationToken);

    /// Stop the loop and release source resources. Safe to call more than
    /// once and while `start` is still delivering.
    async fn stop(&self) -> anyhow::Result<()>;
}
