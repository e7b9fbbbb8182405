use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Create a `CancellationToken` and spawn a task that cancels it on
/// SIGINT or SIGTERM.
pub fn create_shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        token_clone.cancel();
    });

    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

/// Cleanup steps run once, in registration order, when the process exits.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<(&'static str, Hook)>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: &'static str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, Box::new(move || Box::pin(hook()) as HookFuture)));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered hook. A failing hook is logged and the rest
    /// still run. Later calls find nothing left to run.
    pub async fn run(&self) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        let mut failed = 0;
        for (name, hook) in hooks {
            match hook().await {
                Ok(()) => info!(hook = name, "shutdown hook done"),
                Err(err) => {
                    failed += 1;
                    warn!(hook = name, error = %err, "shutdown hook failed");
                }
            }
        }
        failed
    }
}
