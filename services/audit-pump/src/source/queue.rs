use super::SourceError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// List-backed queue whose read and clear happen as one step: a payload is
/// returned by at most one `drain_all`.
#[async_trait]
pub trait AtomicQueue: Send + Sync {
    async fn drain_all(&self, key: &str) -> Result<Vec<Vec<u8>>, SourceError>;
    async fn push(&self, key: &str, payload: &[u8]) -> Result<(), SourceError>;
}

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisAuditQueue {
    manager: ConnectionManager,
}

impl RedisAuditQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AtomicQueue for RedisAuditQueue {
    async fn drain_all(&self, key: &str) -> Result<Vec<Vec<u8>>, SourceError> {
        let mut conn = self.manager.clone();
        // MULTI / LRANGE 0 -1 / DEL / EXEC
        let (payloads, _removed): (Vec<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .query_async(&mut conn)
            .await?;
        Ok(payloads)
    }

    async fn push(&self, key: &str, payload: &[u8]) -> Result<(), SourceError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.rpush(key, payload).await?;
        Ok(())
    }
}

// ---------------- In-Memory Implementation (Tests) ----------------

#[derive(Clone, Default)]
pub struct InMemoryAuditQueue {
    inner: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl InMemoryAuditQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, key: &str) -> usize {
        self.inner.lock().await.get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl AtomicQueue for InMemoryAuditQueue {
    async fn drain_all(&self, key: &str) -> Result<Vec<Vec<u8>>, SourceError> {
        let mut guard = self.inner.lock().await;
        Ok(guard.remove(key).unwrap_or_default())
    }

    async fn push(&self, key: &str, payload: &[u8]) -> Result<(), SourceError> {
        let mut guard = self.inner.lock().await;
        guard.entry(key.to_string()).or_default().push(payload.to_vec());
        Ok(())
    }
}
