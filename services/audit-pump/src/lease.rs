use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use redis::aio::ConnectionManager;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lock service error: {0}")]
    Backend(String),
    #[error("lease '{0}' is no longer held by this instance")]
    NotHolder(String),
}

impl From<redis::RedisError> for LeaseError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Time-bounded exclusive ownership of a named resource.
///
/// `expires_at` is measured from just before the acquire request went out,
/// so the local view never outlives the lock service's.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub token: String,
    pub expires_at: Instant,
}

impl Lease {
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// True while at least `margin` of the lease is left.
    pub fn holds_for(&self, margin: Duration) -> bool {
        self.remaining() > margin
    }
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// `Ok(None)` when another holder is active.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError>;
    /// Only the token holder can release; anything else is `NotHolder`.
    async fn release(&self, lease: &Lease) -> Result<(), LeaseError>;
}

// ---------------- Redis Implementation ----------------

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLeaseService {
    manager: ConnectionManager,
    prefix: String,
    release: redis::Script,
}

impl RedisLeaseService {
    pub async fn connect(redis_url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self::from_manager(manager, prefix))
    }

    pub fn from_manager(manager: ConnectionManager, prefix: String) -> Self {
        Self { manager, prefix, release: redis::Script::new(RELEASE_SCRIPT) }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }
}

#[async_trait]
impl LeaseService for RedisLeaseService {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut conn = self.manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| Lease { name: name.to_string(), token, expires_at: started + ttl }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .release
            .key(self.key(&lease.name))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(LeaseError::NotHolder(lease.name.clone()));
        }
        Ok(())
    }
}

// ---------------- In-Memory Implementation (Tests) ----------------

#[derive(Clone, Default)]
pub struct InMemoryLeaseService {
    inner: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self, name: &str) -> Option<String> {
        let guard = self.inner.lock().await;
        guard
            .get(name)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LeaseError> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        if let Some((_, expiry)) = guard.get(name) {
            if *expiry > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        let expires_at = now + ttl;
        guard.insert(name.to_string(), (token.clone(), expires_at));
        Ok(Some(Lease { name: name.to_string(), token, expires_at }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut guard = self.inner.lock().await;
        match guard.get(&lease.name) {
            Some((token, _)) if *token == lease.token => {
                guard.remove(&lease.name);
                Ok(())
            }
            _ => Err(LeaseError::NotHolder(lease.name.clone())),
        }
    }
}
