use crate::drainer::DrainerConfig;
use anyhow::{bail, Context, Result};
use common_audit::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// Lease-guarded polling drain of a Redis list.
    Redis,
    /// Consumer-group streaming from Kafka.
    Kafka,
}

impl FromStr for PumpMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "kafka" => Ok(Self::Kafka),
            other => bail!("unknown PUMP_MODE {other:?}; expected redis or kafka"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub table: String,
    pub max_connections: u32,
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl StoreConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig { max_retries: self.max_retries, timeout: Duration::from_secs(self.timeout_secs), ..RetryConfig::default() }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub queue_key: String,
    pub interval_secs: u64,
    pub lease_name: String,
    pub lease_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub from_beginning: bool,
    pub pool_size: usize,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub mode: PumpMode,
    pub omit_details: bool,
    pub store: StoreConfig,
    /// Present only in redis mode.
    pub redis: Option<RedisConfig>,
    pub kafka: KafkaConfig,
}

impl PumpConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let mode = match lookup("PUMP_MODE") {
            Some(value) => value.parse::<PumpMode>()?,
            None => PumpMode::Redis,
        };

        let store = StoreConfig {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            table: lookup("AUDIT_TABLE").unwrap_or_else(|| "authz_audit_logs".to_string()),
            max_connections: parsed("DATABASE_MAX_CONNECTIONS").unwrap_or(5).clamp(1, u32::MAX as u64) as u32,
            max_retries: parsed("STORE_MAX_RETRIES").unwrap_or(2) as usize,
            timeout_secs: parsed("STORE_TIMEOUT_SECONDS").unwrap_or(10).max(1),
        };

        let redis = match mode {
            PumpMode::Redis => Some(RedisConfig {
                url: lookup("REDIS_URL").context("REDIS_URL must be set when PUMP_MODE=redis")?,
                queue_key: lookup("AUDIT_QUEUE_KEY").unwrap_or_else(|| "iam-authz-audit".to_string()),
                interval_secs: parsed("PUMP_INTERVAL_SECONDS").unwrap_or(10).max(1),
                lease_name: lookup("PUMP_LEASE_NAME").unwrap_or_else(|| "pump-drain".to_string()),
                lease_ttl_secs: parsed("PUMP_LEASE_TTL_SECONDS").unwrap_or(60).max(1),
            }),
            PumpMode::Kafka => None,
        };

        let kafka = KafkaConfig {
            brokers: lookup("KAFKA_BOOTSTRAP").unwrap_or_else(|| "localhost:9092".to_string()),
            group_id: lookup("KAFKA_GROUP_ID").unwrap_or_else(|| "iam-pump".to_string()),
            topic: lookup("AUDIT_TOPIC").unwrap_or_else(|| "iam".to_string()),
            from_beginning: flag("KAFKA_FROM_BEGINNING", true),
            pool_size: parsed("KAFKA_POOL_SIZE").unwrap_or(10).max(1) as usize,
            session_timeout_ms: parsed("KAFKA_SESSION_TIMEOUT_MS").unwrap_or(10_000),
        };

        Ok(Self { mode, omit_details: flag("PUMP_OMIT_DETAILS", true), store, redis, kafka })
    }

    /// Drainer settings for redis mode. The lease must keep a tenth of its
    /// TTL (at least 100ms) in hand before the queue is cleared.
    pub fn drainer_config(&self) -> Option<DrainerConfig> {
        let redis = self.redis.as_ref()?;
        let lease_ttl = Duration::from_secs(redis.lease_ttl_secs);
        Some(DrainerConfig {
            queue_key: redis.queue_key.clone(),
            lease_name: redis.lease_name.clone(),
            lease_ttl,
            lease_margin: (lease_ttl / 10).max(Duration::from_millis(100)),
            interval: Duration::from_secs(redis.interval_secs),
            omit_details: self.omit_details,
        })
    }
}
