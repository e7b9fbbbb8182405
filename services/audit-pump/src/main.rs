use anyhow::{Context, Result};
use audit_pump::{
    create_shutdown_token, Drainer, PgAuditStore, Pump, PumpConfig, PumpMode, RedisAuditQueue, RedisLeaseService,
    ShutdownHooks,
};
use common_audit::{AuditSink, RetryingSink};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LEASE_PREFIX: &str = "audit-pump:lease";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PumpConfig::from_env()?;
    info!(mode = ?config.mode, omit_details = config.omit_details, table = %config.store.table, "starting audit pump");

    let store = PgAuditStore::connect(&config.store.database_url, &config.store.table, config.store.max_connections)
        .await?;
    let sink: Arc<dyn AuditSink> = Arc::new(RetryingSink::new(store, config.store.retry()));

    let pump: Arc<dyn Pump> = match config.mode {
        PumpMode::Redis => build_drainer(&config, Arc::clone(&sink)).await?,
        PumpMode::Kafka => build_collector(&config, Arc::clone(&sink))?,
    };

    let hooks = ShutdownHooks::new();
    {
        let pump = Arc::clone(&pump);
        hooks.register("pump", move || async move { pump.stop().await });
    }
    {
        let sink = Arc::clone(&sink);
        hooks.register("audit-store", move || async move { sink.close().await.map_err(anyhow::Error::from) });
    }

    let shutdown = create_shutdown_token();
    pump.start(shutdown.clone()).await;

    let failed = hooks.run().await;
    info!(failed, "audit pump exited");
    Ok(())
}

async fn build_drainer(config: &PumpConfig, sink: Arc<dyn AuditSink>) -> Result<Arc<dyn Pump>> {
    let redis = config.redis.as_ref().context("redis settings missing for PUMP_MODE=redis")?;
    let drainer_config = config.drainer_config().context("redis settings missing for PUMP_MODE=redis")?;
    let client = redis::Client::open(redis.url.as_str()).context("Failed to create Redis client")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("Failed to create Redis connection manager")?;
    let leases = Arc::new(RedisLeaseService::from_manager(manager.clone(), LEASE_PREFIX.to_string()));
    let queue = Arc::new(RedisAuditQueue::from_manager(manager));
    Ok(Arc::new(Drainer::new(leases, queue, sink, drainer_config)))
}

#[cfg(feature = "kafka")]
fn build_collector(config: &PumpConfig, sink: Arc<dyn AuditSink>) -> Result<Arc<dyn Pump>> {
    use audit_pump::source::kafka::KafkaGroupMember;
    use audit_pump::{Collector, GroupMember, RecordWriter};

    let members = KafkaGroupMember::join_pool(&config.kafka)?
        .into_iter()
        .map(|member| Arc::new(member) as Arc<dyn GroupMember>)
        .collect();
    info!(
        brokers = %config.kafka.brokers,
        group = %config.kafka.group_id,
        topic = %config.kafka.topic,
        pool = config.kafka.pool_size,
        "joined audit consumer group"
    );
    let handler = Arc::new(RecordWriter::new(sink, config.omit_details));
    Ok(Arc::new(Collector::new(members, handler)))
}

#[cfg(not(feature = "kafka"))]
fn build_collector(_config: &PumpConfig, _sink: Arc<dyn AuditSink>) -> Result<Arc<dyn Pump>> {
    anyhow::bail!("PUMP_MODE=kafka requires audit-pump built with the `kafka` feature")
}
