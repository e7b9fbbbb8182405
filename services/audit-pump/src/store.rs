use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use common_audit::{AuditRecord, AuditSink, SinkError, SinkResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

// Postgres caps a statement at 65535 bind parameters; 8 per row.
const MAX_ROWS_PER_STATEMENT: usize = 4096;

/// Postgres-backed audit store.
pub struct PgAuditStore {
    pool: PgPool,
    table: String,
    closed: AtomicBool,
}

impl PgAuditStore {
    pub async fn connect(database_url: &str, table: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("failed to connect to audit database")?;
        let store = Self::from_pool(pool, table)?;
        store.ensure_table().await?;
        info!(table = %store.table, "audit store ready");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        if !is_plain_identifier(table) {
            bail!("invalid audit table name {table:?}");
        }
        Ok(Self { pool, table: table.to_string(), closed: AtomicBool::new(false) })
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                \"timestamp\" BIGINT NOT NULL,
                occurred_at TIMESTAMPTZ NULL,
                username TEXT NOT NULL,
                effect TEXT NOT NULL,
                conclusion TEXT NOT NULL,
                request TEXT NOT NULL,
                policies TEXT NOT NULL,
                deciders TEXT NOT NULL
            )",
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create audit table {}", self.table))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_open(&self) -> SinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn insert_prefix(&self) -> String {
        format!(
            "INSERT INTO {} (\"timestamp\", occurred_at, username, effect, conclusion, request, policies, deciders) ",
            self.table
        )
    }
}

#[async_trait]
impl AuditSink for PgAuditStore {
    async fn insert_one(&self, record: &AuditRecord) -> SinkResult<()> {
        self.insert_many(std::slice::from_ref(record)).await
    }

    async fn insert_many(&self, records: &[AuditRecord]) -> SinkResult<()> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(sink_error)?;
        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(self.insert_prefix());
            query.push_values(chunk, |mut row, record| {
                row.push_bind(record.timestamp)
                    .push_bind(record.occurred_at())
                    .push_bind(record.username.as_str())
                    .push_bind(record.effect.as_str())
                    .push_bind(record.conclusion.as_str())
                    .push_bind(record.request.as_str())
                    .push_bind(record.policies.as_str())
                    .push_bind(record.deciders.as_str());
            });
            query.build().execute(&mut *tx).await.map_err(sink_error)?;
        }
        tx.commit().await.map_err(sink_error)?;
        debug!(rows = records.len(), table = %self.table, "audit rows inserted");
        Ok(())
    }

    async fn close(&self) -> SinkResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.close().await;
        info!(table = %self.table, "audit store closed");
        Ok(())
    }
}

fn sink_error(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::PoolClosed => SinkError::Closed,
        sqlx::Error::Database(db) => SinkError::Rejected(db.to_string()),
        rejected @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. }) => {
            SinkError::Rejected(rejected.to_string())
        }
        other => SinkError::Unavailable(other.to_string()),
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}
