//! Postgres-backed counter buckets for multi-process deployments. The
//! upsert keeps the increment atomic; expired rows are filtered on read and
//! removed by `purge_expired`, which the cleanup loop calls periodically.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crawlgrid_core::StoreError;

use crate::CounterStore;

pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("connected to postgres rate-limit coordinator");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../migrations/001_rate_buckets.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_buckets WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn incr(&self, domain: &str, bucket: i64, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO rate_buckets (domain, bucket, count, expires_at)
               VALUES ($1, $2, 1, NOW() + ($3 * INTERVAL '1 second'))
               ON CONFLICT (domain, bucket)
               DO UPDATE SET count = rate_buckets.count + 1"#,
        )
        .bind(domain)
        .bind(bucket)
        .bind(ttl.as_secs() as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn window_counts(
        &self,
        domain: &str,
        newest: i64,
        n: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let oldest = newest - (n as i64 - 1);
        let rows = sqlx::query(
            r#"SELECT bucket, count FROM rate_buckets
               WHERE domain = $1 AND bucket BETWEEN $2 AND $3 AND expires_at > NOW()"#,
        )
        .bind(domain)
        .bind(oldest)
        .bind(newest)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut out = vec![0u64; n];
        for row in rows {
            let bucket: i64 = row
                .try_get("bucket")
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let count: i32 = row
                .try_get("count")
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let idx = (bucket - oldest) as usize;
            if idx < n {
                out[idx] = count as u64;
            }
        }
        Ok(out)
    }
}
