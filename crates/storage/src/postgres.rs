//! Postgres-backed state store for shared deployments.
//!
//! Conditional updates are compare-and-swap on a `version` column: read the
//! row, evaluate the predicate in process, then `UPDATE … WHERE url_hash =
//! $1 AND version = $n`. A losing writer re-reads and re-evaluates, so the
//! predicate is always judged against the row that actually gets replaced.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crawlgrid_core::{StoreError, UrlRecord, UrlState};

use crate::{RecordUpdate, StateStore, UpdateCondition};

/// Bounded CAS retries before reporting contention as unavailability.
const MAX_CAS_ATTEMPTS: u32 = 8;

pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(to_store_error)?;
        info!(max_connections, "connected to postgres state store");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../migrations/001_url_states.sql"))
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        info!("state store migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_with_version(
        &self,
        url_hash: &str,
    ) -> Result<Option<(UrlRecord, i64)>, StoreError> {
        let row = sqlx::query("SELECT * FROM url_states WHERE url_hash = $1")
            .bind(url_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_store_error)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let version: i64 = row.try_get("version").map_err(to_store_error)?;
                Ok(Some((row_to_record(&row)?, version)))
            }
        }
    }
}

fn to_store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolTimedOut => StoreError::Throttled,
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn row_to_record(row: &PgRow) -> Result<UrlRecord, StoreError> {
    let state_str: String = row.try_get("state").map_err(to_store_error)?;
    let state = UrlState::parse(&state_str)
        .ok_or_else(|| StoreError::Unavailable(format!("unknown state in row: {state_str}")))?;
    Ok(UrlRecord {
        url_hash: row.try_get("url_hash").map_err(to_store_error)?,
        url: row.try_get("url").map_err(to_store_error)?,
        domain: row.try_get("domain").map_err(to_store_error)?,
        state,
        lease_holder: row.try_get("lease_holder").map_err(to_store_error)?,
        lease_acquired_at: row.try_get("lease_acquired_at").map_err(to_store_error)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(to_store_error)?,
        last_crawled_at: row.try_get("last_crawled_at").map_err(to_store_error)?,
        raw_blob_key: row.try_get("raw_blob_key").map_err(to_store_error)?,
        parsed_blob_key: row.try_get("parsed_blob_key").map_err(to_store_error)?,
        retry_count: row
            .try_get::<i32, _>("retry_count")
            .map_err(to_store_error)? as u32,
        last_error: row.try_get("last_error").map_err(to_store_error)?,
        next_eligible_at: row.try_get("next_eligible_at").map_err(to_store_error)?,
        created_at: row.try_get("created_at").map_err(to_store_error)?,
        updated_at: row.try_get("updated_at").map_err(to_store_error)?,
    })
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, StoreError> {
        Ok(self.fetch_with_version(url_hash).await?.map(|(r, _)| r))
    }

    async fn put_if_absent(&self, record: &UrlRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO url_states
               (url_hash, url, domain, state, lease_holder, lease_acquired_at,
                lease_expires_at, last_crawled_at, raw_blob_key, parsed_blob_key,
                retry_count, last_error, next_eligible_at, created_at, updated_at, version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 0)
               ON CONFLICT (url_hash) DO NOTHING"#,
        )
        .bind(&record.url_hash)
        .bind(&record.url)
        .bind(&record.domain)
        .bind(record.state.as_str())
        .bind(&record.lease_holder)
        .bind(record.lease_acquired_at)
        .bind(record.lease_expires_at)
        .bind(record.last_crawled_at)
        .bind(&record.raw_blob_key)
        .bind(&record.parsed_blob_key)
        .bind(record.retry_count as i32)
        .bind(&record.last_error)
        .bind(record.next_eligible_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_if(
        &self,
        url_hash: &str,
        update: RecordUpdate,
        condition: UpdateCondition,
    ) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((mut record, version)) = self.fetch_with_version(url_hash).await? else {
                return Err(StoreError::NotFound);
            };
            if !condition.matches(&record) {
                return Err(StoreError::Conflict);
            }
            update.apply(&mut record, Utc::now());

            let result = sqlx::query(
                r#"UPDATE url_states SET
                     state = $2, lease_holder = $3, lease_acquired_at = $4,
                     lease_expires_at = $5, last_crawled_at = $6, raw_blob_key = $7,
                     parsed_blob_key = $8, retry_count = $9, last_error = $10,
                     next_eligible_at = $11, updated_at = $12, version = version + 1
                   WHERE url_hash = $1 AND version = $13"#,
            )
            .bind(url_hash)
            .bind(record.state.as_str())
            .bind(&record.lease_holder)
            .bind(record.lease_acquired_at)
            .bind(record.lease_expires_at)
            .bind(record.last_crawled_at)
            .bind(&record.raw_blob_key)
            .bind(&record.parsed_blob_key)
            .bind(record.retry_count as i32)
            .bind(&record.last_error)
            .bind(record.next_eligible_at)
            .bind(record.updated_at)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;

            if result.rows_affected() == 1 {
                return Ok(());
            }
            // lost the swap to another writer: re-read and re-judge
        }
        Err(StoreError::Unavailable(format!(
            "conditional update contention on {url_hash}"
        )))
    }

    async fn query_by_domain_state(
        &self,
        domain: &str,
        state: UrlState,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM url_states WHERE domain = $1 AND state = $2 LIMIT $3",
        )
        .bind(domain)
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn batch_get(
        &self,
        url_hashes: &[String],
    ) -> Result<HashMap<String, UrlRecord>, StoreError> {
        if url_hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query("SELECT * FROM url_states WHERE url_hash = ANY($1)")
            .bind(url_hashes)
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            out.insert(record.url_hash.clone(), record);
        }
        Ok(out)
    }

    async fn batch_put(&self, records: &[UrlRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        // Batch UNNEST upsert, one round-trip per batch.
        let mut hashes = Vec::with_capacity(records.len());
        let mut urls = Vec::with_capacity(records.len());
        let mut domains = Vec::with_capacity(records.len());
        let mut states = Vec::with_capacity(records.len());
        let mut retries = Vec::with_capacity(records.len());
        let mut created = Vec::with_capacity(records.len());
        let mut updated = Vec::with_capacity(records.len());
        for record in records {
            hashes.push(record.url_hash.clone());
            urls.push(record.url.clone());
            domains.push(record.domain.clone());
            states.push(record.state.as_str().to_string());
            retries.push(record.retry_count as i32);
            created.push(record.created_at);
            updated.push(record.updated_at);
        }
        sqlx::query(
            r#"INSERT INTO url_states
               (url_hash, url, domain, state, retry_count, created_at, updated_at, version)
               SELECT *, 0 FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[],
                                        $5::int[], $6::timestamptz[], $7::timestamptz[])
               ON CONFLICT (url_hash) DO NOTHING"#,
        )
        .bind(&hashes)
        .bind(&urls)
        .bind(&domains)
        .bind(&states)
        .bind(&retries)
        .bind(&created)
        .bind(&updated)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM url_states
               WHERE state = 'in_progress'
                 AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
               LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;
        rows.iter().map(row_to_record).collect()
    }
}
