//! Postgres-backed queue for shared deployments.
//!
//! `FOR UPDATE SKIP LOCKED` makes the pop safe under many concurrent
//! workers; `visible_at` doubles as both the delivery delay and the
//! visibility timeout, so an un-acked message simply becomes visible again
//! when its lease lapses.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crawlgrid_core::CrawlError;

use crate::{Queue, QueueDepth, QueueMessage, QueueName};

pub struct PostgresQueue {
    pool: PgPool,
}

impl PostgresQueue {
    pub async fn new(database_url: &str) -> Result<Self, CrawlError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| CrawlError::Queue(e.to_string()))?;
        info!("connected to postgres queue");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), CrawlError> {
        sqlx::raw_sql(include_str!("../migrations/001_queue_messages.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Queue(e.to_string()))?;
        info!("queue migrations complete");
        Ok(())
    }
}

fn queue_error(e: sqlx::Error) -> CrawlError {
    CrawlError::Queue(e.to_string())
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn send(&self, queue: QueueName, body: String, priority: u8) -> Result<(), CrawlError> {
        sqlx::query(
            "INSERT INTO queue_messages (queue, body, priority, visible_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(queue.as_str())
        .bind(&body)
        .bind(priority as i32)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn send_delayed(
        &self,
        queue: QueueName,
        body: String,
        priority: u8,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            r#"INSERT INTO queue_messages (queue, body, priority, visible_at)
               VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))"#,
        )
        .bind(queue.as_str())
        .bind(&body)
        .bind(priority as i32)
        .bind(delay.as_secs() as f64)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn send_batch(
        &self,
        queue: QueueName,
        bodies: Vec<(String, u8)>,
    ) -> Result<(), CrawlError> {
        if bodies.is_empty() {
            return Ok(());
        }
        let mut texts = Vec::with_capacity(bodies.len());
        let mut priorities = Vec::with_capacity(bodies.len());
        for (body, priority) in bodies {
            texts.push(body);
            priorities.push(priority as i32);
        }
        sqlx::query(
            r#"INSERT INTO queue_messages (queue, body, priority, visible_at)
               SELECT $1, t.body, t.priority, NOW()
               FROM UNNEST($2::text[], $3::int[]) AS t(body, priority)"#,
        )
        .bind(queue.as_str())
        .bind(&texts)
        .bind(&priorities)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, CrawlError> {
        let receipt_base = Uuid::new_v4().to_string();
        let rows = sqlx::query(
            r#"UPDATE queue_messages
               SET receipt = $4 || '-' || id, visible_at = NOW() + ($3 * INTERVAL '1 second')
               WHERE id IN (
                   SELECT id FROM queue_messages
                   WHERE queue = $1 AND visible_at <= NOW()
                   ORDER BY priority DESC, id ASC
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, body, receipt"#,
        )
        .bind(queue.as_str())
        .bind(max as i64)
        .bind(visibility.as_secs() as f64)
        .bind(&receipt_base)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(queue_error)?;
            out.push(QueueMessage {
                id: id.to_string(),
                body: row.try_get("body").map_err(queue_error)?,
                receipt: row.try_get("receipt").map_err(queue_error)?,
            });
        }
        Ok(out)
    }

    async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), CrawlError> {
        sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND receipt = $2")
            .bind(queue.as_str())
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn nack(
        &self,
        queue: QueueName,
        receipt: &str,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            r#"UPDATE queue_messages
               SET visible_at = NOW() + ($3 * INTERVAL '1 second'), receipt = NULL
               WHERE queue = $1 AND receipt = $2"#,
        )
        .bind(queue.as_str())
        .bind(receipt)
        .bind(delay.as_secs() as f64)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, CrawlError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) FILTER (WHERE visible_at <= NOW()) AS visible,
                 COUNT(*) FILTER (WHERE visible_at > NOW()) AS in_flight
               FROM queue_messages WHERE queue = $1"#,
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(queue_error)?;
        let visible: i64 = row.try_get("visible").map_err(queue_error)?;
        let in_flight: i64 = row.try_get("in_flight").map_err(queue_error)?;
        Ok(QueueDepth {
            visible: visible as usize,
            in_flight: in_flight as usize,
        })
    }
}
