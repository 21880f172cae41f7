//! Queue adapter for the discovery, crawl, indexing, and dead-letter queues.
//!
//! The backend provides durable at-least-once delivery with visibility
//! timeouts: a received message stays invisible until acked, nacked, or its
//! visibility window lapses, after which it is redelivered. `MemoryQueue`
//! serves single-process development and tests; `PostgresQueue` serves
//! shared deployments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, warn};

use crawlgrid_core::{
    CrawlError, CrawlMessage, DeadLetterMessage, DiscoveryMessage, IndexingMessage,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

/// The four logical queues of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Discovery,
    Crawl,
    Indexing,
    DeadLetter,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Discovery => "discovery",
            QueueName::Crawl => "crawl",
            QueueName::Indexing => "indexing",
            QueueName::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message leased from a queue. The receipt is what ack/nack operate on.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub receipt: String,
}

/// Visible vs in-flight counts for one queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

#[async_trait]
pub trait Queue: Send + Sync + 'static {
    async fn send(&self, queue: QueueName, body: String, priority: u8) -> Result<(), CrawlError>;

    /// Enqueue a message that only becomes visible after `delay`. Retry
    /// scheduling uses this so a backed-off URL is not redelivered early.
    async fn send_delayed(
        &self,
        queue: QueueName,
        body: String,
        priority: u8,
        delay: Duration,
    ) -> Result<(), CrawlError>;

    async fn send_batch(
        &self,
        queue: QueueName,
        bodies: Vec<(String, u8)>,
    ) -> Result<(), CrawlError>;

    /// Lease up to `max` messages, invisible for `visibility`.
    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, CrawlError>;

    /// Remove a leased message permanently.
    async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), CrawlError>;

    /// Return a leased message to the queue, visible again after `delay`.
    async fn nack(
        &self,
        queue: QueueName,
        receipt: &str,
        delay: Duration,
    ) -> Result<(), CrawlError>;

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, CrawlError>;
}

/// Typed convenience layer over the raw queue; all bodies are JSON.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn Queue>,
    crawler_id: String,
}

impl QueueClient {
    pub fn new(backend: Arc<dyn Queue>, crawler_id: impl Into<String>) -> Self {
        Self {
            backend,
            crawler_id: crawler_id.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Queue> {
        &self.backend
    }

    fn encode<T: Serialize>(message: &T) -> Result<String, CrawlError> {
        serde_json::to_string(message).map_err(|e| CrawlError::Queue(e.to_string()))
    }

    pub async fn send_discovery(&self, message: &DiscoveryMessage) -> Result<(), CrawlError> {
        self.backend
            .send(QueueName::Discovery, Self::encode(message)?, message.priority)
            .await
    }

    pub async fn send_crawl_batch(&self, messages: &[CrawlMessage]) -> Result<(), CrawlError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut bodies = Vec::with_capacity(messages.len());
        for message in messages {
            bodies.push((Self::encode(message)?, message.priority));
        }
        self.backend.send_batch(QueueName::Crawl, bodies).await
    }

    /// Re-publish a crawl message that becomes visible after `delay`.
    pub async fn send_crawl_delayed(
        &self,
        message: &CrawlMessage,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        self.backend
            .send_delayed(
                QueueName::Crawl,
                Self::encode(message)?,
                message.priority,
                delay,
            )
            .await
    }

    pub async fn send_indexing(&self, message: &IndexingMessage) -> Result<(), CrawlError> {
        self.backend
            .send(
                QueueName::Indexing,
                Self::encode(message)?,
                message.processing_priority,
            )
            .await
    }

    /// Route an unparseable or undeliverable message to the dead-letter
    /// queue. Best-effort: a DLQ failure is logged, never propagated, so it
    /// cannot wedge the worker loop.
    pub async fn send_to_dlq(&self, original_body: &str, error_reason: &str) {
        let wrapped = DeadLetterMessage {
            original_message: original_body.to_string(),
            error_reason: error_reason.to_string(),
            failed_at: Utc::now(),
            crawler_id: self.crawler_id.clone(),
        };
        let body = match Self::encode(&wrapped) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode dead-letter message: {}", e);
                return;
            }
        };
        if let Err(e) = self.backend.send(QueueName::DeadLetter, body, 1).await {
            warn!(reason = error_reason, "failed to publish to dead-letter queue: {}", e);
        }
    }

    pub async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, CrawlError> {
        self.backend.receive(queue, max, visibility).await
    }

    pub async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), CrawlError> {
        self.backend.ack(queue, receipt).await
    }

    pub async fn nack(
        &self,
        queue: QueueName,
        receipt: &str,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        self.backend.nack(queue, receipt, delay).await
    }

    pub async fn depth(&self, queue: QueueName) -> Result<QueueDepth, CrawlError> {
        self.backend.depth(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dlq_wraps_the_original_body() {
        let backend = Arc::new(MemoryQueue::new());
        let client = QueueClient::new(backend.clone(), "worker-test");

        client.send_to_dlq("{not json", "invalid message format").await;

        let messages = backend
            .receive(QueueName::DeadLetter, 10, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let dead: DeadLetterMessage = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(dead.original_message, "{not json");
        assert_eq!(dead.error_reason, "invalid message format");
        assert_eq!(dead.crawler_id, "worker-test");
    }

    #[tokio::test]
    async fn typed_sends_land_on_their_queues() {
        let backend = Arc::new(MemoryQueue::new());
        let client = QueueClient::new(backend.clone(), "worker-test");

        client
            .send_discovery(&DiscoveryMessage {
                domain: "example.com".into(),
                priority: 5,
                max_urls: None,
                discovery_depth: 3,
                requester_id: None,
            })
            .await
            .unwrap();
        client
            .send_crawl_batch(&[CrawlMessage {
                url: "https://example.com/a".into(),
                domain: "example.com".into(),
                priority: 1,
                retry_count: 0,
                discovery_source: Some("sitemap".into()),
            }])
            .await
            .unwrap();

        assert_eq!(backend.depth(QueueName::Discovery).await.unwrap().visible, 1);
        assert_eq!(backend.depth(QueueName::Crawl).await.unwrap().visible, 1);
        assert_eq!(backend.depth(QueueName::Indexing).await.unwrap().visible, 0);
    }
}
