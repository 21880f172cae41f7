//! The crawl worker: pulls crawl messages, coordinates leasing, admission,
//! robots, fetching, storage, and the indexing handoff.
//!
//! Per message the worker runs a fixed procedure: parse, normalize,
//! acquire the lease, pass rate-limit admission, enforce robots, record the
//! request, fetch under the concurrency gates, then either complete with
//! stored payloads and an indexing message or classify the failure and
//! schedule (or refuse) a retry. The lease is always released on one of
//! those paths or by the final cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crawlgrid_core::url::{extract_domain, normalize_url, robots_txt_url, url_hash};
use crawlgrid_core::{
    AppConfig, CrawlError, CrawlMessage, Health, IndexingMessage,
};
use crawlgrid_fetch::{response_error, HttpFetcher};
use crawlgrid_lease::{LeaseManager, ReleaseOutcome};
use crawlgrid_limiter::{RateLimiter, RobotsCache};
use crawlgrid_queue::{QueueClient, QueueMessage, QueueName};
use crawlgrid_storage::{blob_key, BlobStore};

pub mod classify;
pub mod concurrent;
pub mod health;
pub mod stats;

pub use classify::{Classification, ErrorPolicy};
pub use concurrent::{ConcurrencyStats, ConcurrentCrawlManager};
pub use health::{ComponentHealth, ServerState};
pub use stats::{WorkerStats, WorkerStatsSnapshot};

/// Longest deferral we hand the queue when admission is denied.
const MAX_NACK_DELAY: Duration = Duration::from_secs(300);

/// Cap on honoring a robots `Crawl-delay` directive.
const MAX_CRAWL_DELAY_SECS: u64 = 30;

pub struct CrawlerWorker {
    config: Arc<AppConfig>,
    queue: QueueClient,
    lease: Arc<LeaseManager>,
    limiter: Arc<RateLimiter>,
    robots: Arc<RobotsCache>,
    fetcher: Arc<HttpFetcher>,
    raw_blobs: Arc<dyn BlobStore>,
    concurrency: Arc<ConcurrentCrawlManager>,
    policy: ErrorPolicy,
    stats: Arc<WorkerStats>,
    health: Arc<ComponentHealth>,
    started_at: DateTime<Utc>,
}

impl CrawlerWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        queue: QueueClient,
        lease: Arc<LeaseManager>,
        limiter: Arc<RateLimiter>,
        robots: Arc<RobotsCache>,
        fetcher: Arc<HttpFetcher>,
        raw_blobs: Arc<dyn BlobStore>,
        concurrency: Arc<ConcurrentCrawlManager>,
        stats: Arc<WorkerStats>,
        health: Arc<ComponentHealth>,
    ) -> Self {
        let policy = ErrorPolicy::new(
            config.retry.max_retries,
            Duration::from_secs(config.retry.base_backoff_seconds),
            Duration::from_secs(config.retry.max_backoff_seconds),
            config.retry.backoff_multiplier,
            config.retry.jitter_factor,
        );
        Self {
            config,
            queue,
            lease,
            limiter,
            robots,
            fetcher,
            raw_blobs,
            concurrency,
            policy,
            stats,
            health,
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Main loop: long-poll the crawl queue until shutdown, then drain.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut empty_polls = 0u32;
        info!(crawler_id = %self.lease.crawler_id(), "worker loop started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, stopping poll loop");
                    break;
                }
                polled = self.clone().poll_once() => {
                    match polled {
                        Ok(0) => {
                            empty_polls += 1;
                            if empty_polls >= self.config.worker.max_empty_polls {
                                debug!("queue idle, sleeping");
                                tokio::time::sleep(Duration::from_secs(
                                    self.config.worker.empty_poll_sleep_seconds,
                                ))
                                .await;
                                empty_polls = 0;
                            }
                        }
                        Ok(_) => empty_polls = 0,
                        Err(e) => {
                            warn!("poll failed: {}", e);
                            self.health.set("queue", Health::Degraded);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Receive one batch and process it concurrently.
    async fn poll_once(self: Arc<Self>) -> Result<usize, CrawlError> {
        let messages = self
            .queue
            .receive(
                QueueName::Crawl,
                self.config.worker.poll_batch_size,
                Duration::from_secs(self.config.worker.visibility_timeout_seconds),
            )
            .await?;
        self.health.set("queue", Health::Healthy);
        if messages.is_empty() {
            return Ok(0);
        }

        let count = messages.len();
        debug!(count, "processing crawl batch");
        let mut handles = Vec::with_capacity(count);
        for message in messages {
            let worker = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                worker.process_message(message).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(count)
    }

    /// Bounded drain, then force-fail whatever leases remain so the reclaim
    /// sweep has nothing to do for this worker.
    async fn drain(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.worker.drain_timeout_seconds);
        while self.concurrency.stats().active_tasks > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let abandoned = self.concurrency.stats().active_tasks;
        if abandoned > 0 {
            warn!(abandoned, "drain window elapsed with tasks still in flight");
        }
        self.lease.release_all_failed("worker shutdown").await;
        info!("worker drained");
    }

    /// Process one crawl message end to end. Never panics the loop: every
    /// exit acks or nacks the message and settles the lease.
    pub async fn process_message(&self, message: QueueMessage) {
        let start = Instant::now();

        // step 1: parse
        let crawl: CrawlMessage = match serde_json::from_str(&message.body) {
            Ok(crawl) => crawl,
            Err(e) => {
                warn!("unparseable crawl message: {}", e);
                self.stats.messages_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.queue
                    .send_to_dlq(&message.body, &format!("invalid message format: {e}"))
                    .await;
                self.ack(&message).await;
                return;
            }
        };
        self.stats
            .messages_received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // step 2: canonical identity
        let url = match normalize_url(&crawl.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %crawl.url, "unroutable crawl message: {}", e);
                self.queue
                    .send_to_dlq(&message.body, &format!("bad url: {e}"))
                    .await;
                self.ack(&message).await;
                return;
            }
        };
        let hash = url_hash(&url);
        let domain = extract_domain(&url).unwrap_or_else(|_| crawl.domain.clone());

        info!(url = %url, domain = %domain, retry = crawl.retry_count, "processing crawl message");

        // step 3: lease
        let ttl = chrono::Duration::seconds(self.config.lease.acquisition_ttl_seconds as i64);
        match self.lease.try_acquire(&url, &domain, ttl).await {
            Ok(true) => {
                self.stats.record_lock_attempt(true);
                self.health.set("state_store", Health::Healthy);
            }
            Ok(false) => {
                // another worker has it, or it is done / backing off
                self.stats.record_lock_attempt(false);
                debug!(url = %url, "lease unavailable, acking message");
                self.ack(&message).await;
                return;
            }
            Err(e) => {
                warn!(url = %url, "state store unavailable during acquire: {}", e);
                self.health.set("state_store", Health::Degraded);
                self.nack(&message, Duration::from_secs(5)).await;
                return;
            }
        }

        // steps 4-9, with the lease settled on every path
        let outcome = self.crawl_leased(&crawl, &url, &hash, &domain, &message).await;
        match outcome {
            Ok(true) => {
                self.stats
                    .messages_processed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Ok(false) => {
                // deferred (rate limit): message was nacked, lease yielded
            }
            Err(e) => {
                self.handle_failure(&crawl, &hash, &domain, &message, e).await;
            }
        }
        self.stats.record_task_duration(start.elapsed().as_millis() as u64);
    }

    /// Steps 4-8. `Ok(true)` means terminal (acked); `Ok(false)` means the
    /// URL was yielded back for later. Errors feed the failure path.
    async fn crawl_leased(
        &self,
        crawl: &CrawlMessage,
        url: &str,
        hash: &str,
        domain: &str,
        message: &QueueMessage,
    ) -> Result<bool, CrawlError> {
        // step 4: admission
        if !self.check_admission(domain).await {
            let next_at = self.limiter.next_allowed_at(domain).await;
            let wait = (next_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1))
                .max(Duration::from_secs(1))
                .min(MAX_NACK_DELAY);
            info!(domain, wait_secs = wait.as_secs(), "admission denied, yielding lease");
            self.lease
                .release_pending(hash, Some(next_at))
                .await
                .map_err(CrawlError::Storage)?;
            self.nack(message, wait).await;
            return Ok(false);
        }

        // step 5: robots
        self.ensure_robots(domain).await;
        if !self
            .robots
            .is_allowed(domain, url, &self.config.general.user_agent)
        {
            info!(url = %url, "blocked by robots.txt");
            let err = CrawlError::RobotsBlocked(url.to_string());
            return Err(err);
        }

        // step 6: count the admitted request
        self.limiter.record(domain).await;

        // honor a robots crawl-delay, bounded so one domain cannot pin the
        // task slot for minutes
        if let Some(delay) = self
            .robots
            .crawl_delay(domain, &self.config.general.user_agent)
        {
            let delay = Duration::from_secs(delay.min(MAX_CRAWL_DELAY_SECS));
            if !delay.is_zero() {
                debug!(domain, delay_secs = delay.as_secs(), "robots crawl-delay");
                tokio::time::sleep(delay).await;
            }
        }

        // step 7: fetch under the concurrency gates
        let response = self
            .concurrency
            .run(domain, self.fetcher.fetch(url))
            .await?;
        if let Some(err) = response_error(&response) {
            return Err(err);
        }

        // step 8: store, complete, hand off
        let raw_key = blob_key(hash, response.fetched_at);
        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| "text/html".to_string());
        self.raw_blobs
            .put(&raw_key, &response.body, &content_type)
            .await
            .map_err(CrawlError::Storage)?;
        self.health.set("blob_store", Health::Healthy);

        let applied = self
            .lease
            .release(
                hash,
                ReleaseOutcome::Done {
                    raw_blob_key: raw_key.clone(),
                    parsed_blob_key: None,
                },
            )
            .await
            .map_err(CrawlError::Storage)?;

        if applied {
            let indexing = IndexingMessage {
                url: url.to_string(),
                url_hash: hash.to_string(),
                domain: domain.to_string(),
                raw_blob_key: raw_key,
                parsed_blob_key: None,
                fetched_at: response.fetched_at,
                status_code: response.status,
                content_length: response.body.len(),
                language: None,
                processing_priority: crawl.priority,
            };
            if let Err(e) = self.queue.send_indexing(&indexing).await {
                // the record is Done; redelivery will skip it, so losing
                // this publish is the one place at-least-once degrades
                error!(url = %url, "failed to publish indexing message: {}", e);
            } else {
                self.stats
                    .indexing_published
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            self.stats.record_url_crawled(true, domain);
            info!(url = %url, status = response.status, "crawl complete");
        } else {
            info!(url = %url, "lease lost before completion, result discarded");
        }

        self.ack(message).await;
        Ok(true)
    }

    /// Step 4's bounded check-and-wait.
    async fn check_admission(&self, domain: &str) -> bool {
        let attempts = self.config.worker.rate_check_retries.max(1);
        for attempt in 0..attempts {
            if self.limiter.check(domain).await {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        false
    }

    /// Cache-miss robots population, coalesced per domain. Any non-200 or
    /// transport failure means "no robots file": default-allow.
    async fn ensure_robots(&self, domain: &str) {
        if self.robots.get(domain).is_some() {
            return;
        }
        let _guard = self.robots.fetch_guard(domain).await;
        if self.robots.get(domain).is_some() {
            return;
        }
        match self.fetcher.fetch(&robots_txt_url(domain)).await {
            Ok(response) if response.status == 200 => {
                let text = String::from_utf8_lossy(&response.body);
                self.robots.populate(domain, &text);
            }
            Ok(response) => {
                debug!(domain, status = response.status, "no robots.txt");
                self.robots.populate_absent(domain);
            }
            Err(e) => {
                debug!(domain, "robots fetch failed, allowing without caching: {}", e);
            }
        }
    }

    /// Step 9: classify, settle the lease as Failed, and schedule the retry
    /// when the taxonomy allows one.
    async fn handle_failure(
        &self,
        crawl: &CrawlMessage,
        hash: &str,
        domain: &str,
        message: &QueueMessage,
        error: CrawlError,
    ) {
        let classification = self.policy.classify(&error);
        self.stats.record_error(classification.kind);
        self.stats.record_url_crawled(false, domain);
        warn!(
            url = %crawl.url,
            kind = %classification.kind,
            retry = crawl.retry_count,
            "crawl failed: {}", error
        );

        let retry = self.policy.should_retry(&error, crawl.retry_count);
        let next_eligible_at = if retry {
            let delay = self.policy.backoff_delay(crawl.retry_count, &classification);
            Some((Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(), delay))
        } else {
            None
        };

        let released = self
            .lease
            .release(
                hash,
                ReleaseOutcome::Failed {
                    error: error.to_string(),
                    next_eligible_at: next_eligible_at.map(|(at, _)| at),
                },
            )
            .await;

        match released {
            Ok(applied) => {
                if let (true, Some((_, delay))) = (applied, next_eligible_at) {
                    let retry_message = CrawlMessage {
                        retry_count: crawl.retry_count + 1,
                        ..crawl.clone()
                    };
                    match self.queue.send_crawl_delayed(&retry_message, delay).await {
                        Ok(()) => {
                            self.stats
                                .retries_scheduled
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            info!(url = %crawl.url, delay_secs = delay.as_secs(), "retry scheduled");
                        }
                        Err(e) => {
                            // the backoff gate still lets a future
                            // discovery pass or operator requeue proceed
                            warn!(url = %crawl.url, "failed to schedule retry: {}", e);
                        }
                    }
                }
                self.ack(message).await;
            }
            Err(e) => {
                error!(url = %crawl.url, "failed to settle lease after error: {}", e);
                self.health.set("state_store", Health::Degraded);
                self.nack(message, Duration::from_secs(5)).await;
            }
        }
        self.stats
            .messages_failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.ack(QueueName::Crawl, &message.receipt).await {
            warn!("failed to ack crawl message: {}", e);
        }
    }

    async fn nack(&self, message: &QueueMessage, delay: Duration) {
        if let Err(e) = self.queue.nack(QueueName::Crawl, &message.receipt, delay).await {
            warn!("failed to nack crawl message: {}", e);
        }
    }
}
