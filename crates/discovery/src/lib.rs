//! Discovery coordinator: turns a domain into pending crawl work.
//!
//! Per discovery message: robots gate at the root, sitemap enumeration,
//! candidate filtering and prioritization, two-stage deduplication, then
//! pending-record creation and crawl-message publication in batches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crawlgrid_core::url::{extract_domain, robots_txt_url};
use crawlgrid_core::{AppConfig, CrawlMessage, DiscoveryMessage, SitemapUrl, UrlRecord};
use crawlgrid_dedup::Deduplicator;
use crawlgrid_fetch::HttpFetcher;
use crawlgrid_limiter::RobotsCache;
use crawlgrid_queue::{QueueClient, QueueMessage, QueueName};
use crawlgrid_storage::StateStore;

pub mod sitemap;

pub use sitemap::{parse_sitemap, SitemapContent, SitemapDiscoverer};

/// File types that are never worth a crawl slot.
static EXCLUDED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".bmp", ".mp3", ".mp4", ".avi",
        ".mov", ".wmv", ".flv", ".mkv", ".zip", ".rar", ".tar", ".gz", ".7z", ".exe", ".dmg",
        ".pkg", ".deb", ".rpm", ".css", ".js", ".json", ".csv", ".pdf", ".doc", ".docx", ".xls",
        ".xlsx", ".ppt", ".pptx", ".woff", ".woff2", ".ttf", ".eot",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStatsSnapshot {
    pub domains_processed: u64,
    pub robots_blocked_domains: u64,
    pub urls_discovered: u64,
    pub urls_filtered: u64,
    pub urls_duplicate: u64,
    pub urls_enqueued: u64,
    pub sitemap_errors: u64,
}

#[derive(Default)]
pub struct DiscoveryStats {
    pub domains_processed: AtomicU64,
    pub robots_blocked_domains: AtomicU64,
    pub urls_discovered: AtomicU64,
    pub urls_filtered: AtomicU64,
    pub urls_duplicate: AtomicU64,
    pub urls_enqueued: AtomicU64,
    pub sitemap_errors: AtomicU64,
}

impl DiscoveryStats {
    pub fn snapshot(&self) -> DiscoveryStatsSnapshot {
        DiscoveryStatsSnapshot {
            domains_processed: self.domains_processed.load(Ordering::Relaxed),
            robots_blocked_domains: self.robots_blocked_domains.load(Ordering::Relaxed),
            urls_discovered: self.urls_discovered.load(Ordering::Relaxed),
            urls_filtered: self.urls_filtered.load(Ordering::Relaxed),
            urls_duplicate: self.urls_duplicate.load(Ordering::Relaxed),
            urls_enqueued: self.urls_enqueued.load(Ordering::Relaxed),
            sitemap_errors: self.sitemap_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct DiscoveryCoordinator {
    config: Arc<AppConfig>,
    queue: QueueClient,
    store: Arc<dyn StateStore>,
    dedup: Arc<Deduplicator>,
    robots: Arc<RobotsCache>,
    fetcher: Arc<HttpFetcher>,
    discoverer: SitemapDiscoverer,
    stats: Arc<DiscoveryStats>,
}

impl DiscoveryCoordinator {
    pub fn new(
        config: Arc<AppConfig>,
        queue: QueueClient,
        store: Arc<dyn StateStore>,
        dedup: Arc<Deduplicator>,
        robots: Arc<RobotsCache>,
        fetcher: Arc<HttpFetcher>,
    ) -> Self {
        let discoverer =
            SitemapDiscoverer::new(Arc::clone(&fetcher), config.discovery.max_sitemap_urls);
        Self {
            config,
            queue,
            store,
            dedup,
            robots,
            fetcher,
            discoverer,
            stats: Arc::new(DiscoveryStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<DiscoveryStats> {
        &self.stats
    }

    /// Poll the discovery queue until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        info!("discovery coordinator started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("discovery coordinator stopping");
                    break;
                }
                received = self.queue.receive(
                    QueueName::Discovery,
                    1,
                    Duration::from_secs(self.config.worker.visibility_timeout_seconds),
                ) => {
                    match received {
                        Ok(messages) if messages.is_empty() => {
                            tokio::time::sleep(Duration::from_secs(
                                self.config.worker.empty_poll_sleep_seconds,
                            ))
                            .await;
                        }
                        Ok(messages) => {
                            for message in messages {
                                self.process_message(message).await;
                            }
                        }
                        Err(e) => {
                            warn!("discovery poll failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    pub async fn process_message(&self, message: QueueMessage) {
        let discovery: DiscoveryMessage = match serde_json::from_str(&message.body) {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!("unparseable discovery message: {}", e);
                self.queue
                    .send_to_dlq(&message.body, &format!("invalid message format: {e}"))
                    .await;
                self.ack(&message).await;
                return;
            }
        };

        match self.discover_domain(&discovery).await {
            Ok(()) => {
                self.stats.domains_processed.fetch_add(1, Ordering::Relaxed);
                self.ack(&message).await;
            }
            Err(e) => {
                warn!(domain = %discovery.domain, "discovery failed, will redeliver: {}", e);
                self.stats.sitemap_errors.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .queue
                    .nack(QueueName::Discovery, &message.receipt, Duration::from_secs(30))
                    .await
                {
                    warn!("failed to nack discovery message: {}", e);
                }
            }
        }
    }

    async fn discover_domain(
        &self,
        discovery: &DiscoveryMessage,
    ) -> Result<(), crawlgrid_core::CrawlError> {
        let domain = &discovery.domain;
        info!(domain = %domain, depth = discovery.discovery_depth, "processing discovery message");

        // robots gate at the domain root
        self.ensure_robots(domain).await;
        let root = format!("https://{domain}/");
        if !self
            .robots
            .is_allowed(domain, &root, &self.config.general.user_agent)
        {
            info!(domain = %domain, "domain blocks crawling at root");
            self.stats
                .robots_blocked_domains
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // sitemap enumeration
        let robots_sitemaps = self.robots.sitemaps(domain);
        let depth = if discovery.discovery_depth == 0 {
            self.config.discovery.default_sitemap_depth
        } else {
            discovery.discovery_depth
        };
        let discovered = self
            .discoverer
            .discover(domain, robots_sitemaps, depth)
            .await;
        self.stats
            .urls_discovered
            .fetch_add(discovered.len() as u64, Ordering::Relaxed);

        // filter, prioritize, cap
        let mut candidates = self.filter_candidates(discovered);
        prioritize(&mut candidates);
        if let Some(max_urls) = discovery.max_urls {
            candidates.truncate(max_urls);
        }
        self.stats
            .urls_filtered
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);

        // two-stage dedup
        let urls: Vec<String> = candidates.into_iter().map(|c| c.url).collect();
        let (fresh, dedup_stats) = self.dedup.deduplicate(&urls).await;
        self.stats
            .urls_duplicate
            .fetch_add(dedup_stats.duplicates as u64, Ordering::Relaxed);
        debug!(
            domain = %domain,
            unique = dedup_stats.unique,
            duplicates = dedup_stats.duplicates,
            "deduplication complete"
        );
        if fresh.is_empty() {
            return Ok(());
        }

        // seed records and publish crawl work in batches
        for chunk in fresh.chunks(self.config.discovery.batch_size) {
            let records: Vec<UrlRecord> = chunk
                .iter()
                .map(|new_url| {
                    let record_domain =
                        extract_domain(&new_url.url).unwrap_or_else(|_| domain.clone());
                    UrlRecord::new_pending(
                        new_url.url_hash.clone(),
                        new_url.url.clone(),
                        record_domain,
                    )
                })
                .collect();
            self.store.batch_put(&records).await?;

            let messages: Vec<CrawlMessage> = records
                .iter()
                .map(|record| CrawlMessage {
                    url: record.url.clone(),
                    domain: record.domain.clone(),
                    priority: discovery.priority,
                    retry_count: 0,
                    discovery_source: Some("sitemap".to_string()),
                })
                .collect();
            self.queue.send_crawl_batch(&messages).await?;
            self.stats
                .urls_enqueued
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
        }

        info!(domain = %domain, enqueued = fresh.len(), "discovery complete");
        Ok(())
    }

    fn filter_candidates(&self, candidates: Vec<SitemapUrl>) -> Vec<SitemapUrl> {
        let max_length = self.config.discovery.max_url_length;
        candidates
            .into_iter()
            .filter(|candidate| {
                let url = candidate.url.as_str();
                if url.len() > max_length {
                    return false;
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return false;
                }
                let path = url.split('?').next().unwrap_or(url).to_ascii_lowercase();
                !EXCLUDED_EXTENSIONS
                    .iter()
                    .any(|extension| path.ends_with(extension))
            })
            .collect()
    }

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
            Ok(_) => self.robots.populate_absent(domain),
            Err(e) => {
                debug!(domain, "robots fetch failed, allowing without caching: {}", e);
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.ack(QueueName::Discovery, &message.receipt).await {
            warn!("failed to ack discovery message: {}", e);
        }
    }
}

/// Sitemap priority desc, then last-modified desc, then shorter URL first.
pub fn prioritize(candidates: &mut [SitemapUrl]) {
    candidates.sort_by(|a, b| {
        let priority_a = a.priority.unwrap_or(0.5);
        let priority_b = b.priority.unwrap_or(0.5);
        priority_b
            .partial_cmp(&priority_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.last_modified.cmp(&a.last_modified))
            .then_with(|| a.url.len().cmp(&b.url.len()))
    });
}
