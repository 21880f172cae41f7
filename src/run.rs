//! Process wiring: build the shared-infrastructure adapters from config and
//! run one of the roles. Every dependency is constructed here and injected;
//! nothing below this layer reaches for globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crawlgrid_core::{AppConfig, DiscoveryMessage, FetchConfig};
use crawlgrid_dedup::{BloomGenerations, Deduplicator};
use crawlgrid_discovery::DiscoveryCoordinator;
use crawlgrid_fetch::HttpFetcher;
use crawlgrid_lease::{HeartbeatManager, LeaseManager};
use crawlgrid_limiter::{
    CounterStore, MemoryCounterStore, PostgresCounterStore, RateLimiter, RobotsCache,
};
use crawlgrid_queue::{MemoryQueue, PostgresQueue, Queue, QueueClient, QueueName};
use crawlgrid_storage::{
    BlobStore, FsBlobStore, MemoryStateStore, PostgresStateStore, StateStore,
};
use crawlgrid_worker::{
    health, ComponentHealth, ConcurrentCrawlManager, CrawlerWorker, ServerState, WorkerStats,
};

struct Services {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    counters: Arc<dyn CounterStore>,
    raw_blobs: Arc<dyn BlobStore>,
}

async fn build_services(config: &AppConfig) -> Result<Services> {
    let services = match config.storage.backend.as_str() {
        "memory" => {
            info!("using in-process backends (single-instance development mode)");
            Services {
                store: Arc::new(MemoryStateStore::new()),
                queue: Arc::new(MemoryQueue::new()),
                counters: Arc::new(MemoryCounterStore::new()),
                raw_blobs: Arc::new(FsBlobStore::new(&config.storage.raw_blob_root)),
            }
        }
        "postgres" => {
            let url = &config.storage.postgres_url;
            if url.is_empty() {
                bail!("storage.backend = \"postgres\" requires storage.postgres_url");
            }
            let store = PostgresStateStore::new(url)
                .await
                .context("connecting state store")?;
            store.run_migrations().await.context("state migrations")?;

            let queue = PostgresQueue::new(url).await.context("connecting queue")?;
            queue.run_migrations().await.context("queue migrations")?;

            let counters = PostgresCounterStore::new(url)
                .await
                .context("connecting rate-limit coordinator")?;
            counters
                .run_migrations()
                .await
                .context("rate-limit migrations")?;

            Services {
                store: Arc::new(store),
                queue: Arc::new(queue),
                counters: Arc::new(counters),
                raw_blobs: Arc::new(FsBlobStore::new(&config.storage.raw_blob_root)),
            }
        }
        other => bail!("unknown storage backend: {other}"),
    };
    Ok(services)
}

fn crawler_id(config: &AppConfig, role: &str) -> String {
    if config.general.crawler_id.is_empty() {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{role}-{}", &suffix[..8])
    } else {
        config.general.crawler_id.clone()
    }
}

fn build_fetcher(config: &AppConfig) -> Result<Arc<HttpFetcher>> {
    let fetcher = HttpFetcher::new(
        FetchConfig {
            timeout: Duration::from_secs(config.http.request_timeout_seconds),
            max_body_size: config.http.max_content_length,
            user_agent: config.general.user_agent.clone(),
        },
        Duration::from_secs(config.http.connect_timeout_seconds),
        config.http.max_concurrent_requests,
    )?;
    Ok(Arc::new(fetcher))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

pub async fn run_worker(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let crawler_id = crawler_id(&config, "worker");
    info!(crawler_id = %crawler_id, "starting crawl worker");

    let services = build_services(&config).await?;
    let queue = QueueClient::new(Arc::clone(&services.queue), crawler_id.clone());
    let lease = Arc::new(LeaseManager::new(
        Arc::clone(&services.store),
        crawler_id.clone(),
        config.retry.max_retries,
    ));
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&services.counters),
        config.rate_limit.default_qps_per_domain,
        config.rate_limit.domain_qps_overrides.clone(),
    ));
    let robots = Arc::new(RobotsCache::new());
    let fetcher = build_fetcher(&config)?;
    let concurrency = Arc::new(ConcurrentCrawlManager::new(
        config.http.max_concurrent_requests,
        config.worker.max_concurrent_per_domain,
        config.worker.domain_concurrency_overrides.clone(),
        Duration::from_secs(
            config.http.request_timeout_seconds + config.worker.task_timeout_buffer_seconds,
        ),
    ));
    let stats = Arc::new(WorkerStats::new());
    let component_health = Arc::new(ComponentHealth::new());

    let worker = Arc::new(CrawlerWorker::new(
        Arc::clone(&config),
        queue.clone(),
        Arc::clone(&lease),
        Arc::clone(&limiter),
        robots,
        fetcher,
        Arc::clone(&services.raw_blobs),
        Arc::clone(&concurrency),
        Arc::clone(&stats),
        Arc::clone(&component_health),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut background = HeartbeatManager::new(
        Arc::clone(&lease),
        Duration::from_secs(config.lease.heartbeat_interval_seconds),
        Duration::from_secs(config.lease.cleanup_interval_seconds),
        Duration::from_secs(config.lease.acquisition_ttl_seconds),
        config.lease.reclaim_batch_size,
    )
    .spawn(&shutdown_tx);

    if config.health.enabled {
        let state = Arc::new(ServerState {
            crawler_id: crawler_id.clone(),
            started_at: worker.started_at(),
            stats: Arc::clone(&stats),
            health: Arc::clone(&component_health),
            concurrency: Arc::clone(&concurrency),
            lease: Arc::clone(&lease),
            queue: queue.clone(),
        });
        background.push(health::spawn(config.health.port, state, &shutdown_tx));
    }

    // periodic semaphore-map hygiene
    {
        let concurrency = Arc::clone(&concurrency);
        let interval = Duration::from_secs(config.lease.cleanup_interval_seconds);
        let mut shutdown_rx = shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        concurrency.sweep_idle_domains();
                    }
                }
            }
        }));
    }

    let worker_handle = tokio::spawn(worker.run(shutdown_tx.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = worker_handle.await;
    for handle in background {
        let _ = handle.await;
    }
    info!("worker shutdown complete");
    Ok(())
}

pub async fn run_discovery(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    let coordinator_id = crawler_id(&config, "discovery");
    info!(coordinator_id = %coordinator_id, "starting discovery coordinator");

    let services = build_services(&config).await?;
    let queue = QueueClient::new(Arc::clone(&services.queue), coordinator_id);
    let robots = Arc::new(RobotsCache::new());
    let fetcher = build_fetcher(&config)?;
    let bloom = Arc::new(BloomGenerations::new(
        config.dedup.bloom_generations,
        config.dedup.bloom_fp_rate,
        config.dedup.bloom_capacity,
    ));
    let dedup = Arc::new(Deduplicator::new(
        Arc::clone(&services.store),
        Some(Arc::clone(&bloom)),
    ));

    let coordinator = Arc::new(DiscoveryCoordinator::new(
        Arc::clone(&config),
        queue,
        Arc::clone(&services.store),
        dedup,
        robots,
        fetcher,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // age dedup entries out on a fixed schedule
    let rotation_handle = {
        let bloom = Arc::clone(&bloom);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        bloom.rotate().await;
                    }
                }
            }
        })
    };

    let coordinator_handle = tokio::spawn(coordinator.run(shutdown_tx.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = coordinator_handle.await;
    let _ = rotation_handle.await;
    info!("discovery coordinator shutdown complete");
    Ok(())
}

pub async fn run_seed(
    config: AppConfig,
    domains: Vec<String>,
    priority: u8,
    max_urls: Option<usize>,
    depth: u32,
) -> Result<()> {
    let services = build_services(&config).await?;
    let queue = QueueClient::new(Arc::clone(&services.queue), "seeder");

    let mut published = 0;
    for domain in &domains {
        let domain = domain.trim();
        if domain.is_empty() {
            continue;
        }
        queue
            .send_discovery(&DiscoveryMessage {
                domain: domain.to_string(),
                priority,
                max_urls,
                discovery_depth: depth,
                requester_id: Some("seed-cli".to_string()),
            })
            .await?;
        info!(domain, "discovery message published");
        published += 1;
    }
    println!("published {published} discovery message(s)");
    Ok(())
}

pub async fn run_reclaim(config: AppConfig, limit: usize) -> Result<()> {
    let services = build_services(&config).await?;
    let lease = LeaseManager::new(
        Arc::clone(&services.store),
        "cli-reclaim",
        config.retry.max_retries,
    );
    let reclaimed = lease.reclaim_expired(limit).await?;
    println!("reclaimed {reclaimed} expired lease(s)");
    Ok(())
}

pub async fn run_recrawl(config: AppConfig, urls: Vec<String>) -> Result<()> {
    use crawlgrid_core::url::url_hash;
    use crawlgrid_lease::transitions;

    let services = build_services(&config).await?;
    let mut reset = 0;
    for url in &urls {
        let hash = url_hash(url);
        let (update, condition) = transitions::recrawl();
        match services.store.update_if(&hash, update, condition).await {
            Ok(()) => {
                info!(url = %url, "record returned to pending");
                reset += 1;
            }
            Err(crawlgrid_core::StoreError::Conflict) => {
                println!("skipped {url}: not in done state");
            }
            Err(crawlgrid_core::StoreError::NotFound) => {
                println!("skipped {url}: unknown record");
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!("re-seeded {reset} of {} URL(s)", urls.len());
    Ok(())
}

pub async fn run_status(config: AppConfig, domain: Option<String>) -> Result<()> {
    let services = build_services(&config).await?;
    let queue = QueueClient::new(Arc::clone(&services.queue), "status-cli");

    println!("{:<12} {:>8} {:>10}", "queue", "visible", "in_flight");
    for name in [
        QueueName::Discovery,
        QueueName::Crawl,
        QueueName::Indexing,
        QueueName::DeadLetter,
    ] {
        let depth = queue.depth(name).await?;
        println!("{:<12} {:>8} {:>10}", name.as_str(), depth.visible, depth.in_flight);
    }

    if let Some(domain) = domain {
        use crawlgrid_core::UrlState;
        println!();
        println!("domain {domain}");
        for state in [
            UrlState::Pending,
            UrlState::InProgress,
            UrlState::Done,
            UrlState::Failed,
        ] {
            let records = services
                .store
                .query_by_domain_state(&domain, state, 1000)
                .await?;
            println!("  {:<12} {:>6}", state.as_str(), records.len());
        }
    }
    Ok(())
}
