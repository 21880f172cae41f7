mod cli;
mod run;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

// mimalloc keeps memory from ballooning under high task concurrency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crawlgrid_core::config::AppConfig;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;
    apply_env_overrides(&mut config);

    match cli.command {
        Commands::Worker => run::run_worker(config).await?,
        Commands::Discovery => run::run_discovery(config).await?,
        Commands::Seed {
            domains,
            priority,
            max_urls,
            depth,
        } => run::run_seed(config, domains, priority, max_urls, depth).await?,
        Commands::Reclaim { limit } => run::run_reclaim(config, limit).await?,
        Commands::Recrawl { urls } => run::run_recrawl(config, urls).await?,
        Commands::Status { domain } => run::run_status(config, domain).await?,
    }

    Ok(())
}

/// Environment overrides for deployment tuning; the config file supplies
/// everything else.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("CRAWLER_ID") {
        if !v.is_empty() {
            config.general.crawler_id = v;
        }
    }
    if let Ok(v) = std::env::var("USER_AGENT") {
        if !v.is_empty() {
            config.general.user_agent = v;
        }
    }
    if let Ok(v) = std::env::var("MAX_CONCURRENT_REQUESTS") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                config.http.max_concurrent_requests = n;
            }
        }
    }
    if let Ok(v) = std::env::var("REQUEST_TIMEOUT") {
        if let Ok(n) = v.parse::<u64>() {
            config.http.request_timeout_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("MAX_CONTENT_LENGTH") {
        if let Ok(n) = v.parse::<usize>() {
            config.http.max_content_length = n;
        }
    }
    if let Ok(v) = std::env::var("DEFAULT_QPS_PER_DOMAIN") {
        if let Ok(n) = v.parse::<u32>() {
            config.rate_limit.default_qps_per_domain = n;
        }
    }
    if let Ok(v) = std::env::var("DOMAIN_QPS_OVERRIDES") {
        match serde_json::from_str(&v) {
            Ok(overrides) => config.rate_limit.domain_qps_overrides = overrides,
            Err(e) => warn!("ignoring malformed DOMAIN_QPS_OVERRIDES: {}", e),
        }
    }
    if let Ok(v) = std::env::var("MAX_RETRIES") {
        if let Ok(n) = v.parse::<u32>() {
            config.retry.max_retries = n;
        }
    }
    if let Ok(v) = std::env::var("BASE_BACKOFF_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.retry.base_backoff_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("MAX_BACKOFF_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.retry.max_backoff_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("ACQUISITION_TTL_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.lease.acquisition_ttl_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            config.lease.heartbeat_interval_seconds = n;
        }
    }
    if let Ok(v) = std::env::var("STORAGE_BACKEND") {
        if !v.is_empty() {
            config.storage.backend = v;
        }
    }
    if let Ok(v) = std::env::var("POSTGRES_URL") {
        if !v.is_empty() {
            config.storage.postgres_url = v;
        }
    }
    if let Ok(v) = std::env::var("HEALTH_PORT") {
        if let Ok(n) = v.parse::<u16>() {
            config.health.port = n;
        }
    }
}
