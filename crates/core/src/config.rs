use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub http: HttpConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
    pub worker: WorkerConfig,
    pub dedup: DedupConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Identity of this instance; auto-generated when empty.
    #[serde(default)]
    pub crawler_id: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_qps")]
    pub default_qps_per_domain: u32,
    /// Per-domain QPS overrides, keyed by registrable host.
    #[serde(default)]
    pub domain_qps_overrides: HashMap<String, u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseConfig {
    #[serde(default = "default_acquisition_ttl")]
    pub acquisition_ttl_seconds: u64,
    /// Must stay below half the acquisition TTL so a missed beat still
    /// leaves one heartbeat window before expiry.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_reclaim_batch")]
    pub reclaim_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_batch")]
    pub poll_batch_size: usize,
    #[serde(default = "default_max_empty_polls")]
    pub max_empty_polls: u32,
    #[serde(default = "default_empty_poll_sleep")]
    pub empty_poll_sleep_seconds: u64,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_max_per_domain")]
    pub max_concurrent_per_domain: usize,
    #[serde(default)]
    pub domain_concurrency_overrides: HashMap<String, usize>,
    /// Added to the HTTP timeout to bound a whole crawl task.
    #[serde(default = "default_task_timeout_buffer")]
    pub task_timeout_buffer_seconds: u64,
    #[serde(default = "default_rate_check_retries")]
    pub rate_check_retries: u32,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_bloom_capacity")]
    pub bloom_capacity: usize,
    #[serde(default = "default_bloom_fp")]
    pub bloom_fp_rate: f64,
    #[serde(default = "default_bloom_generations")]
    pub bloom_generations: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_batch")]
    pub batch_size: usize,
    #[serde(default = "default_sitemap_depth")]
    pub default_sitemap_depth: u32,
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,
    #[serde(default = "default_max_sitemap_urls")]
    pub max_sitemap_urls: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// "memory" for single-process development, "postgres" for shared state.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub postgres_url: String,
    #[serde(default = "default_raw_blob_root")]
    pub raw_blob_root: String,
    #[serde(default = "default_parsed_blob_root")]
    pub parsed_blob_root: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_user_agent() -> String {
    "crawlgrid/0.1".to_string()
}
fn default_max_concurrent() -> usize { 10 }
fn default_request_timeout() -> u64 { 30 }
fn default_connect_timeout() -> u64 { 10 }
fn default_max_content_length() -> usize { 50 * 1024 * 1024 }
fn default_qps() -> u32 { 1 }
fn default_max_retries() -> u32 { 3 }
fn default_base_backoff() -> u64 { 60 }
fn default_max_backoff() -> u64 { 3600 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter_factor() -> f64 { 0.1 }
fn default_acquisition_ttl() -> u64 { 3600 }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_cleanup_interval() -> u64 { 300 }
fn default_reclaim_batch() -> usize { 100 }
fn default_poll_batch() -> usize { 10 }
fn default_max_empty_polls() -> u32 { 3 }
fn default_empty_poll_sleep() -> u64 { 5 }
fn default_visibility_timeout() -> u64 { 300 }
fn default_max_per_domain() -> usize { 2 }
fn default_task_timeout_buffer() -> u64 { 60 }
fn default_rate_check_retries() -> u32 { 3 }
fn default_drain_timeout() -> u64 { 30 }
fn default_bloom_capacity() -> usize { 1_000_000 }
fn default_bloom_fp() -> f64 { 0.001 }
fn default_bloom_generations() -> usize { 3 }
fn default_discovery_batch() -> usize { 100 }
fn default_sitemap_depth() -> u32 { 3 }
fn default_max_url_length() -> usize { 2048 }
fn default_max_sitemap_urls() -> usize { 50_000 }
fn default_backend() -> String { "memory".to_string() }
fn default_raw_blob_root() -> String { "data/raw".to_string() }
fn default_parsed_blob_root() -> String { "data/parsed".to_string() }
fn default_health_enabled() -> bool { true }
fn default_health_port() -> u16 { 8080 }

impl AppConfig {
    /// QPS limit for a domain: override if present, else the default.
    pub fn qps_limit(&self, domain: &str) -> u32 {
        self.rate_limit
            .domain_qps_overrides
            .get(domain)
            .copied()
            .unwrap_or(self.rate_limit.default_qps_per_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_fill_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [general]
            [http]
            [rate_limit]
            [retry]
            [lease]
            [worker]
            [dedup]
            [discovery]
            [storage]
            [health]
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.default_qps_per_domain, 1);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.lease.acquisition_ttl_seconds, 3600);
        assert_eq!(config.storage.backend, "memory");
    }

    #[test]
    fn qps_override_wins() {
        let config: AppConfig = toml::from_str(
            r#"
            [general]
            [http]
            [rate_limit]
            default_qps_per_domain = 2
            [rate_limit.domain_qps_overrides]
            "slow.example.com" = 1
            [retry]
            [lease]
            [worker]
            [dedup]
            [discovery]
            [storage]
            [health]
            "#,
        )
        .unwrap();
        assert_eq!(config.qps_limit("slow.example.com"), 1);
        assert_eq!(config.qps_limit("fast.example.com"), 2);
    }
}
