//! Per-domain robots.txt cache.
//!
//! Entries live for about an hour; a parse failure caches a short-lived
//! sentinel so a broken robots file cannot trigger a re-parse storm. Absent
//! and sentinel entries mean default-allow, the usual convention. Matching
//! is delegated to the `robotstxt` matcher over the cached raw text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Robots files past this size are treated as unparseable.
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const SENTINEL_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RobotsEntry {
    pub domain: String,
    /// Raw robots.txt text; `None` for "no robots file" and sentinel entries.
    pub raw: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set when parsing failed; expires quickly and answers default-allow.
    pub sentinel: bool,
}

impl RobotsEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct RobotsCache {
    entries: DashMap<String, Arc<RobotsEntry>>,
    /// Per-domain fetch coalescing: at most one robots fetch per domain per
    /// TTL within this process.
    fetch_locks: DashMap<String, Arc<Mutex<()>>>,
    default_ttl: Duration,
    sentinel_ttl: Duration,
}

impl Default for RobotsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotsCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            fetch_locks: DashMap::new(),
            default_ttl: DEFAULT_TTL,
            sentinel_ttl: SENTINEL_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttls(default_ttl: Duration, sentinel_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            fetch_locks: DashMap::new(),
            default_ttl,
            sentinel_ttl,
        }
    }

    /// Cached entry for the domain, or `None` once its TTL has lapsed.
    pub fn get(&self, domain: &str) -> Option<Arc<RobotsEntry>> {
        let now = Utc::now();
        let entry = self.entries.get(domain)?.clone();
        if entry.is_expired(now) {
            self.entries.remove(domain);
            return None;
        }
        Some(entry)
    }

    /// Store a fetched robots body. A body that cannot be treated as a
    /// robots file caches a short-lived sentinel instead.
    pub fn populate(&self, domain: &str, raw_text: &str) {
        let now = Utc::now();
        let entry = if Self::parseable(raw_text) {
            RobotsEntry {
                domain: domain.to_string(),
                raw: Some(raw_text.to_string()),
                cached_at: now,
                expires_at: now + chrono::Duration::from_std(self.default_ttl).unwrap_or_default(),
                sentinel: false,
            }
        } else {
            warn!(domain, "robots.txt unparseable, caching sentinel");
            RobotsEntry {
                domain: domain.to_string(),
                raw: None,
                cached_at: now,
                expires_at: now + chrono::Duration::from_std(self.sentinel_ttl).unwrap_or_default(),
                sentinel: true,
            }
        };
        self.entries.insert(domain.to_string(), Arc::new(entry));
    }

    /// Record that the domain has no robots file (any non-200 response).
    /// Default-allow for the full TTL.
    pub fn populate_absent(&self, domain: &str) {
        let now = Utc::now();
        debug!(domain, "no robots.txt, caching default-allow");
        self.entries.insert(
            domain.to_string(),
            Arc::new(RobotsEntry {
                domain: domain.to_string(),
                raw: None,
                cached_at: now,
                expires_at: now + chrono::Duration::from_std(self.default_ttl).unwrap_or_default(),
                sentinel: false,
            }),
        );
    }

    fn parseable(raw_text: &str) -> bool {
        raw_text.len() <= MAX_ROBOTS_BYTES && !raw_text.contains('\0')
    }

    /// Whether `user_agent` may fetch `url`. Absent and sentinel entries
    /// answer true.
    pub fn is_allowed(&self, domain: &str, url: &str, user_agent: &str) -> bool {
        match self.get(domain) {
            Some(entry) => match &entry.raw {
                Some(raw) => {
                    DefaultMatcher::default().one_agent_allowed_by_robots(raw, user_agent, url)
                }
                None => true,
            },
            None => true,
        }
    }

    /// Crawl-delay for the agent's group, falling back to the wildcard
    /// group's value.
    pub fn crawl_delay(&self, domain: &str, user_agent: &str) -> Option<u64> {
        let entry = self.get(domain)?;
        let raw = entry.raw.as_ref()?;
        parse_crawl_delay(raw, user_agent)
    }

    /// `Sitemap:` directives from the cached robots file.
    pub fn sitemaps(&self, domain: &str) -> Vec<String> {
        match self.get(domain).and_then(|e| e.raw.clone()) {
            Some(raw) => raw
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    line.strip_prefix("Sitemap:")
                        .or_else(|| line.strip_prefix("sitemap:"))
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Serialize robots fetches for one domain: the caller holds the guard
    /// while fetching so concurrent misses wait instead of fetching again.
    pub async fn fetch_guard(&self, domain: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .fetch_locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Group-aware Crawl-delay lookup: a group matches when any of its
/// User-agent lines is `*` or a substring match for our agent; the agent's
/// own group wins over the wildcard.
fn parse_crawl_delay(raw: &str, user_agent: &str) -> Option<u64> {
    let agent_lower = user_agent.to_ascii_lowercase();
    let mut wildcard_delay = None;
    let mut agent_delay = None;
    let mut group_agents: Vec<String> = Vec::new();
    let mut in_group_body = false;

    for line in raw.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                if in_group_body {
                    group_agents.clear();
                    in_group_body = false;
                }
                group_agents.push(value.to_ascii_lowercase());
            }
            "crawl-delay" => {
                in_group_body = true;
                if let Ok(delay) = value.parse::<u64>() {
                    for agent in &group_agents {
                        if agent == "*" {
                            wildcard_delay.get_or_insert(delay);
                        } else if agent_lower.contains(agent.as_str()) {
                            agent_delay.get_or_insert(delay);
                        }
                    }
                }
            }
            _ => {
                in_group_body = true;
            }
        }
    }

    agent_delay.or(wildcard_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "crawlgrid/0.1";

    #[test]
    fn absent_entry_defaults_to_allow() {
        let cache = RobotsCache::new();
        assert!(cache.is_allowed("example.com", "https://example.com/x", UA));
        assert!(cache.get("example.com").is_none());
    }

    #[test]
    fn disallow_all_blocks_everything() {
        let cache = RobotsCache::new();
        cache.populate("example.com", "User-agent: *\nDisallow: /\n");
        assert!(!cache.is_allowed("example.com", "https://example.com/", UA));
        assert!(!cache.is_allowed("example.com", "https://example.com/a", UA));
    }

    #[test]
    fn path_scoped_disallow() {
        let cache = RobotsCache::new();
        cache.populate(
            "example.com",
            "User-agent: *\nDisallow: /private/\nAllow: /\n",
        );
        assert!(cache.is_allowed("example.com", "https://example.com/public", UA));
        assert!(!cache.is_allowed("example.com", "https://example.com/private/x", UA));
    }

    #[test]
    fn expired_entries_are_dropped_on_read() {
        let cache = RobotsCache::with_ttls(Duration::ZERO, Duration::ZERO);
        cache.populate("example.com", "User-agent: *\nDisallow: /\n");
        // TTL of zero expires immediately, falling back to default-allow
        assert!(cache.get("example.com").is_none());
        assert!(cache.is_allowed("example.com", "https://example.com/", UA));
    }

    #[test]
    fn unparseable_body_caches_sentinel_that_allows() {
        let cache = RobotsCache::new();
        cache.populate("example.com", "bad\0file");
        let entry = cache.get("example.com").unwrap();
        assert!(entry.sentinel);
        assert!(cache.is_allowed("example.com", "https://example.com/", UA));
    }

    #[test]
    fn crawl_delay_prefers_our_group_over_wildcard() {
        let raw = "User-agent: *\nCrawl-delay: 10\n\nUser-agent: crawlgrid\nCrawl-delay: 2\n";
        let cache = RobotsCache::new();
        cache.populate("example.com", raw);
        assert_eq!(cache.crawl_delay("example.com", UA), Some(2));
        assert_eq!(cache.crawl_delay("example.com", "otherbot/1.0"), Some(10));
    }

    #[test]
    fn sitemap_directives_are_extracted() {
        let cache = RobotsCache::new();
        cache.populate(
            "example.com",
            "Sitemap: https://example.com/sitemap.xml\nUser-agent: *\nDisallow:\nsitemap: https://example.com/news.xml\n",
        );
        assert_eq!(
            cache.sitemaps("example.com"),
            vec![
                "https://example.com/sitemap.xml".to_string(),
                "https://example.com/news.xml".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_guard_serializes_per_domain() {
        let cache = Arc::new(RobotsCache::new());
        let guard = cache.fetch_guard("example.com").await;

        let cache2 = Arc::clone(&cache);
        let contender = tokio::spawn(async move {
            let _guard = cache2.fetch_guard("example.com").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
