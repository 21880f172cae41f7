//! Per-domain sliding-window rate limiting.
//!
//! The window is the last 60 seconds in 1-second counter buckets keyed by
//! `floor(now)`. `check` sums the window and admits while the sum stays
//! under `qps_limit × 60`; `record` increments the current bucket. The two
//! are deliberately separate calls: races between workers can admit
//! slightly above the limit, which is accepted overshoot.
//!
//! When the coordinator backend is unreachable the limiter fails open after
//! a warning, bounded by a local fallback of one request per domain per
//! second per worker process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crawlgrid_core::StoreError;

pub mod memory;
pub mod postgres;
pub mod robots;

pub use memory::MemoryCounterStore;
pub use postgres::PostgresCounterStore;
pub use robots::{RobotsCache, RobotsEntry};

/// Window span in seconds, partitioned into 1-second buckets.
pub const WINDOW_SECONDS: i64 = 60;

/// Buckets linger this long past the window so laggy readers still see them.
pub const BUCKET_GRACE_SECONDS: i64 = 60;

/// Shared per-domain counter buckets. Implementations only need an atomic
/// per-bucket increment and a bulk window read.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically increment the bucket, arming its TTL on first touch.
    async fn incr(&self, domain: &str, bucket: i64, ttl: Duration) -> Result<(), StoreError>;

    /// Counts for buckets `newest - n + 1 ..= newest`, oldest first. Missing
    /// buckets read as zero.
    async fn window_counts(
        &self,
        domain: &str,
        newest: i64,
        n: usize,
    ) -> Result<Vec<u64>, StoreError>;
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    default_qps: u32,
    overrides: HashMap<String, u32>,
    /// Local last-request timestamps for the fail-open fallback.
    fallback_last_request: DashMap<String, Instant>,
    fallback_warned: AtomicBool,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        default_qps: u32,
        overrides: HashMap<String, u32>,
    ) -> Self {
        Self {
            store,
            default_qps,
            overrides,
            fallback_last_request: DashMap::new(),
            fallback_warned: AtomicBool::new(false),
        }
    }

    pub fn qps_limit(&self, domain: &str) -> u32 {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or(self.default_qps)
    }

    fn current_bucket(now: DateTime<Utc>) -> i64 {
        now.timestamp()
    }

    fn bucket_ttl() -> Duration {
        Duration::from_secs((WINDOW_SECONDS + BUCKET_GRACE_SECONDS) as u64)
    }

    /// Whether one more request to `domain` may proceed now.
    pub async fn check(&self, domain: &str) -> bool {
        self.check_at(domain, Utc::now()).await
    }

    pub async fn check_at(&self, domain: &str, now: DateTime<Utc>) -> bool {
        let newest = Self::current_bucket(now);
        match self
            .store
            .window_counts(domain, newest, WINDOW_SECONDS as usize)
            .await
        {
            Ok(counts) => {
                let total: u64 = counts.iter().sum();
                let per_window = self.qps_limit(domain) as u64 * WINDOW_SECONDS as u64;
                let admitted = total < per_window;
                if !admitted {
                    debug!(domain, total, per_window, "rate limit window saturated");
                }
                admitted
            }
            Err(e) => self.fail_open(domain, e),
        }
    }

    /// Record an admitted request against the current bucket. Recording
    /// failures are logged and swallowed: losing a count must not block
    /// crawling.
    pub async fn record(&self, domain: &str) {
        self.record_at(domain, Utc::now()).await;
    }

    pub async fn record_at(&self, domain: &str, now: DateTime<Utc>) {
        let bucket = Self::current_bucket(now);
        if let Err(e) = self.store.incr(domain, bucket, Self::bucket_ttl()).await {
            warn!(domain, "failed to record request against rate window: {}", e);
        }
    }

    /// When at least one slot frees: the instant the oldest non-zero bucket
    /// leaves the window, or one bucket ahead when the window reads empty.
    pub async fn next_allowed_at(&self, domain: &str) -> DateTime<Utc> {
        let now = Utc::now();
        if self.check_at(domain, now).await {
            return now;
        }
        let newest = Self::current_bucket(now);
        let counts = match self
            .store
            .window_counts(domain, newest, WINDOW_SECONDS as usize)
            .await
        {
            Ok(counts) => counts,
            Err(_) => return now + chrono::Duration::seconds(1),
        };
        let oldest_offset = counts.iter().position(|&c| c > 0);
        match oldest_offset {
            Some(i) => {
                // counts[0] is bucket newest - WINDOW + 1
                let oldest_bucket = newest - WINDOW_SECONDS + 1 + i as i64;
                Utc.timestamp_opt(oldest_bucket + WINDOW_SECONDS, 0)
                    .single()
                    .unwrap_or(now + chrono::Duration::seconds(1))
            }
            None => now + chrono::Duration::seconds(1),
        }
    }

    /// Coordinator down: admit, but no faster than one request per domain
    /// per second from this process.
    fn fail_open(&self, domain: &str, error: StoreError) -> bool {
        if !self.fallback_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "rate-limit coordinator unreachable, failing open with local fallback: {}",
                error
            );
        }
        let now = Instant::now();
        match self.fallback_last_request.entry(domain.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) >= Duration::from_secs(1) {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr(&self, _: &str, _: i64, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn window_counts(&self, _: &str, _: i64, _: usize) -> Result<Vec<u64>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn limiter_with(store: Arc<dyn CounterStore>, qps: u32) -> RateLimiter {
        RateLimiter::new(store, qps, HashMap::new())
    }

    #[tokio::test]
    async fn admits_until_window_is_full() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter_with(store, 1);
        let now = Utc::now();

        // 1 qps over a 60s window admits 60 requests
        for _ in 0..60 {
            assert!(limiter.check_at("example.com", now).await);
            limiter.record_at("example.com", now).await;
        }
        assert!(!limiter.check_at("example.com", now).await);

        // other domains are unaffected
        assert!(limiter.check_at("other.com", now).await);
    }

    #[tokio::test]
    async fn old_buckets_slide_out_of_the_window() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter_with(store, 1);
        let past = Utc::now() - chrono::Duration::seconds(WINDOW_SECONDS + 5);

        for _ in 0..60 {
            limiter.record_at("example.com", past).await;
        }
        // those requests have left the window by now
        assert!(limiter.check("example.com").await);
    }

    #[tokio::test]
    async fn per_domain_override_applies() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut overrides = HashMap::new();
        overrides.insert("slow.com".to_string(), 1u32);
        let limiter = RateLimiter::new(store, 5, overrides);
        assert_eq!(limiter.qps_limit("slow.com"), 1);
        assert_eq!(limiter.qps_limit("fast.com"), 5);
    }

    #[tokio::test]
    async fn next_allowed_at_points_past_the_oldest_bucket() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter_with(store, 1);
        let now = Utc::now();

        for _ in 0..60 {
            limiter.record_at("example.com", now).await;
        }
        let next = limiter.next_allowed_at("example.com").await;
        // every count sits in the current bucket, which leaves the window a
        // full span from now
        assert!(next > now);
        assert!(next <= now + chrono::Duration::seconds(WINDOW_SECONDS + 1));
    }

    #[tokio::test]
    async fn coordinator_outage_fails_open_once_per_second() {
        let limiter = limiter_with(Arc::new(BrokenStore), 10);
        assert!(limiter.check("example.com").await);
        // immediate second request is held back by the local fallback
        assert!(!limiter.check("example.com").await);
    }
}
