//! In-process counter buckets. TTLs are enforced lazily: expired buckets
//! are dropped whenever a reader or writer passes by.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crawlgrid_core::StoreError;

use crate::CounterStore;

#[derive(Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<(String, i64), (u64, Instant)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop buckets whose TTL lapsed. Called opportunistically; correctness
    /// does not depend on it since reads filter by expiry too.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, domain: &str, bucket: i64, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry((domain.to_string(), bucket))
            .or_insert((0, now + ttl));
        let (count, expires) = entry.value_mut();
        if *expires <= now {
            // stale bucket id reused after expiry
            *count = 0;
            *expires = now + ttl;
        }
        *count += 1;
        Ok(())
    }

    async fn window_counts(
        &self,
        domain: &str,
        newest: i64,
        n: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(n);
        for i in 0..n as i64 {
            let bucket = newest - (n as i64 - 1) + i;
            let count = self
                .buckets
                .get(&(domain.to_string(), bucket))
                .filter(|entry| entry.value().1 > now)
                .map(|entry| entry.value().0)
                .unwrap_or(0);
            out.push(count);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_accumulate_per_bucket() {
        let store = MemoryCounterStore::new();
        let ttl = Duration::from_secs(120);
        store.incr("example.com", 100, ttl).await.unwrap();
        store.incr("example.com", 100, ttl).await.unwrap();
        store.incr("example.com", 101, ttl).await.unwrap();

        let counts = store.window_counts("example.com", 101, 3).await.unwrap();
        assert_eq!(counts, vec![0, 2, 1]);
    }

    #[tokio::test]
    async fn expired_buckets_read_as_zero() {
        let store = MemoryCounterStore::new();
        store
            .incr("example.com", 100, Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let counts = store.window_counts("example.com", 100, 1).await.unwrap();
        assert_eq!(counts, vec![0]);

        store.sweep();
        assert!(store.buckets.is_empty());
    }
}
