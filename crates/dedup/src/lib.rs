//! Two-stage URL deduplication.
//!
//! Stage 1 is an approximate membership filter: rotating bloom generations,
//! where `contains` consults every live generation and `add` writes the
//! newest. Rotation drops the oldest generation so entries age out without
//! explicit deletes. False positives are resolved by stage 2, an
//! authoritative `batch_get` against the state store; a false negative
//! (possible after rotation) re-admits a known URL, which the
//! insert-if-absent record seed and the lease gate then neutralize.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use growable_bloom_filter::GrowableBloom;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crawlgrid_core::url::{normalize_url, url_hash};
use crawlgrid_storage::{StateStore, BATCH_GET_LIMIT};

/// Rotating approximate set. Each generation is a growable bloom filter;
/// `max_generations` bounds how long an entry is remembered.
pub struct BloomGenerations {
    generations: Mutex<VecDeque<GrowableBloom>>,
    max_generations: usize,
    fp_rate: f64,
    capacity_hint: usize,
}

impl BloomGenerations {
    pub fn new(max_generations: usize, fp_rate: f64, capacity_hint: usize) -> Self {
        let max_generations = max_generations.max(1);
        let mut generations = VecDeque::with_capacity(max_generations);
        generations.push_front(GrowableBloom::new(fp_rate, capacity_hint));
        Self {
            generations: Mutex::new(generations),
            max_generations,
            fp_rate,
            capacity_hint,
        }
    }

    pub async fn contains(&self, hash: &str) -> bool {
        let generations = self.generations.lock().await;
        generations.iter().any(|bloom| bloom.contains(hash))
    }

    pub async fn add(&self, hash: &str) {
        let mut generations = self.generations.lock().await;
        if let Some(newest) = generations.front_mut() {
            newest.insert(hash);
        }
    }

    /// Start a fresh generation and drop the oldest beyond the bound.
    pub async fn rotate(&self) {
        let mut generations = self.generations.lock().await;
        generations.push_front(GrowableBloom::new(self.fp_rate, self.capacity_hint));
        while generations.len() > self.max_generations {
            generations.pop_back();
        }
        debug!(generations = generations.len(), "rotated bloom generations");
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub processed: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub bloom_hits: usize,
    pub bloom_misses: usize,
    pub store_checks: usize,
}

/// A URL that survived deduplication, with its derived identity.
#[derive(Debug, Clone)]
pub struct NewUrl {
    pub url: String,
    pub url_hash: String,
}

pub struct Deduplicator {
    store: Arc<dyn StateStore>,
    /// Stage 1 is optional: without it every candidate goes to the store.
    bloom: Option<Arc<BloomGenerations>>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn StateStore>, bloom: Option<Arc<BloomGenerations>>) -> Self {
        Self { store, bloom }
    }

    /// Partition `urls` into never-seen URLs and everything else.
    ///
    /// Invalid URLs are dropped and counted. The result carries normalized
    /// URLs; callers create records and queue messages from these.
    pub async fn deduplicate(&self, urls: &[String]) -> (Vec<NewUrl>, DedupStats) {
        let mut stats = DedupStats {
            processed: urls.len(),
            ..Default::default()
        };

        // normalize and drop in-batch duplicates
        let mut seen_in_batch = HashSet::new();
        let mut candidates: Vec<NewUrl> = Vec::with_capacity(urls.len());
        for raw in urls {
            let normalized = match normalize_url(raw) {
                Ok(normalized) => normalized,
                Err(_) => {
                    stats.invalid += 1;
                    continue;
                }
            };
            let hash = url_hash(&normalized);
            if seen_in_batch.insert(hash.clone()) {
                candidates.push(NewUrl {
                    url: normalized,
                    url_hash: hash,
                });
            }
        }

        // stage 1: approximate filter
        let mut fresh: Vec<NewUrl> = Vec::new();
        let mut maybe_seen: Vec<NewUrl> = Vec::new();
        match &self.bloom {
            Some(bloom) => {
                for candidate in candidates {
                    if bloom.contains(&candidate.url_hash).await {
                        stats.bloom_hits += 1;
                        maybe_seen.push(candidate);
                    } else {
                        stats.bloom_misses += 1;
                        fresh.push(candidate);
                    }
                }
            }
            None => maybe_seen = candidates,
        }

        // stage 2: authoritative store lookup for the filter hits
        for chunk in maybe_seen.chunks(BATCH_GET_LIMIT) {
            let hashes: Vec<String> = chunk.iter().map(|c| c.url_hash.clone()).collect();
            stats.store_checks += hashes.len();
            match self.store.batch_get(&hashes).await {
                Ok(known) => {
                    for candidate in chunk {
                        if !known.contains_key(&candidate.url_hash) {
                            fresh.push(candidate.clone());
                        }
                    }
                }
                Err(e) => {
                    // can't confirm novelty: treat the chunk as duplicates
                    // rather than re-enqueueing possibly-known URLs
                    warn!("authoritative dedup check failed, dropping chunk: {}", e);
                }
            }
        }

        // remember the survivors
        if let Some(bloom) = &self.bloom {
            for candidate in &fresh {
                bloom.add(&candidate.url_hash).await;
            }
        }

        stats.unique = fresh.len();
        stats.duplicates = stats.processed - stats.invalid - stats.unique;
        (fresh, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlgrid_core::UrlRecord;
    use crawlgrid_storage::MemoryStateStore;

    fn deduper(bloom: bool) -> (Deduplicator, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let stage1 = bloom.then(|| Arc::new(BloomGenerations::new(3, 0.001, 10_000)));
        (
            Deduplicator::new(store.clone() as Arc<dyn StateStore>, stage1),
            store,
        )
    }

    #[tokio::test]
    async fn repeated_input_collapses_to_one() {
        let (dedup, _) = deduper(true);
        let urls = vec![
            "https://example.com/a".to_string(),
            "https://example.com/a".to_string(),
            "https://example.com/a/".to_string(), // same after normalization
        ];
        let (fresh, stats) = dedup.deduplicate(&urls).await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(stats.unique, 1);
        assert_eq!(stats.duplicates, 2);
    }

    #[tokio::test]
    async fn second_pass_finds_nothing_new() {
        let (dedup, store) = deduper(true);
        let urls = vec![
            "https://example.com/a".to_string(),
            "https://example.com/b".to_string(),
        ];

        let (fresh, _) = dedup.deduplicate(&urls).await;
        assert_eq!(fresh.len(), 2);

        // discovery persists the survivors, as the coordinator would
        let records: Vec<UrlRecord> = fresh
            .iter()
            .map(|n| UrlRecord::new_pending(n.url_hash.clone(), n.url.clone(), "example.com".into()))
            .collect();
        store.batch_put(&records).await.unwrap();

        let (again, stats) = dedup.deduplicate(&urls).await;
        assert!(again.is_empty());
        assert_eq!(stats.duplicates, 2);
    }

    #[tokio::test]
    async fn store_known_urls_are_duplicates_even_without_bloom() {
        let (dedup, store) = deduper(false);
        let known = UrlRecord::new_pending(
            url_hash("https://example.com/known"),
            "https://example.com/known".into(),
            "example.com".into(),
        );
        store.put_if_absent(&known).await.unwrap();

        let urls = vec![
            "https://example.com/known".to_string(),
            "https://example.com/new".to_string(),
        ];
        let (fresh, stats) = dedup.deduplicate(&urls).await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].url, "https://example.com/new");
        assert_eq!(stats.store_checks, 2);
    }

    #[tokio::test]
    async fn invalid_urls_are_dropped_and_counted() {
        let (dedup, _) = deduper(true);
        let urls = vec![
            "ftp://example.com/file".to_string(),
            "https://example.com/ok".to_string(),
        ];
        let (fresh, stats) = dedup.deduplicate(&urls).await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.duplicates, 0);
    }

    #[tokio::test]
    async fn rotation_ages_entries_out_of_the_filter() {
        let bloom = BloomGenerations::new(2, 0.001, 1000);
        bloom.add("h1").await;
        assert!(bloom.contains("h1").await);

        bloom.rotate().await;
        assert!(bloom.contains("h1").await, "still in the previous generation");

        bloom.rotate().await;
        assert!(!bloom.contains("h1").await, "aged out after two rotations");
    }
}
