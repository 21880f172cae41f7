//! Distributed leasing over the state store.
//!
//! A lease is a time-bounded exclusive claim on a URL record; the store's
//! per-key conditional update is the arbiter, so at most one worker holds a
//! URL at any instant no matter how many processes race. A worker that
//! loses its lease (reclaim won, heartbeat missed) abandons the URL and
//! discards any fetch result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crawlgrid_core::url::url_hash;
use crawlgrid_core::{StoreError, UrlRecord, UrlState};
use crawlgrid_storage::StateStore;

pub mod heartbeat;
pub mod transitions;

pub use heartbeat::HeartbeatManager;

/// Terminal outcome handed to `release`.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Done {
        raw_blob_key: String,
        parsed_blob_key: Option<String>,
    },
    Failed {
        error: String,
        /// Backoff gate for retryable failures; permanent ones leave it out.
        next_eligible_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeaseStats {
    pub acquired: u64,
    pub conflicts: u64,
    pub released: u64,
    pub extend_failures: u64,
    pub reclaimed: u64,
}

#[derive(Default)]
struct LeaseCounters {
    acquired: AtomicU64,
    conflicts: AtomicU64,
    released: AtomicU64,
    extend_failures: AtomicU64,
    reclaimed: AtomicU64,
}

pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    crawler_id: String,
    max_retries: u32,
    held: DashSet<String>,
    counters: LeaseCounters,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StateStore>, crawler_id: impl Into<String>, max_retries: u32) -> Self {
        let crawler_id = crawler_id.into();
        info!(crawler_id = %crawler_id, "lease manager ready");
        Self {
            store,
            crawler_id,
            max_retries,
            held: DashSet::new(),
            counters: LeaseCounters::default(),
        }
    }

    pub fn crawler_id(&self) -> &str {
        &self.crawler_id
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn held_hashes(&self) -> Vec<String> {
        self.held.iter().map(|h| h.key().clone()).collect()
    }

    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            extend_failures: self.counters.extend_failures.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Try to claim `url` for `ttl`. Creates the record when absent. Returns
    /// false when another worker holds it, it is done, or its backoff has
    /// not elapsed.
    pub async fn try_acquire(
        &self,
        url: &str,
        domain: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let hash = url_hash(url);
        let now = Utc::now();

        let record = match self.store.get(&hash).await? {
            Some(record) => record,
            None => {
                let record =
                    UrlRecord::new_pending(hash.clone(), url.to_string(), domain.to_string());
                self.store.put_if_absent(&record).await?;
                // re-read: a racer may have created and even acquired it
                match self.store.get(&hash).await? {
                    Some(record) => record,
                    None => return Ok(false),
                }
            }
        };

        // lazily traverse the machine to Pending where the record allows it
        match record.state {
            UrlState::Pending => {}
            UrlState::Failed => {
                let eligible = record.next_eligible_at.map(|t| t <= now).unwrap_or(true);
                if !eligible || record.retry_count >= self.max_retries {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
                let (update, condition) = transitions::retry(self.max_retries);
                if let Err(e) = self.store.update_if(&hash, update, condition).await {
                    return self.acquisition_lost(&hash, e);
                }
            }
            UrlState::InProgress => {
                if !record.is_lease_expired(now) {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
                let (update, condition) = transitions::reclaim(now);
                if let Err(e) = self.store.update_if(&hash, update, condition).await {
                    return self.acquisition_lost(&hash, e);
                }
            }
            UrlState::Done => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
        }

        let (update, condition) = transitions::acquire(&self.crawler_id, ttl, now);
        match self.store.update_if(&hash, update, condition).await {
            Ok(()) => {
                self.held.insert(hash.clone());
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                debug!(url_hash = %hash, "lease acquired");
                Ok(true)
            }
            Err(e) => self.acquisition_lost(&hash, e),
        }
    }

    fn acquisition_lost(&self, hash: &str, error: StoreError) -> Result<bool, StoreError> {
        match error {
            StoreError::Conflict | StoreError::NotFound => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                debug!(url_hash = %hash, "lost lease race");
                Ok(false)
            }
            other => Err(other),
        }
    }

    /// Push the lease expiry out by `additional_ttl`. False means the lease
    /// is gone and the caller must abandon the URL.
    pub async fn extend(&self, url_hash: &str, additional_ttl: Duration) -> Result<bool, StoreError> {
        let (update, condition) = transitions::extend(&self.crawler_id, additional_ttl, Utc::now());
        match self.store.update_if(url_hash, update, condition).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
                warn!(url_hash, "lease no longer held, dropping");
                self.held.remove(url_hash);
                self.counters.extend_failures.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Give a held URL back to Pending without charging a retry, deferring
    /// the next acquire until `next_eligible_at`. Used when admission is
    /// denied after acquisition.
    pub async fn release_pending(
        &self,
        url_hash: &str,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let (update, condition) = transitions::yield_to_pending(&self.crawler_id, next_eligible_at);
        let result = self.store.update_if(url_hash, update, condition).await;
        self.held.remove(url_hash);
        match result {
            Ok(()) | Err(StoreError::Conflict) | Err(StoreError::NotFound) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Terminal transition for a held lease. Returns whether it applied:
    /// once the predicate has been invalidated (e.g. reclaim already
    /// returned the record to Pending) the call is an idempotent no-op and
    /// reports false, so callers discard the fetch result instead of
    /// publishing downstream.
    pub async fn release(
        &self,
        url_hash: &str,
        outcome: ReleaseOutcome,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let result = match outcome {
            ReleaseOutcome::Done {
                raw_blob_key,
                parsed_blob_key,
            } => {
                let (update, condition) =
                    transitions::complete(&self.crawler_id, raw_blob_key, parsed_blob_key, now);
                self.store.update_if(url_hash, update, condition).await
            }
            ReleaseOutcome::Failed {
                error,
                next_eligible_at,
            } => {
                let new_retry_count = match self.store.get(url_hash).await? {
                    Some(record) => record.retry_count + 1,
                    None => 1,
                };
                let (update, condition) =
                    transitions::fail(&self.crawler_id, error, new_retry_count, next_eligible_at);
                self.store.update_if(url_hash, update, condition).await
            }
        };

        self.held.remove(url_hash);
        match result {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
                debug!(url_hash, "release after lease loss is a no-op");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Shutdown drain: force every held lease to Failed so the reclaim
    /// sweep has nothing to do for this worker. Retry counts are advanced,
    /// but no backoff gate is set, so the work is immediately re-acquirable.
    pub async fn release_all_failed(&self, reason: &str) -> usize {
        let held = self.held_hashes();
        let mut released = 0;
        for hash in held {
            let outcome = ReleaseOutcome::Failed {
                error: reason.to_string(),
                next_eligible_at: None,
            };
            match self.release(&hash, outcome).await {
                Ok(_) => released += 1,
                Err(e) => warn!(url_hash = %hash, "failed to force-release lease: {}", e),
            }
        }
        if released > 0 {
            info!(released, "force-released held leases");
        }
        released
    }

    /// Sweep expired in-progress records back to Pending. Safe to run from
    /// any process on any schedule; re-running over an already-reclaimed
    /// record is a no-op.
    pub async fn reclaim_expired(&self, limit: usize) -> Result<usize, StoreError> {
        let now = Utc::now();
        let expired = self.store.scan_expired_leases(now, limit).await?;
        let mut reclaimed = 0;
        for record in expired {
            let (update, condition) = transitions::reclaim(now);
            match self.store.update_if(&record.url_hash, update, condition).await {
                Ok(()) => {
                    reclaimed += 1;
                    debug!(url_hash = %record.url_hash, "expired lease reclaimed");
                }
                Err(StoreError::Conflict) | Err(StoreError::NotFound) => continue,
                Err(e) => {
                    warn!(url_hash = %record.url_hash, "reclaim failed: {}", e);
                    continue;
                }
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "reclaim sweep complete");
            self.counters
                .reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlgrid_storage::MemoryStateStore;

    const URL: &str = "https://example.com/a";
    const DOMAIN: &str = "example.com";

    fn manager(store: &Arc<MemoryStateStore>, id: &str) -> LeaseManager {
        LeaseManager::new(store.clone() as Arc<dyn StateStore>, id, 3)
    }

    #[tokio::test]
    async fn acquire_creates_and_claims_an_unknown_url() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");

        assert!(lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
        assert_eq!(lease.held_count(), 1);

        let record = store.get(&url_hash(URL)).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::InProgress);
        assert_eq!(record.lease_holder.as_deref(), Some("w1"));
        assert!(record.lease_expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn second_worker_loses_the_race() {
        let store = Arc::new(MemoryStateStore::new());
        let w1 = manager(&store, "w1");
        let w2 = manager(&store, "w2");

        assert!(w1.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
        assert!(!w2.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
        assert_eq!(w2.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn complete_sets_blob_key_and_clears_lease() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();

        let hash = url_hash(URL);
        lease
            .release(
                &hash,
                ReleaseOutcome::Done {
                    raw_blob_key: "2026/08/01/x.html".into(),
                    parsed_blob_key: None,
                },
            )
            .await
            .unwrap();

        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Done);
        assert!(record.lease_holder.is_none());
        assert_eq!(record.raw_blob_key.as_deref(), Some("2026/08/01/x.html"));
        assert!(record.last_crawled_at.is_some());
        assert_eq!(lease.held_count(), 0);

        // a done URL is not re-acquirable
        assert!(!lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_release_increments_retry_and_gates_on_backoff() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();

        let hash = url_hash(URL);
        let eligible_at = Utc::now() + Duration::seconds(120);
        lease
            .release(
                &hash,
                ReleaseOutcome::Failed {
                    error: "HTTP status 503".into(),
                    next_eligible_at: Some(eligible_at),
                },
            )
            .await
            .unwrap();

        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.next_eligible_at, Some(eligible_at));

        // backoff has not elapsed: not acquirable yet
        assert!(!lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_url_is_reacquirable_after_backoff() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();

        let hash = url_hash(URL);
        lease
            .release(
                &hash,
                ReleaseOutcome::Failed {
                    error: "HTTP status 503".into(),
                    next_eligible_at: Some(Utc::now() - Duration::seconds(1)),
                },
            )
            .await
            .unwrap();

        assert!(lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::InProgress);
        assert_eq!(record.retry_count, 1, "retry count survives re-acquisition");
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_after_max_retries() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        let hash = url_hash(URL);

        for _ in 0..3 {
            assert!(lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
            lease
                .release(
                    &hash,
                    ReleaseOutcome::Failed {
                        error: "HTTP status 503".into(),
                        next_eligible_at: None,
                    },
                )
                .await
                .unwrap();
        }

        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 3);
        // budget spent: max_retries = 3 allows 3 acquisitions total
        assert!(!lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_returns_expired_lease_to_pending() {
        let store = Arc::new(MemoryStateStore::new());
        let w1 = manager(&store, "w1");
        let w2 = manager(&store, "w2");

        // w1 takes a lease that expires immediately, simulating a crash
        assert!(w1.try_acquire(URL, DOMAIN, Duration::seconds(-1)).await.unwrap());

        let reclaimed = w2.reclaim_expired(100).await.unwrap();
        assert_eq!(reclaimed, 1);

        let hash = url_hash(URL);
        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Pending);
        assert!(record.lease_holder.is_none());
        assert_eq!(record.retry_count, 0, "a crash is not a classified failure");

        // second sweep is a no-op
        assert_eq!(w2.reclaim_expired(100).await.unwrap(), 0);

        // w2 can now pick it up
        assert!(w2.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn extend_fails_once_the_lease_was_reclaimed() {
        let store = Arc::new(MemoryStateStore::new());
        let w1 = manager(&store, "w1");
        let w2 = manager(&store, "w2");

        assert!(w1.try_acquire(URL, DOMAIN, Duration::seconds(-1)).await.unwrap());
        w2.reclaim_expired(100).await.unwrap();

        let hash = url_hash(URL);
        assert!(!w1.extend(&hash, Duration::seconds(60)).await.unwrap());
        assert_eq!(w1.held_count(), 0);

        // release after loss is the idempotent no-op and reports it
        let applied = w1
            .release(
                &hash,
                ReleaseOutcome::Done {
                    raw_blob_key: "k".into(),
                    parsed_blob_key: None,
                },
            )
            .await
            .unwrap();
        assert!(!applied, "a lost lease must not complete the record");
        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Pending, "stale release had no effect");
    }

    #[tokio::test]
    async fn double_release_has_no_further_effect() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();

        let hash = url_hash(URL);
        let done = ReleaseOutcome::Done {
            raw_blob_key: "k1".into(),
            parsed_blob_key: None,
        };
        assert!(lease.release(&hash, done).await.unwrap());

        let again = ReleaseOutcome::Failed {
            error: "late failure".into(),
            next_eligible_at: None,
        };
        assert!(!lease.release(&hash, again).await.unwrap());

        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Done);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.raw_blob_key.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn yielded_lease_returns_to_pending_without_retry_charge() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();

        let hash = url_hash(URL);
        let resume_at = Utc::now() + Duration::seconds(30);
        lease.release_pending(&hash, Some(resume_at)).await.unwrap();

        let record = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Pending);
        assert!(record.lease_holder.is_none());
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.next_eligible_at, Some(resume_at));
        assert_eq!(lease.held_count(), 0);

        // not acquirable until the deferral elapses
        assert!(!lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_drain_force_fails_held_leases() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = manager(&store, "w1");
        lease.try_acquire(URL, DOMAIN, Duration::seconds(60)).await.unwrap();
        lease
            .try_acquire("https://example.com/b", DOMAIN, Duration::seconds(60))
            .await
            .unwrap();

        let released = lease.release_all_failed("worker shutdown").await;
        assert_eq!(released, 2);
        assert_eq!(lease.held_count(), 0);

        let record = store.get(&url_hash(URL)).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("worker shutdown"));
    }
}
