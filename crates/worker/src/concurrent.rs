//! Two-level concurrency gating for crawl tasks.
//!
//! A task takes the global semaphore first, then its domain's, and the
//! permits drop in reverse order. Domain semaphores are created lazily and
//! swept once idle so the map does not grow with every domain ever seen.
//! Task wall-clock is bounded; exceeding it cancels the future and counts
//! as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crawlgrid_core::CrawlError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConcurrencyStats {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub active_tasks: usize,
    pub peak_concurrency: usize,
    pub total_semaphore_wait_ms: u64,
    pub domains_tracked: usize,
}

pub struct ConcurrentCrawlManager {
    global: Arc<Semaphore>,
    domain_semaphores: DashMap<String, Arc<Semaphore>>,
    max_concurrent_per_domain: usize,
    domain_overrides: HashMap<String, usize>,
    task_timeout: Duration,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    wait_ms: AtomicU64,
}

impl ConcurrentCrawlManager {
    pub fn new(
        max_concurrent: usize,
        max_concurrent_per_domain: usize,
        domain_overrides: HashMap<String, usize>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent.max(1))),
            domain_semaphores: DashMap::new(),
            max_concurrent_per_domain: max_concurrent_per_domain.max(1),
            domain_overrides,
            task_timeout,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            wait_ms: AtomicU64::new(0),
        }
    }

    fn domain_limit(&self, domain: &str) -> usize {
        self.domain_overrides
            .get(domain)
            .copied()
            .unwrap_or(self.max_concurrent_per_domain)
            .max(1)
    }

    fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        self.domain_semaphores
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.domain_limit(domain))))
            .clone()
    }

    /// Run `task` under both gates with the task timeout applied.
    pub async fn run<F, T>(&self, domain: &str, task: F) -> Result<T, CrawlError>
    where
        F: Future<Output = Result<T, CrawlError>>,
    {
        let wait_start = Instant::now();
        let _global_permit = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Other(anyhow::anyhow!("global semaphore closed")))?;
        let _domain_permit = self
            .domain_semaphore(domain)
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Other(anyhow::anyhow!("domain semaphore closed")))?;
        self.wait_ms
            .fetch_add(wait_start.elapsed().as_millis() as u64, Ordering::Relaxed);

        self.started.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(active, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.task_timeout, task).await {
            Ok(Ok(value)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(domain, timeout_secs = self.task_timeout.as_secs(), "crawl task timed out");
                Err(CrawlError::Timeout(self.task_timeout.as_secs()))
            }
        };

        self.active.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Drop domain semaphores with no current holders. Runs on a periodic
    /// sweep; a racing acquire simply recreates the entry.
    pub fn sweep_idle_domains(&self) -> usize {
        let before = self.domain_semaphores.len();
        self.domain_semaphores.retain(|domain, semaphore| {
            let capacity = self.domain_limit(domain);
            semaphore.available_permits() < capacity
        });
        let removed = before - self.domain_semaphores.len();
        if removed > 0 {
            debug!(removed, "swept idle domain semaphores");
        }
        removed
    }

    pub fn current_domain_depth(&self, domain: &str) -> usize {
        match self.domain_semaphores.get(domain) {
            Some(semaphore) => self.domain_limit(domain) - semaphore.available_permits(),
            None => 0,
        }
    }

    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            tasks_started: self.started.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_timed_out: self.timed_out.load(Ordering::Relaxed),
            active_tasks: self.active.load(Ordering::Relaxed),
            peak_concurrency: self.peak.load(Ordering::Relaxed),
            total_semaphore_wait_ms: self.wait_ms.load(Ordering::Relaxed),
            domains_tracked: self.domain_semaphores.len(),
        }
    }
}
