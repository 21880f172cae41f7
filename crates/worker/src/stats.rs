//! Worker counters, exported on the metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;

use crawlgrid_core::ErrorKind;

#[derive(Default)]
pub struct WorkerStats {
    pub messages_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub messages_failed: AtomicU64,
    pub urls_crawled: AtomicU64,
    pub urls_succeeded: AtomicU64,
    pub urls_failed: AtomicU64,
    pub locks_acquired: AtomicU64,
    pub locks_failed: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub indexing_published: AtomicU64,
    task_duration_ms_total: AtomicU64,
    task_count: AtomicU64,
    errors_by_kind: DashMap<ErrorKind, u64>,
    domains: DashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub urls_crawled: u64,
    pub urls_succeeded: u64,
    pub urls_failed: u64,
    pub locks_acquired: u64,
    pub locks_failed: u64,
    pub retries_scheduled: u64,
    pub indexing_published: u64,
    pub domains_processed: usize,
    pub average_task_duration_ms: u64,
    pub errors_by_kind: std::collections::HashMap<String, u64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_url_crawled(&self, success: bool, domain: &str) {
        self.urls_crawled.fetch_add(1, Ordering::Relaxed);
        if success {
            self.urls_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.urls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.domains.insert(domain.to_string());
    }

    pub fn record_lock_attempt(&self, acquired: bool) {
        if acquired {
            self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.locks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, kind: ErrorKind) {
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn record_task_duration(&self, millis: u64) {
        self.task_duration_ms_total.fetch_add(millis, Ordering::Relaxed);
        self.task_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, started_at: DateTime<Utc>) -> WorkerStatsSnapshot {
        let task_count = self.task_count.load(Ordering::Relaxed).max(1);
        WorkerStatsSnapshot {
            started_at,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            urls_crawled: self.urls_crawled.load(Ordering::Relaxed),
            urls_succeeded: self.urls_succeeded.load(Ordering::Relaxed),
            urls_failed: self.urls_failed.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_failed: self.locks_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            indexing_published: self.indexing_published.load(Ordering::Relaxed),
            domains_processed: self.domains.len(),
            average_task_duration_ms: self.task_duration_ms_total.load(Ordering::Relaxed)
                / task_count,
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_counters() {
        let stats = WorkerStats::new();
        stats.messages_received.fetch_add(3, Ordering::Relaxed);
        stats.record_url_crawled(true, "a.com");
        stats.record_url_crawled(false, "b.com");
        stats.record_url_crawled(true, "a.com");
        stats.record_lock_attempt(true);
        stats.record_lock_attempt(false);
        stats.record_error(ErrorKind::HttpServer);
        stats.record_error(ErrorKind::HttpServer);
        stats.record_task_duration(100);
        stats.record_task_duration(300);

        let snap = stats.snapshot(Utc::now());
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.urls_crawled, 3);
        assert_eq!(snap.urls_succeeded, 2);
        assert_eq!(snap.domains_processed, 2);
        assert_eq!(snap.average_task_duration_ms, 200);
        assert_eq!(snap.errors_by_kind.get("http_server"), Some(&2));
    }
}
