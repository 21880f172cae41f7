//! Lease heartbeat and reclaim loops.
//!
//! The heartbeat extends every held lease at an interval strictly below
//! half the TTL, so one missed beat still leaves a full window before
//! expiry. The cleanup loop runs the reclaim sweep on its own cadence,
//! decoupled from any one worker's lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::LeaseManager;

pub struct HeartbeatManager {
    lease: Arc<LeaseManager>,
    heartbeat_interval: Duration,
    cleanup_interval: Duration,
    extension_ttl: ChronoDuration,
    reclaim_batch: usize,
}

impl HeartbeatManager {
    pub fn new(
        lease: Arc<LeaseManager>,
        heartbeat_interval: Duration,
        cleanup_interval: Duration,
        acquisition_ttl: Duration,
        reclaim_batch: usize,
    ) -> Self {
        let half_ttl = acquisition_ttl / 2;
        if heartbeat_interval >= half_ttl {
            warn!(
                heartbeat_secs = heartbeat_interval.as_secs(),
                ttl_secs = acquisition_ttl.as_secs(),
                "heartbeat interval is not below ttl/2, leases may lapse under load"
            );
        }
        Self {
            lease,
            heartbeat_interval,
            cleanup_interval,
            extension_ttl: ChronoDuration::from_std(acquisition_ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600)),
            reclaim_batch,
        }
    }

    /// Spawn both loops; they stop when `shutdown` fires.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        {
            let lease = Arc::clone(&self.lease);
            let interval = self.heartbeat_interval;
            let ttl = self.extension_ttl;
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                info!(interval_secs = interval.as_secs(), "heartbeat loop started");
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("heartbeat loop stopping");
                            break;
                        }
                        _ = tokio::time::sleep(interval) => {
                            extend_all(&lease, ttl).await;
                        }
                    }
                }
            }));
        }

        {
            let lease = Arc::clone(&self.lease);
            let interval = self.cleanup_interval;
            let batch = self.reclaim_batch;
            let mut shutdown = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                info!(interval_secs = interval.as_secs(), "reclaim loop started");
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            info!("reclaim loop stopping");
                            break;
                        }
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = lease.reclaim_expired(batch).await {
                                warn!("reclaim sweep failed: {}", e);
                            }
                        }
                    }
                }
            }));
        }

        handles
    }
}

async fn extend_all(lease: &LeaseManager, ttl: ChronoDuration) {
    let held = lease.held_hashes();
    if held.is_empty() {
        return;
    }
    let mut extended = 0;
    let mut lost = 0;
    for hash in held {
        match lease.extend(&hash, ttl).await {
            Ok(true) => extended += 1,
            Ok(false) => lost += 1,
            Err(e) => {
                warn!(url_hash = %hash, "heartbeat extension error: {}", e);
            }
        }
    }
    debug!(extended, lost, "heartbeat pass complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crawlgrid_core::url::url_hash;
    use crawlgrid_storage::{MemoryStateStore, StateStore};

    #[tokio::test]
    async fn heartbeat_pushes_lease_expiry_forward() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = Arc::new(LeaseManager::new(
            store.clone() as Arc<dyn StateStore>,
            "w1",
            3,
        ));
        lease
            .try_acquire("https://example.com/a", "example.com", ChronoDuration::seconds(2))
            .await
            .unwrap();

        let hash = url_hash("https://example.com/a");
        let before = store.get(&hash).await.unwrap().unwrap().lease_expires_at.unwrap();

        extend_all(&lease, ChronoDuration::seconds(600)).await;

        let after = store.get(&hash).await.unwrap().unwrap().lease_expires_at.unwrap();
        assert!(after > before);
        assert!(after > Utc::now() + ChronoDuration::seconds(500));
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown_signal() {
        let store = Arc::new(MemoryStateStore::new());
        let lease = Arc::new(LeaseManager::new(
            store as Arc<dyn StateStore>,
            "w1",
            3,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = HeartbeatManager::new(
            lease,
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(60),
            100,
        );
        let handles = manager.spawn(&shutdown_tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("loop should stop promptly")
                .unwrap();
        }
    }
}
