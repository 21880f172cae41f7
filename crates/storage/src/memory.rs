//! In-process state store for development and tests.
//!
//! DashMap entries give exclusive access to one key while held, which is all
//! `update_if` needs for its per-key atomicity guarantee.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crawlgrid_core::{StoreError, UrlRecord, UrlState};

use crate::{RecordUpdate, StateStore, UpdateCondition};

#[derive(Default)]
pub struct MemoryStateStore {
    records: DashMap<String, UrlRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, StoreError> {
        Ok(self.records.get(url_hash).map(|r| r.clone()))
    }

    async fn put_if_absent(&self, record: &UrlRecord) -> Result<bool, StoreError> {
        match self.records.entry(record.url_hash.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn update_if(
        &self,
        url_hash: &str,
        update: RecordUpdate,
        condition: UpdateCondition,
    ) -> Result<(), StoreError> {
        match self.records.entry(url_hash.to_string()) {
            Entry::Vacant(_) => Err(StoreError::NotFound),
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if !condition.matches(record) {
                    return Err(StoreError::Conflict);
                }
                update.apply(record, Utc::now());
                Ok(())
            }
        }
    }

    async fn query_by_domain_state(
        &self,
        domain: &str,
        state: UrlState,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            if entry.domain == domain && entry.state == state {
                out.push(entry.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn batch_get(
        &self,
        url_hashes: &[String],
    ) -> Result<HashMap<String, UrlRecord>, StoreError> {
        let mut out = HashMap::with_capacity(url_hashes.len());
        for hash in url_hashes {
            if let Some(record) = self.records.get(hash) {
                out.insert(hash.clone(), record.clone());
            }
        }
        Ok(out)
    }

    async fn batch_put(&self, records: &[UrlRecord]) -> Result<(), StoreError> {
        for record in records {
            if let Entry::Vacant(slot) = self.records.entry(record.url_hash.clone()) {
                slot.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.records.iter() {
            if entry.is_lease_expired(now) {
                out.push(entry.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pending(hash: &str, domain: &str) -> UrlRecord {
        UrlRecord::new_pending(
            hash.to_string(),
            format!("https://{domain}/{hash}"),
            domain.to_string(),
        )
    }

    #[tokio::test]
    async fn put_if_absent_is_create_once() {
        let store = MemoryStateStore::new();
        let record = pending("a1", "example.com");
        assert!(store.put_if_absent(&record).await.unwrap());
        assert!(!store.put_if_absent(&record).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_if_rejects_false_predicate() {
        let store = MemoryStateStore::new();
        store.put_if_absent(&pending("a1", "example.com")).await.unwrap();

        let cond = UpdateCondition {
            state_is: Some(UrlState::InProgress),
            ..Default::default()
        };
        let err = store
            .update_if("a1", RecordUpdate::default(), cond)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));

        let err = store
            .update_if("missing", RecordUpdate::default(), UpdateCondition::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one() {
        let store = Arc::new(MemoryStateStore::new());
        store.put_if_absent(&pending("a1", "example.com")).await.unwrap();

        let now = Utc::now();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let update = RecordUpdate {
                    state: Some(UrlState::InProgress),
                    lease_holder: Some(Some(format!("worker-{worker}"))),
                    lease_acquired_at: Some(Some(now)),
                    lease_expires_at: Some(Some(now + chrono::Duration::seconds(60))),
                    ..Default::default()
                };
                let cond = UpdateCondition {
                    state_is: Some(UrlState::Pending),
                    lease_free_or_expired_by: Some(now),
                    ..Default::default()
                };
                store.update_if("a1", update, cond).await.is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1, "exactly one worker may win the lease race");

        let record = store.get("a1").await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::InProgress);
        assert!(record.lease_holder.is_some());
    }

    #[tokio::test]
    async fn domain_state_query_and_expired_scan() {
        let store = MemoryStateStore::new();
        let now = Utc::now();

        store.put_if_absent(&pending("a1", "example.com")).await.unwrap();
        store.put_if_absent(&pending("a2", "example.com")).await.unwrap();
        store.put_if_absent(&pending("b1", "other.com")).await.unwrap();

        let mut expired = pending("c1", "example.com");
        expired.state = UrlState::InProgress;
        expired.lease_holder = Some("w-dead".into());
        expired.lease_expires_at = Some(now - chrono::Duration::seconds(5));
        store.batch_put(std::slice::from_ref(&expired)).await.unwrap();

        let pending_in_domain = store
            .query_by_domain_state("example.com", UrlState::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending_in_domain.len(), 2);

        let stale = store.scan_expired_leases(now, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].url_hash, "c1");
    }

    #[tokio::test]
    async fn batch_get_skips_missing_keys() {
        let store = MemoryStateStore::new();
        store.put_if_absent(&pending("a1", "example.com")).await.unwrap();
        let found = store
            .batch_get(&["a1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("a1"));
    }
}
