//! State and blob storage adapters.
//!
//! The state store is the only source of truth for URL state. All mutations
//! go through `update_if`, which is atomic and linearizable per key; nothing
//! here relies on cross-key transactions. Backends are interchangeable:
//! `MemoryStateStore` for single-process development and tests,
//! `PostgresStateStore` for shared deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crawlgrid_core::{StoreError, UrlRecord, UrlState};

pub mod blob;
pub mod memory;
pub mod postgres;

pub use blob::{blob_key, BlobStore, FsBlobStore, MemoryBlobStore};
pub use memory::MemoryStateStore;
pub use postgres::PostgresStateStore;

/// Backend batch-read ceiling; `batch_get` callers chunk at this size.
pub const BATCH_GET_LIMIT: usize = 100;

/// Predicate evaluated against the stored record inside the atomic update.
/// All set fields must hold; an empty condition always matches.
#[derive(Debug, Clone, Default)]
pub struct UpdateCondition {
    /// `state == value`
    pub state_is: Option<UrlState>,
    /// `lease_holder == value`
    pub lease_holder_is: Option<String>,
    /// `lease_expires_at` absent or `<= value`
    pub lease_expired_by: Option<DateTime<Utc>>,
    /// no lease holder, or `lease_expires_at <= value`
    pub lease_free_or_expired_by: Option<DateTime<Utc>>,
    /// `next_eligible_at` absent or `<= value`
    pub next_eligible_by: Option<DateTime<Utc>>,
    /// `retry_count < value`
    pub retry_count_below: Option<u32>,
}

impl UpdateCondition {
    pub fn matches(&self, record: &UrlRecord) -> bool {
        if let Some(state) = self.state_is {
            if record.state != state {
                return false;
            }
        }
        if let Some(holder) = &self.lease_holder_is {
            if record.lease_holder.as_deref() != Some(holder.as_str()) {
                return false;
            }
        }
        if let Some(by) = self.lease_expired_by {
            if record.lease_expires_at.map(|t| t > by).unwrap_or(false) {
                return false;
            }
        }
        if let Some(by) = self.lease_free_or_expired_by {
            let free = record.lease_holder.is_none();
            let expired = record.lease_expires_at.map(|t| t <= by).unwrap_or(true);
            if !free && !expired {
                return false;
            }
        }
        if let Some(by) = self.next_eligible_by {
            if record.next_eligible_at.map(|t| t > by).unwrap_or(false) {
                return false;
            }
        }
        if let Some(below) = self.retry_count_below {
            if record.retry_count >= below {
                return false;
            }
        }
        true
    }
}

/// Partial update applied when the condition holds. Outer `None` leaves the
/// field alone; `Some(None)` on the nested options clears it.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub state: Option<UrlState>,
    pub lease_holder: Option<Option<String>>,
    pub lease_acquired_at: Option<Option<DateTime<Utc>>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub raw_blob_key: Option<String>,
    pub parsed_blob_key: Option<String>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub next_eligible_at: Option<Option<DateTime<Utc>>>,
}

impl RecordUpdate {
    pub fn apply(&self, record: &mut UrlRecord, now: DateTime<Utc>) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(holder) = &self.lease_holder {
            record.lease_holder = holder.clone();
        }
        if let Some(at) = self.lease_acquired_at {
            record.lease_acquired_at = at;
        }
        if let Some(at) = self.lease_expires_at {
            record.lease_expires_at = at;
        }
        if let Some(at) = self.last_crawled_at {
            record.last_crawled_at = Some(at);
        }
        if let Some(key) = &self.raw_blob_key {
            record.raw_blob_key = Some(key.clone());
        }
        if let Some(key) = &self.parsed_blob_key {
            record.parsed_blob_key = Some(key.clone());
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(err) = &self.last_error {
            record.last_error = err.clone();
        }
        if let Some(at) = self.next_eligible_at {
            record.next_eligible_at = at;
        }
        record.updated_at = now;
    }
}

/// Key/value store for `UrlRecord`s with per-key conditional updates.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, StoreError>;

    /// Create the record unless one already exists. Returns whether it was
    /// created.
    async fn put_if_absent(&self, record: &UrlRecord) -> Result<bool, StoreError>;

    /// Atomically apply `update` iff `condition` holds against the stored
    /// record. `Conflict` when the predicate is false, `NotFound` when the
    /// key is absent.
    async fn update_if(
        &self,
        url_hash: &str,
        update: RecordUpdate,
        condition: UpdateCondition,
    ) -> Result<(), StoreError>;

    async fn query_by_domain_state(
        &self,
        domain: &str,
        state: UrlState,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError>;

    /// Bulk read; absent keys are simply missing from the result. Callers
    /// chunk at `BATCH_GET_LIMIT`.
    async fn batch_get(
        &self,
        url_hashes: &[String],
    ) -> Result<HashMap<String, UrlRecord>, StoreError>;

    /// Bulk insert used by discovery to seed pending records. Existing
    /// records are left untouched so a stale "new" verdict from the
    /// approximate filter can never clobber live state.
    async fn batch_put(&self, records: &[UrlRecord]) -> Result<(), StoreError>;

    /// In-progress records whose lease expired at or before `now`, for the
    /// reclaim sweep.
    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UrlRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: UrlState) -> UrlRecord {
        let mut r = UrlRecord::new_pending(
            "h".repeat(64),
            "https://example.com/a".into(),
            "example.com".into(),
        );
        r.state = state;
        r
    }

    #[test]
    fn empty_condition_always_matches() {
        assert!(UpdateCondition::default().matches(&record(UrlState::Pending)));
    }

    #[test]
    fn lease_free_or_expired_condition() {
        let now = Utc::now();
        let mut r = record(UrlState::Pending);
        let cond = UpdateCondition {
            lease_free_or_expired_by: Some(now),
            ..Default::default()
        };
        // no holder at all
        assert!(cond.matches(&r));

        // live lease blocks
        r.lease_holder = Some("w1".into());
        r.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!cond.matches(&r));

        // expired lease passes
        r.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(cond.matches(&r));
    }

    #[test]
    fn next_eligible_gate() {
        let now = Utc::now();
        let mut r = record(UrlState::Pending);
        let cond = UpdateCondition {
            next_eligible_by: Some(now),
            ..Default::default()
        };
        assert!(cond.matches(&r));
        r.next_eligible_at = Some(now + chrono::Duration::seconds(10));
        assert!(!cond.matches(&r));
        r.next_eligible_at = Some(now - chrono::Duration::seconds(10));
        assert!(cond.matches(&r));
    }

    #[test]
    fn update_clears_lease_fields() {
        let now = Utc::now();
        let mut r = record(UrlState::InProgress);
        r.lease_holder = Some("w1".into());
        r.lease_expires_at = Some(now);

        let update = RecordUpdate {
            state: Some(UrlState::Done),
            lease_holder: Some(None),
            lease_expires_at: Some(None),
            raw_blob_key: Some("2026/08/01/abc.html".into()),
            ..Default::default()
        };
        update.apply(&mut r, now);
        assert_eq!(r.state, UrlState::Done);
        assert!(r.lease_holder.is_none());
        assert!(r.lease_expires_at.is_none());
        assert_eq!(r.raw_blob_key.as_deref(), Some("2026/08/01/abc.html"));
        assert_eq!(r.updated_at, now);
    }
}
