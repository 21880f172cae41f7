//! The URL state machine as data.
//!
//! Each function builds the (update, condition) pair for one permitted
//! transition; the store's conditional update enforces it atomically.
//! Forbidden edges (Pending→Done, Pending→Failed, Done→InProgress) simply
//! have no constructor here.

use chrono::{DateTime, Duration, Utc};

use crawlgrid_core::UrlState;
use crawlgrid_storage::{RecordUpdate, UpdateCondition};

/// Pending → InProgress. Honors the retry backoff gate and only steals a
/// lease that is absent or already expired.
pub fn acquire(
    worker_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::InProgress),
        lease_holder: Some(Some(worker_id.to_string())),
        lease_acquired_at: Some(Some(now)),
        lease_expires_at: Some(Some(now + ttl)),
        ..Default::default()
    };
    let condition = UpdateCondition {
        state_is: Some(UrlState::Pending),
        lease_free_or_expired_by: Some(now),
        next_eligible_by: Some(now),
        ..Default::default()
    };
    (update, condition)
}

/// InProgress → Done, by the holder only. The raw blob key is mandatory:
/// a Done record always references its payload.
pub fn complete(
    worker_id: &str,
    raw_blob_key: String,
    parsed_blob_key: Option<String>,
    now: DateTime<Utc>,
) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Done),
        lease_holder: Some(None),
        lease_acquired_at: Some(None),
        lease_expires_at: Some(None),
        last_crawled_at: Some(now),
        raw_blob_key: Some(raw_blob_key),
        parsed_blob_key,
        last_error: Some(None),
        next_eligible_at: Some(None),
        ..Default::default()
    };
    let condition = holder_condition(worker_id);
    (update, condition)
}

/// InProgress → Failed, by the holder only. `next_eligible_at` carries the
/// backoff for retryable failures; permanent failures leave it unset.
pub fn fail(
    worker_id: &str,
    error: String,
    new_retry_count: u32,
    next_eligible_at: Option<DateTime<Utc>>,
) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Failed),
        lease_holder: Some(None),
        lease_acquired_at: Some(None),
        lease_expires_at: Some(None),
        retry_count: Some(new_retry_count),
        last_error: Some(Some(error)),
        next_eligible_at: Some(next_eligible_at),
        ..Default::default()
    };
    let condition = holder_condition(worker_id);
    (update, condition)
}

/// InProgress → Pending, for records whose lease expired. Idempotent:
/// a second reclaim fails its predicate and is a no-op. The retry count is
/// untouched, a crash is not a classified failure.
pub fn reclaim(now: DateTime<Utc>) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Pending),
        lease_holder: Some(None),
        lease_acquired_at: Some(None),
        lease_expires_at: Some(None),
        ..Default::default()
    };
    let condition = UpdateCondition {
        state_is: Some(UrlState::InProgress),
        lease_expired_by: Some(now),
        ..Default::default()
    };
    (update, condition)
}

/// Failed → Pending, only while retry budget remains. `next_eligible_at`
/// stays as the failure wrote it, so the acquire gate still observes the
/// backoff.
pub fn retry(max_retries: u32) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Pending),
        ..Default::default()
    };
    let condition = UpdateCondition {
        state_is: Some(UrlState::Failed),
        retry_count_below: Some(max_retries),
        ..Default::default()
    };
    (update, condition)
}

/// Done → Pending, operator re-seeding only.
pub fn recrawl() -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Pending),
        next_eligible_at: Some(None),
        ..Default::default()
    };
    let condition = UpdateCondition {
        state_is: Some(UrlState::Done),
        ..Default::default()
    };
    (update, condition)
}

/// InProgress → Pending by the holder itself: the worker gives the URL
/// back untouched (no retry charged) when it cannot proceed yet, e.g. a
/// denied rate-limit admission. `next_eligible_at` defers the next acquire.
pub fn yield_to_pending(
    worker_id: &str,
    next_eligible_at: Option<DateTime<Utc>>,
) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        state: Some(UrlState::Pending),
        lease_holder: Some(None),
        lease_acquired_at: Some(None),
        lease_expires_at: Some(None),
        next_eligible_at: Some(next_eligible_at),
        ..Default::default()
    };
    let condition = holder_condition(worker_id);
    (update, condition)
}

/// Extend the holder's lease without touching anything else.
pub fn extend(
    worker_id: &str,
    additional_ttl: Duration,
    now: DateTime<Utc>,
) -> (RecordUpdate, UpdateCondition) {
    let update = RecordUpdate {
        lease_expires_at: Some(Some(now + additional_ttl)),
        ..Default::default()
    };
    let condition = holder_condition(worker_id);
    (update, condition)
}

fn holder_condition(worker_id: &str) -> UpdateCondition {
    UpdateCondition {
        state_is: Some(UrlState::InProgress),
        lease_holder_is: Some(worker_id.to_string()),
        ..Default::default()
    }
}
