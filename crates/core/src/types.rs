use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a URL record.
///
/// Transitions are guarded by conditional updates on the state store; see
/// the lease crate for the full machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UrlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlState::Pending => "pending",
            UrlState::InProgress => "in_progress",
            UrlState::Done => "done",
            UrlState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<UrlState> {
        match s {
            "pending" => Some(UrlState::Pending),
            "in_progress" => Some(UrlState::InProgress),
            "done" => Some(UrlState::Done),
            "failed" => Some(UrlState::Failed),
            _ => None,
        }
    }

    /// Terminal states expect no further transitions without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UrlState::Done | UrlState::Failed)
    }
}

impl std::fmt::Display for UrlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative state for one normalized URL, keyed by `url_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// SHA-256 of the normalized URL, 64 hex chars. Primary identity.
    pub url_hash: String,
    pub url: String,
    pub domain: String,
    pub state: UrlState,
    /// Worker currently holding the lease. Set iff state is `InProgress`.
    pub lease_holder: Option<String>,
    pub lease_acquired_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub raw_blob_key: Option<String>,
    pub parsed_blob_key: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest instant a retry may be acquired. Absent means immediately.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UrlRecord {
    pub fn new_pending(url_hash: String, url: String, domain: String) -> Self {
        let now = Utc::now();
        Self {
            url_hash,
            url,
            domain,
            state: UrlState::Pending,
            lease_holder: None,
            lease_acquired_at: None,
            lease_expires_at: None,
            last_crawled_at: None,
            raw_blob_key: None,
            parsed_blob_key: None,
            retry_count: 0,
            last_error: None,
            next_eligible_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The lease is live when the record is in progress and its expiry is in
    /// the future.
    pub fn is_lease_live(&self, now: DateTime<Utc>) -> bool {
        self.state == UrlState::InProgress
            && self.lease_holder.is_some()
            && self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == UrlState::InProgress
            && self.lease_expires_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// Message asking the discovery coordinator to enumerate a domain.
/// Idempotent under redelivery: the domain is the natural key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub domain: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_urls: Option<usize>,
    #[serde(default = "default_discovery_depth")]
    pub discovery_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_id: Option<String>,
}

fn default_priority() -> u8 {
    1
}

fn default_discovery_depth() -> u32 {
    3
}

/// One unit of crawl work. Redelivery is harmless: the deduplicator and the
/// lease manager make processing idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlMessage {
    pub url: String,
    pub domain: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_source: Option<String>,
}

/// Handoff to the external indexing pipeline after a successful fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingMessage {
    pub url: String,
    pub url_hash: String,
    pub domain: String,
    pub raw_blob_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_blob_key: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub status_code: u16,
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub processing_priority: u8,
}

/// Wrapper for messages that could not be parsed or routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_message: String,
    pub error_reason: String,
    pub failed_at: DateTime<Utc>,
    pub crawler_id: String,
}

/// One URL extracted from a sitemap, with its optional hints.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapUrl {
    pub url: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub change_frequency: Option<String>,
    pub priority: Option<f64>,
}

/// Classified error kind, used for retry policy and per-kind counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    HttpClient,
    HttpServer,
    RateLimited,
    RobotsBlocked,
    ContentTooLarge,
    Parse,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpClient => "http_client",
            ErrorKind::HttpServer => "http_server",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::RobotsBlocked => "robots_blocked",
            ErrorKind::ContentTooLarge => "content_too_large",
            ErrorKind::Parse => "parse",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs for a single fetch.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_body_size: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_size: 50 * 1024 * 1024,
            user_agent: String::new(),
        }
    }
}

/// What the fetcher hands back for a completed request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub response_time_ms: u64,
}

/// Component health, aggregated into the /healthz payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            UrlState::Pending,
            UrlState::InProgress,
            UrlState::Done,
            UrlState::Failed,
        ] {
            assert_eq!(UrlState::parse(state.as_str()), Some(state));
        }
        assert_eq!(UrlState::parse("bogus"), None);
    }

    #[test]
    fn lease_liveness_tracks_expiry() {
        let mut record = UrlRecord::new_pending(
            "a".repeat(64),
            "https://example.com/a".into(),
            "example.com".into(),
        );
        let now = Utc::now();
        assert!(!record.is_lease_live(now));

        record.state = UrlState::InProgress;
        record.lease_holder = Some("worker-1".into());
        record.lease_expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(record.is_lease_live(now));
        assert!(!record.is_lease_expired(now));

        record.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!record.is_lease_live(now));
        assert!(record.is_lease_expired(now));
    }

    #[test]
    fn crawl_message_defaults_apply() {
        let msg: CrawlMessage =
            serde_json::from_str(r#"{"url":"https://example.com/","domain":"example.com"}"#)
                .unwrap();
        assert_eq!(msg.priority, 1);
        assert_eq!(msg.retry_count, 0);
        assert!(msg.discovery_source.is_none());
    }
}
