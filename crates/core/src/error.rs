use thiserror::Error;

/// Errors surfaced by the crawl pipeline. Each variant maps onto one kind in
/// the retry taxonomy (see `types::ErrorKind`).
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("rate limited for domain {domain}")]
    RateLimited {
        domain: String,
        retry_after: Option<f64>,
    },

    #[error("blocked by robots.txt: {0}")]
    RobotsBlocked(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid URL: {0}")]
    BadUrl(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors from the key/value state store and other shared backends.
///
/// `Conflict` is the normal outcome of losing a conditional-update race and
/// is handled locally; the other variants bubble up as `CrawlError::Storage`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conditional update predicate was false")]
    Conflict,

    #[error("record not found")]
    NotFound,

    #[error("backend throttled the request")]
    Throttled,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors may be retried inside the adapters; `Conflict` and
    /// `NotFound` are contract outcomes, not transport failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled | StoreError::Unavailable(_))
    }
}
