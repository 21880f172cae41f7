//! Error classification and backoff policy.
//!
//! Every failure maps onto one `ErrorKind` carrying a retryable/permanent
//! verdict and a suggested base delay; the backoff is exponential with
//! symmetric jitter, capped, and never below one second.

use std::time::Duration;

use rand::Rng;

use crawlgrid_core::{CrawlError, ErrorKind};

#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub permanent: bool,
    pub suggested_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl ErrorPolicy {
    pub fn new(
        max_retries: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
            backoff_multiplier,
            jitter_factor,
        }
    }

    pub fn classify(&self, error: &CrawlError) -> Classification {
        let base = self.base_backoff.as_secs_f64();
        match error {
            CrawlError::Connection(_) => retryable(ErrorKind::Connection, base),
            CrawlError::Timeout(_) => retryable(ErrorKind::Timeout, base * 1.5),
            CrawlError::HttpStatus { status, .. } => {
                if *status >= 500 {
                    retryable(ErrorKind::HttpServer, base)
                } else {
                    permanent(ErrorKind::HttpClient)
                }
            }
            CrawlError::RateLimited { retry_after, .. } => {
                let delay = retry_after.unwrap_or(base * 3.0);
                retryable(ErrorKind::RateLimited, delay)
            }
            CrawlError::RobotsBlocked(_) => permanent(ErrorKind::RobotsBlocked),
            CrawlError::BodyTooLarge { .. } => permanent(ErrorKind::ContentTooLarge),
            CrawlError::BadUrl(_) | CrawlError::Parse(_) => permanent(ErrorKind::Parse),
            CrawlError::Storage(_)
            | CrawlError::Queue(_)
            | CrawlError::Config(_)
            | CrawlError::Other(_) => retryable(ErrorKind::Unknown, base * 2.0),
        }
    }

    /// Per-kind retry budgets: rate limiting gets more attempts, unknown
    /// errors fewer.
    pub fn max_retries_for(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::RateLimited => self.max_retries.max(5),
            ErrorKind::Unknown => self.max_retries.min(2),
            _ => self.max_retries,
        }
    }

    pub fn should_retry(&self, error: &CrawlError, retry_count: u32) -> bool {
        let classification = self.classify(error);
        if !classification.retryable || classification.permanent {
            return false;
        }
        retry_count < self.max_retries_for(classification.kind)
    }

    /// Exponential backoff with ±jitter, capped, never below one second.
    pub fn backoff_delay(&self, retry_count: u32, classification: &Classification) -> Duration {
        let base = classification.suggested_delay.as_secs_f64();
        let mut delay = base * self.backoff_multiplier.powi(retry_count as i32);
        delay = delay.min(self.max_backoff.as_secs_f64());

        let jitter_range = delay * self.jitter_factor;
        if jitter_range > 0.0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            delay += jitter;
        }

        Duration::from_secs_f64(delay.max(1.0))
    }
}

fn retryable(kind: ErrorKind, delay_secs: f64) -> Classification {
    Classification {
        kind,
        retryable: true,
        permanent: false,
        suggested_delay: Duration::from_secs_f64(delay_secs.max(0.0)),
    }
}

fn permanent(kind: ErrorKind) -> Classification {
    Classification {
        kind,
        retryable: false,
        permanent: true,
        suggested_delay: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ErrorPolicy {
        ErrorPolicy::new(3, Duration::from_secs(2), Duration::from_secs(3600), 2.0, 0.2)
    }

    fn http(status: u16) -> CrawlError {
        CrawlError::HttpStatus {
            status,
            url: "https://example.com/x".into(),
        }
    }

    #[test]
    fn taxonomy_verdicts() {
        let p = policy();

        let c = p.classify(&CrawlError::Connection("refused".into()));
        assert_eq!(c.kind, ErrorKind::Connection);
        assert!(c.retryable && !c.permanent);

        let c = p.classify(&CrawlError::Timeout(30));
        assert_eq!(c.kind, ErrorKind::Timeout);
        assert_eq!(c.suggested_delay, Duration::from_secs(3)); // base × 1.5

        assert!(p.classify(&http(404)).permanent);
        assert!(p.classify(&http(403)).permanent);
        assert!(!p.classify(&http(503)).permanent);
        assert_eq!(p.classify(&http(503)).kind, ErrorKind::HttpServer);

        let c = p.classify(&CrawlError::RobotsBlocked("https://example.com/".into()));
        assert_eq!(c.kind, ErrorKind::RobotsBlocked);
        assert!(c.permanent);

        let c = p.classify(&CrawlError::BodyTooLarge { size: 10, max: 5 });
        assert!(c.permanent);
        assert_eq!(c.kind, ErrorKind::ContentTooLarge);
    }

    #[test]
    fn retry_after_header_overrides_the_base_delay() {
        let p = policy();
        let c = p.classify(&CrawlError::RateLimited {
            domain: "example.com".into(),
            retry_after: Some(42.0),
        });
        assert_eq!(c.suggested_delay, Duration::from_secs(42));

        let c = p.classify(&CrawlError::RateLimited {
            domain: "example.com".into(),
            retry_after: None,
        });
        assert_eq!(c.suggested_delay, Duration::from_secs(6)); // base × 3
    }

    #[test]
    fn should_retry_honors_budget_and_permanence() {
        let p = policy();
        assert!(p.should_retry(&http(503), 0));
        assert!(p.should_retry(&http(503), 2));
        assert!(!p.should_retry(&http(503), 3));
        assert!(!p.should_retry(&http(404), 0));

        // rate limiting gets a larger budget
        let limited = CrawlError::RateLimited {
            domain: "example.com".into(),
            retry_after: None,
        };
        assert!(p.should_retry(&limited, 4));
        assert!(!p.should_retry(&limited, 5));

        // unknown errors a smaller one
        let unknown = CrawlError::Queue("weird".into());
        assert!(p.should_retry(&unknown, 1));
        assert!(!p.should_retry(&unknown, 2));
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let p = policy();
        let c = p.classify(&http(503)); // base 2s

        for (retry, expected) in [(0u32, 2.0f64), (1, 4.0), (2, 8.0), (3, 16.0)] {
            let delay = p.backoff_delay(retry, &c).as_secs_f64();
            let low = expected * (1.0 - p.jitter_factor);
            let high = expected * (1.0 + p.jitter_factor);
            assert!(
                (low..=high).contains(&delay),
                "retry {retry}: {delay}s outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn backoff_is_capped_and_at_least_one_second() {
        let p = ErrorPolicy::new(3, Duration::from_secs(60), Duration::from_secs(100), 2.0, 0.0);
        let c = p.classify(&http(503));
        assert_eq!(p.backoff_delay(10, &c), Duration::from_secs(100));

        let tiny = ErrorPolicy::new(3, Duration::from_millis(1), Duration::from_secs(10), 2.0, 0.0);
        let c = tiny.classify(&http(503));
        assert!(tiny.backoff_delay(0, &c) >= Duration::from_secs(1));
    }
}
