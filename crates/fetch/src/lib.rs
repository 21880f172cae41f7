//! Size-capped, timeout-bounded HTTP fetching.
//!
//! One pooled client per process; connection reuse is what makes per-domain
//! politeness affordable. The body is read chunk by chunk so an oversized
//! response aborts at the cap instead of buffering first.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tracing::{debug, warn};

use crawlgrid_core::url::extract_domain;
use crawlgrid_core::{CrawlError, FetchConfig, FetchResponse};

pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig, connect_timeout: Duration, max_concurrent: usize) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(connect_timeout)
            .timeout(config.timeout)
            .pool_max_idle_per_host(max_concurrent.min(10).max(1))
            .build()
            .map_err(|e| CrawlError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch `url`, following redirects, reading at most
    /// `max_body_size` bytes. Any HTTP status comes back as a response; only
    /// transport failures and the size cap produce errors.
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, CrawlError> {
        self.fetch_with_headers(url, &HashMap::new()).await
    }

    pub async fn fetch_with_headers(
        &self,
        url: &str,
        extra_headers: &HashMap<String, String>,
    ) -> Result<FetchResponse, CrawlError> {
        let start = Instant::now();
        debug!(url, "fetching");

        let mut request = self.client.get(url);
        for (name, value) in extra_headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        // refuse early when the announced length already exceeds the cap
        if let Some(announced) = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            if announced > self.config.max_body_size {
                return Err(CrawlError::BodyTooLarge {
                    size: announced,
                    max: self.config.max_body_size,
                });
            }
        }

        let body = self.read_capped(response).await?;
        let elapsed = start.elapsed();

        Ok(FetchResponse {
            url: url.to_string(),
            final_url,
            status,
            headers,
            body,
            content_type,
            fetched_at: Utc::now(),
            response_time_ms: elapsed.as_millis() as u64,
        })
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, CrawlError> {
        let mut body: Vec<u8> = Vec::new();
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.transport_error(e)),
            };
            if body.len() + chunk.len() > self.config.max_body_size {
                warn!(
                    read = body.len() + chunk.len(),
                    max = self.config.max_body_size,
                    "aborting oversized body read"
                );
                return Err(CrawlError::BodyTooLarge {
                    size: body.len() + chunk.len(),
                    max: self.config.max_body_size,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn transport_error(&self, e: reqwest::Error) -> CrawlError {
        if e.is_timeout() {
            CrawlError::Timeout(self.config.timeout.as_secs())
        } else {
            CrawlError::Connection(e.to_string())
        }
    }
}

/// How the worker should treat an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx/3xx: inspect the body and store it.
    Success,
    /// No retry will change the answer.
    Terminal,
    /// Worth retrying after a backoff.
    Retryable,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=399 => StatusClass::Success,
        429 => StatusClass::Retryable,
        400..=499 => StatusClass::Terminal,
        _ => StatusClass::Retryable,
    }
}

/// Error corresponding to a non-success response, or `None` for 2xx/3xx.
/// A 429 becomes `RateLimited`, honoring a numeric `Retry-After`.
pub fn response_error(response: &FetchResponse) -> Option<CrawlError> {
    match classify_status(response.status) {
        StatusClass::Success => None,
        StatusClass::Retryable if response.status == 429 => {
            let retry_after = response
                .headers
                .get("retry-after")
                .and_then(|v| v.parse::<f64>().ok());
            Some(CrawlError::RateLimited {
                domain: extract_domain(&response.final_url)
                    .unwrap_or_else(|_| "unknown".to_string()),
                retry_after,
            })
        }
        _ => Some(CrawlError::HttpStatus {
            status: response.status,
            url: response.url.clone(),
        }),
    }
}
