//! Sitemap enumeration and parsing.
//!
//! Sitemaps in the wild are too messy for a strict XML parser, so `<loc>`
//! extraction is lenient regex over `<sitemap>`/`<url>` blocks. A
//! sitemapindex yields child sitemaps to walk; a urlset yields candidates
//! with their lastmod/changefreq/priority hints. Bodies are parsed straight
//! from the HTTP response.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crawlgrid_core::url::sitemap_candidate_urls;
use crawlgrid_core::SitemapUrl;
use crawlgrid_fetch::HttpFetcher;

static SITEMAP_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<sitemap>(.*?)</sitemap>").unwrap());
static URL_BLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<url>(.*?)</url>").unwrap());
static LOC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").unwrap());
static LASTMOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<lastmod>\s*([^<]+?)\s*</lastmod>").unwrap());
static CHANGEFREQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<changefreq>\s*([^<]+?)\s*</changefreq>").unwrap());
static PRIORITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<priority>\s*([^<]+?)\s*</priority>").unwrap());

/// What one sitemap document contained.
#[derive(Debug, Default)]
pub struct SitemapContent {
    pub child_sitemaps: Vec<String>,
    pub urls: Vec<SitemapUrl>,
}

/// Parse a sitemap or sitemap-index body.
pub fn parse_sitemap(content: &str) -> SitemapContent {
    let mut parsed = SitemapContent::default();

    if content.contains("<sitemapindex") {
        for block in SITEMAP_BLOCK_RE.captures_iter(content) {
            if let Some(loc) = LOC_RE.captures(&block[1]) {
                parsed.child_sitemaps.push(loc[1].trim().to_string());
            }
        }
        return parsed;
    }

    if content.contains("<urlset") {
        for block in URL_BLOCK_RE.captures_iter(content) {
            let body = &block[1];
            let Some(loc) = LOC_RE.captures(body) else {
                continue;
            };
            parsed.urls.push(SitemapUrl {
                url: loc[1].trim().to_string(),
                last_modified: LASTMOD_RE
                    .captures(body)
                    .and_then(|c| parse_lastmod(c[1].trim())),
                change_frequency: CHANGEFREQ_RE.captures(body).map(|c| c[1].trim().to_string()),
                priority: PRIORITY_RE
                    .captures(body)
                    .and_then(|c| c[1].trim().parse::<f64>().ok())
                    .map(|p| p.clamp(0.0, 1.0)),
            });
        }
        return parsed;
    }

    // neither marker: fall back to bare <loc> extraction
    for loc in LOC_RE.captures_iter(content) {
        parsed.urls.push(SitemapUrl {
            url: loc[1].trim().to_string(),
            last_modified: None,
            change_frequency: None,
            priority: None,
        });
    }
    parsed
}

fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(stamped) = DateTime::parse_from_rfc3339(value) {
        return Some(stamped.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Walks a domain's sitemaps breadth-first up to a depth bound.
pub struct SitemapDiscoverer {
    fetcher: Arc<HttpFetcher>,
    max_urls: usize,
}

impl SitemapDiscoverer {
    pub fn new(fetcher: Arc<HttpFetcher>, max_urls: usize) -> Self {
        Self { fetcher, max_urls }
    }

    /// Enumerate candidate URLs for `domain`: robots `Sitemap:` directives
    /// plus the common sitemap locations, then index recursion to
    /// `max_depth` levels.
    pub async fn discover(
        &self,
        domain: &str,
        robots_sitemaps: Vec<String>,
        max_depth: u32,
    ) -> Vec<SitemapUrl> {
        let mut frontier: Vec<String> = robots_sitemaps;
        for candidate in sitemap_candidate_urls(domain) {
            if !frontier.contains(&candidate) {
                frontier.push(candidate);
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut found: Vec<SitemapUrl> = Vec::new();

        for depth in 0..max_depth.max(1) {
            if frontier.is_empty() || found.len() >= self.max_urls {
                break;
            }
            let mut next_level: Vec<String> = Vec::new();

            for sitemap_url in frontier.drain(..) {
                if !visited.insert(sitemap_url.clone()) {
                    continue;
                }
                let response = match self.fetcher.fetch(&sitemap_url).await {
                    Ok(response) if response.status == 200 => response,
                    Ok(response) => {
                        debug!(sitemap = %sitemap_url, status = response.status, "sitemap probe missed");
                        continue;
                    }
                    Err(e) => {
                        debug!(sitemap = %sitemap_url, "sitemap fetch failed: {}", e);
                        continue;
                    }
                };
                let body = String::from_utf8_lossy(&response.body);
                let content = parse_sitemap(&body);
                debug!(
                    sitemap = %sitemap_url,
                    urls = content.urls.len(),
                    children = content.child_sitemaps.len(),
                    depth,
                    "sitemap parsed"
                );

                for url in content.urls {
                    if found.len() >= self.max_urls {
                        warn!(domain, cap = self.max_urls, "sitemap URL cap reached");
                        break;
                    }
                    found.push(url);
                }
                next_level.extend(content.child_sitemaps);
            }
            frontier = next_level;
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlset_entries_carry_their_hints() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url>
                <loc>https://example.com/a</loc>
                <lastmod>2026-07-30</lastmod>
                <changefreq>daily</changefreq>
                <priority>0.8</priority>
              </url>
              <url><loc> https://example.com/b </loc></url>
            </urlset>"#;

        let parsed = parse_sitemap(xml);
        assert!(parsed.child_sitemaps.is_empty());
        assert_eq!(parsed.urls.len(), 2);
        assert_eq!(parsed.urls[0].url, "https://example.com/a");
        assert_eq!(parsed.urls[0].priority, Some(0.8));
        assert_eq!(parsed.urls[0].change_frequency.as_deref(), Some("daily"));
        assert!(parsed.urls[0].last_modified.is_some());
        assert_eq!(parsed.urls[1].url, "https://example.com/b");
        assert!(parsed.urls[1].priority.is_none());
    }

    #[test]
    fn sitemapindex_yields_children_not_urls() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap>
              <sitemap><loc>https://example.com/sitemap-2.xml</loc><lastmod>2026-01-01</lastmod></sitemap>
            </sitemapindex>"#;

        let parsed = parse_sitemap(xml);
        assert!(parsed.urls.is_empty());
        assert_eq!(
            parsed.child_sitemaps,
            vec![
                "https://example.com/sitemap-1.xml".to_string(),
                "https://example.com/sitemap-2.xml".to_string(),
            ]
        );
    }

    #[test]
    fn rfc3339_and_date_only_lastmod_both_parse() {
        assert!(parse_lastmod("2026-07-30T12:00:00Z").is_some());
        assert!(parse_lastmod("2026-07-30T12:00:00+09:00").is_some());
        assert!(parse_lastmod("2026-07-30").is_some());
        assert!(parse_lastmod("next tuesday").is_none());
    }

    #[test]
    fn priority_is_clamped_to_unit_range() {
        let xml = r#"<urlset><url><loc>https://example.com/x</loc><priority>3.5</priority></url></urlset>"#;
        let parsed = parse_sitemap(xml);
        assert_eq!(parsed.urls[0].priority, Some(1.0));
    }

    #[test]
    fn bare_loc_extraction_as_fallback() {
        let xml = "<loc>https://example.com/one</loc><loc>https://example.com/two</loc>";
        let parsed = parse_sitemap(xml);
        assert_eq!(parsed.urls.len(), 2);
    }

    #[tokio::test]
    async fn discovery_recurses_through_an_index() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _index = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body(format!(
                r#"<sitemapindex><sitemap><loc>{base}/children.xml</loc></sitemap></sitemapindex>"#
            ))
            .create_async()
            .await;
        let _child = server
            .mock("GET", "/children.xml")
            .with_status(200)
            .with_body(
                r#"<urlset>
                     <url><loc>https://example.com/p1</loc></url>
                     <url><loc>https://example.com/p2</loc></url>
                   </urlset>"#,
            )
            .create_async()
            .await;

        let fetcher = Arc::new(
            HttpFetcher::new(
                crawlgrid_core::FetchConfig {
                    timeout: std::time::Duration::from_secs(5),
                    max_body_size: 1024 * 1024,
                    user_agent: "crawlgrid-test/0.1".into(),
                },
                std::time::Duration::from_secs(2),
                4,
            )
            .unwrap(),
        );
        let discoverer = SitemapDiscoverer::new(fetcher, 1000);

        let found = discoverer
            .discover("unused.example", vec![format!("{base}/sitemap.xml")], 3)
            .await;
        let urls: Vec<&str> = found.iter().map(|u| u.url.as_str()).collect();
        assert!(urls.contains(&"https://example.com/p1"));
        assert!(urls.contains(&"https://example.com/p2"));
    }

    #[tokio::test]
    async fn depth_bound_stops_recursion() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _level0 = server
            .mock("GET", "/sitemap.xml")
            .with_status(200)
            .with_body(format!(
                r#"<sitemapindex><sitemap><loc>{base}/level1.xml</loc></sitemap></sitemapindex>"#
            ))
            .create_async()
            .await;
        let _level1 = server
            .mock("GET", "/level1.xml")
            .with_status(200)
            .with_body(r#"<urlset><url><loc>https://example.com/deep</loc></url></urlset>"#)
            .expect(0)
            .create_async()
            .await;

        let fetcher = Arc::new(
            HttpFetcher::new(
                crawlgrid_core::FetchConfig {
                    timeout: std::time::Duration::from_secs(5),
                    max_body_size: 1024 * 1024,
                    user_agent: "crawlgrid-test/0.1".into(),
                },
                std::time::Duration::from_secs(2),
                4,
            )
            .unwrap(),
        );
        let discoverer = SitemapDiscoverer::new(fetcher, 1000);

        // depth 1: the index is read, its children are not
        let found = discoverer
            .discover("unused.example", vec![format!("{base}/sitemap.xml")], 1)
            .await;
        assert!(found.is_empty());
    }
}
