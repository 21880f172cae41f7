//! URL normalization and identity.
//!
//! Two URLs are the same unit of work iff their canonical forms are
//! byte-identical; the 64-hex SHA-256 of the canonical form is the primary
//! key everywhere else in the system.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CrawlError;

/// Canonicalize a URL for consistent processing.
///
/// Rules, in order: require an http/https scheme; lowercase scheme and host
/// (the `url` crate does both on parse); strip default ports; ensure the
/// path is at least `/`; drop the trailing slash except for the root; sort
/// query pairs by (key, value) and re-encode; drop the fragment.
pub fn normalize_url(raw: &str) -> Result<String, CrawlError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| CrawlError::BadUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::BadUrl(format!("unsupported scheme: {other}")));
        }
    }
    if url.host_str().map(|h| h.is_empty()).unwrap_or(true) {
        return Err(CrawlError::BadUrl("URL has no host".into()));
    }

    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

/// SHA-256 hex of the canonical form. Falls back to hashing the raw string
/// when the URL cannot be normalized, so every input gets a stable identity.
pub fn url_hash(raw: &str) -> String {
    let canonical = normalize_url(raw).unwrap_or_else(|_| raw.to_string());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercased host without the port.
pub fn extract_domain(raw: &str) -> Result<String, CrawlError> {
    let url = Url::parse(raw).map_err(|e| CrawlError::BadUrl(e.to_string()))?;
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| CrawlError::BadUrl(format!("URL has no host: {raw}")))
}

pub fn robots_txt_url(domain: &str) -> String {
    format!("https://{domain}/robots.txt")
}

/// Common sitemap locations probed when robots.txt names none.
pub fn sitemap_candidate_urls(domain: &str) -> Vec<String> {
    [
        "/sitemap.xml",
        "/sitemap_index.xml",
        "/sitemaps.xml",
        "/sitemap/sitemap.xml",
        "/sitemap/index.xml",
    ]
    .iter()
    .map(|path| format!("https://{domain}{path}"))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let cases = [
            "https://Example.COM:443/a/b/?b=2&a=1#frag",
            "http://example.com:80",
            "https://example.com/path/",
            "https://example.com/?z=9&a=1&a=0",
        ];
        for raw in cases {
            let once = normalize_url(raw).unwrap();
            let twice = normalize_url(&once).unwrap();
            assert_eq!(once, twice, "normalize must be idempotent for {raw}");
            assert_eq!(url_hash(raw), url_hash(&once));
        }
    }

    #[test]
    fn host_and_scheme_are_lowercased_and_default_port_dropped() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM:443/Path").unwrap(),
            "https://example.com/Path"
        );
        assert_eq!(
            normalize_url("http://example.com:80/").unwrap(),
            "http://example.com/"
        );
        // non-default port survives
        assert_eq!(
            normalize_url("http://example.com:8080/").unwrap(),
            "http://example.com:8080/"
        );
    }

    #[test]
    fn trailing_slash_dropped_except_root() {
        assert_eq!(
            normalize_url("https://example.com/a/b/").unwrap(),
            "https://example.com/a/b"
        );
        assert_eq!(
            normalize_url("https://example.com").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn query_pairs_sorted_and_fragment_dropped() {
        assert_eq!(
            normalize_url("https://example.com/?b=2&a=1&a=0#top").unwrap(),
            "https://example.com/?a=0&a=1&b=2"
        );
        assert_eq!(
            normalize_url("https://example.com/?").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn unsupported_scheme_and_missing_host_rejected() {
        assert!(matches!(
            normalize_url("ftp://example.com/"),
            Err(CrawlError::BadUrl(_))
        ));
        assert!(matches!(
            normalize_url("not a url"),
            Err(CrawlError::BadUrl(_))
        ));
    }

    #[test]
    fn equivalent_urls_hash_identically() {
        assert_eq!(
            url_hash("https://example.com/a?x=1&y=2"),
            url_hash("https://EXAMPLE.com:443/a/?y=2&x=1")
        );
        assert_ne!(
            url_hash("https://example.com/a"),
            url_hash("https://example.com/b")
        );
        assert_eq!(url_hash("https://example.com/").len(), 64);
    }

    #[test]
    fn domain_extraction_strips_port() {
        assert_eq!(
            extract_domain("https://Example.com:8443/x").unwrap(),
            "example.com"
        );
        assert!(extract_domain("mailto:nobody").is_err());
    }
}
