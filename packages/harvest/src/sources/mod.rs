//! Page sources and site identification.
//!
//! Site-specific scraping is external; this module only knows how to
//! identify a site from its URL, where its listing page lives, and how to
//! drive a [`PageSource`] over a set of URLs with bounded fan-out.

use std::path::Path;

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use tracing::{debug, info, warn};
use url::Url;

use async_trait::async_trait;

use crate::cancel::RunControl;
use crate::error::{FetchError, Result};
use crate::traits::source::PageSource;
use crate::types::page::PageContent;

/// Organization used when the site is not recognized.
pub const UNKNOWN_ORGANIZATION: &str = "Unknown";

/// Known source sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    Anid,
    Mineduc,
    Cna,
    Generic,
}

impl SiteKind {
    /// Identify a site from any URL or bare host on it.
    pub fn from_url(url: &str) -> Self {
        let host = normalize_site(url);
        match host.as_str() {
            h if h == "anid.cl" || h.ends_with(".anid.cl") => SiteKind::Anid,
            h if h == "mineduc.cl" || h.ends_with(".mineduc.cl") => SiteKind::Mineduc,
            h if h == "cnachile.cl" || h.ends_with(".cnachile.cl") => SiteKind::Cna,
            _ => SiteKind::Generic,
        }
    }

    /// Organization that publishes the calls.
    pub fn organization(&self) -> &'static str {
        match self {
            SiteKind::Anid => "ANID",
            SiteKind::Mineduc => "MINEDUC",
            SiteKind::Cna => "CNA",
            SiteKind::Generic => UNKNOWN_ORGANIZATION,
        }
    }

    /// Path of the page that lists calls rather than describing one.
    pub fn listing_path(&self) -> Option<&'static str> {
        match self {
            SiteKind::Anid => Some("/concursos"),
            _ => None,
        }
    }

    /// Whether detail pages list earlier editions of the call.
    pub fn has_previous_versions(&self) -> bool {
        matches!(self, SiteKind::Anid)
    }
}

/// Storage key for a site: lowercase host without `www.`.
///
/// Accepts full URLs (`https://www.anid.cl/concursos/`) or bare hosts
/// (`anid.cl`).
pub fn normalize_site(site: &str) -> String {
    let trimmed = site.trim();
    let parsed = Url::parse(trimmed).or_else(|_| Url::parse(&format!("https://{}", trimmed)));

    let host = parsed
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| trimmed.trim_end_matches('/').to_string());

    let host = host.to_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

/// File-name-safe form of a site key (`anid.cl` -> `anid_cl`).
pub fn site_key(site: &str) -> String {
    normalize_site(site).replace(['.', '/', ':'], "_")
}

/// Organization inferred from a record or page URL.
pub fn organization_for_url(url: &str) -> &'static str {
    SiteKind::from_url(url).organization()
}

/// Whether `url` is a site's listing page (e.g. `.../concursos/`).
pub fn is_listing_path(url: &str) -> bool {
    let path = Url::parse(url.trim())
        .map(|u| u.path().trim_end_matches('/').to_string())
        .unwrap_or_else(|_| url.trim().trim_end_matches('/').to_string());

    let kind = SiteKind::from_url(url);
    let listing = kind.listing_path().unwrap_or("/concursos");
    path.ends_with(listing)
}

// ============================================================================
// Static source
// ============================================================================

/// Pages already fetched by the external scraping layer.
#[derive(Debug, Clone, Default)]
pub struct StaticPageSource {
    pages: IndexMap<String, PageContent>,
}

impl StaticPageSource {
    pub fn new(pages: impl IntoIterator<Item = PageContent>) -> Self {
        Self {
            pages: pages.into_iter().map(|p| (p.url.clone(), p)).collect(),
        }
    }

    /// Load a JSON array of pages written by the fetch layer.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let pages: Vec<PageContent> = serde_json::from_slice(&bytes)?;
        info!(path = %path.display(), pages = pages.len(), "Loaded page cache");
        Ok(Self::new(pages))
    }

    /// URLs in cache order.
    pub fn urls(&self) -> Vec<String> {
        self.pages.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    async fn fetch(&self, url: &str) -> std::result::Result<PageContent, FetchError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            })
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Result of fetching a set of URLs.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Successfully fetched pages, in input order
    pub pages: Vec<PageContent>,

    /// Per-URL failures, in input order
    pub failures: Vec<FetchError>,

    /// Stop was requested before every URL was attempted
    pub cancelled: bool,
}

/// Fetch `urls` with at most `concurrency` requests in flight.
///
/// The control is checked before each fetch starts; once it reports a stop,
/// remaining URLs are skipped and the outcome is marked cancelled.
pub async fn fetch_pages(
    source: &dyn PageSource,
    urls: &[String],
    control: &RunControl,
    concurrency: usize,
) -> FetchOutcome {
    let mut results: Vec<(usize, Option<std::result::Result<PageContent, FetchError>>)> =
        stream::iter(urls.iter().enumerate())
            .map(|(index, url)| async move {
                if control.should_stop().await {
                    return (index, None);
                }
                debug!(url = %url, "Fetching page");
                (index, Some(source.fetch(url).await))
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    results.sort_by_key(|(index, _)| *index);

    let mut outcome = FetchOutcome::default();
    for (_, result) in results {
        match result {
            Some(Ok(page)) => outcome.pages.push(page),
            Some(Err(e)) => {
                warn!(error = %e, "Page fetch failed");
                outcome.failures.push(e);
            }
            None => outcome.cancelled = true,
        }
    }

    info!(
        fetched = outcome.pages.len(),
        failed = outcome.failures.len(),
        cancelled = outcome.cancelled,
        "Page fetch finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_kind_from_url() {
        assert_eq!(SiteKind::from_url("https://anid.cl/concursos/"), SiteKind::Anid);
        assert_eq!(SiteKind::from_url("https://www.anid.cl/x"), SiteKind::Anid);
        assert_eq!(
            SiteKind::from_url("https://centroestudios.mineduc.cl/"),
            SiteKind::Mineduc
        );
        assert_eq!(SiteKind::from_url("https://www.cnachile.cl/"), SiteKind::Cna);
        assert_eq!(SiteKind::from_url("https://example.org"), SiteKind::Generic);
        assert_eq!(SiteKind::from_url("notanid.cl"), SiteKind::Generic);
    }

    #[test]
    fn test_normalize_site() {
        assert_eq!(normalize_site("https://www.anid.cl/concursos/"), "anid.cl");
        assert_eq!(normalize_site("anid.cl"), "anid.cl");
        assert_eq!(normalize_site("WWW.CNACHILE.CL"), "cnachile.cl");
        assert_eq!(site_key("https://centroestudios.mineduc.cl/"), "centroestudios_mineduc_cl");
    }

    #[test]
    fn test_organization_for_url() {
        assert_eq!(organization_for_url("https://anid.cl/concursos/x/"), "ANID");
        assert_eq!(organization_for_url("https://dfi.mineduc.cl/"), "MINEDUC");
        assert_eq!(organization_for_url("https://foo.bar/"), UNKNOWN_ORGANIZATION);
    }

    #[test]
    fn test_is_listing_path() {
        assert!(is_listing_path("https://anid.cl/concursos/"));
        assert!(is_listing_path("https://anid.cl/concursos"));
        assert!(!is_listing_path("https://anid.cl/concursos/fondecyt-2025/"));
    }

    #[tokio::test]
    async fn test_fetch_pages_keeps_order_and_failures() {
        let source = StaticPageSource::new(vec![
            PageContent::new("https://a.cl/1", "one"),
            PageContent::new("https://a.cl/2", "two"),
        ]);
        let urls = vec![
            "https://a.cl/2".to_string(),
            "https://a.cl/missing".to_string(),
            "https://a.cl/1".to_string(),
        ];

        let outcome = fetch_pages(&source, &urls, &RunControl::new("a.cl"), 2).await;

        let fetched: Vec<_> = outcome.pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(fetched, vec!["https://a.cl/2", "https://a.cl/1"]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_fetch_pages_stops_when_cancelled() {
        let source = StaticPageSource::new(vec![PageContent::new("https://a.cl/1", "one")]);
        let control = RunControl::new("a.cl");
        control.cancel();

        let outcome = fetch_pages(&source, &["https://a.cl/1".to_string()], &control, 4).await;
        assert!(outcome.pages.is_empty());
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_static_source_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.json");
        let pages = vec![PageContent::new("https://anid.cl/concursos/", "# Calls")];
        std::fs::write(&path, serde_json::to_vec(&pages).unwrap()).unwrap();

        let source = StaticPageSource::load(&path).await.unwrap();
        assert_eq!(source.urls(), vec!["https://anid.cl/concursos/"]);
        assert!(source.fetch("https://anid.cl/concursos/").await.is_ok());
    }
}
