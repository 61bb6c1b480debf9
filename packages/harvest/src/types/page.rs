//! Page types - scraped page content handed over by the fetch layer.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cleaned text of one scraped page.
///
/// Produced by the external fetch layer and immutable once handed to a
/// pipeline run. `item_links` carries the detail-page URLs the fetch layer
/// found on a listing page, mapped to the link text shown next to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    /// Canonical URL of the page
    pub url: String,

    /// Cleaned page text (usually markdown)
    pub cleaned_text: String,

    /// Unprocessed text or HTML, if the fetch layer kept it
    #[serde(default)]
    pub raw_text: Option<String>,

    /// Size of `cleaned_text` in bytes
    pub size_bytes: usize,

    /// SHA-256 hash of `cleaned_text`
    pub content_hash: String,

    /// Page title if available
    #[serde(default)]
    pub title: Option<String>,

    /// Detail-page URL -> display name, in page order
    #[serde(default)]
    pub item_links: IndexMap<String, String>,

    /// When the page was fetched
    pub fetched_at: DateTime<Utc>,
}

impl PageContent {
    /// Create a page from its URL and cleaned text.
    pub fn new(url: impl Into<String>, cleaned_text: impl Into<String>) -> Self {
        let cleaned_text = cleaned_text.into();
        Self {
            url: url.into(),
            size_bytes: cleaned_text.len(),
            content_hash: Self::hash_content(&cleaned_text),
            cleaned_text,
            raw_text: None,
            title: None,
            item_links: IndexMap::new(),
            fetched_at: Utc::now(),
        }
    }

    /// Calculate SHA-256 hash of content.
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Add a detail link found on this page.
    pub fn with_item_link(mut self, url: impl Into<String>, name: impl Into<String>) -> Self {
        self.item_links.insert(url.into(), name.into());
        self
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Whether the page has any extractable text.
    pub fn has_text(&self) -> bool {
        !self.cleaned_text.trim().is_empty()
    }

    /// Length used for batch sizing.
    pub fn text_len(&self) -> usize {
        self.cleaned_text.len()
    }

    /// Best-effort display name: title, else the last URL path segment
    /// with dashes turned into spaces.
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        slug_name(&self.url)
    }
}

/// Turn `https://site/concursos/fondecyt-regular-2025/` into `fondecyt regular 2025`.
pub(crate) fn slug_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .replace(['-', '_'], " ")
        .trim()
        .to_string()
}
