//! Page-fetch boundary.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::page::PageContent;

/// Fetches one page's cleaned text.
///
/// Site-specific scraping (DOM selectors, JavaScript pagination) lives in
/// implementations; the pipelines only see [`PageContent`].
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<PageContent, FetchError>;
}
