//! Size-bounded batching of page text.
//!
//! Greedy single pass in input order. A page joins the open batch unless
//! that would push the combined text past the limit; then the open batch is
//! closed and the page starts a new one. A page larger than the limit on
//! its own still gets a batch (the oversize singleton).

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::sources::is_listing_path;
use crate::types::page::PageContent;

/// Text placed between pages in a batch.
pub const BATCH_SEPARATOR: &str = "\n\n---\n\n";

/// A group of pages sent to the model in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position in the run, zero-based
    pub index: usize,

    /// Pages in input order
    pub pages: Vec<PageContent>,

    /// Page texts joined with [`BATCH_SEPARATOR`]
    pub combined_text: String,

    /// Detail-page URL -> display name, for fallback records
    pub manifest: IndexMap<String, String>,
}

impl Batch {
    fn new(index: usize, pages: Vec<PageContent>) -> Self {
        let combined_text = pages
            .iter()
            .map(|p| p.cleaned_text.as_str())
            .collect::<Vec<_>>()
            .join(BATCH_SEPARATOR);
        let manifest = build_manifest(&pages);

        Self {
            index,
            pages,
            combined_text,
            manifest,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_urls(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.url.clone()).collect()
    }

    /// URLs of pages in this batch that list calls rather than describe one.
    pub fn listing_urls(&self) -> Vec<String> {
        self.pages
            .iter()
            .filter(|p| is_listing_page(p))
            .map(|p| p.url.clone())
            .collect()
    }

    pub fn text_len(&self) -> usize {
        self.combined_text.len()
    }
}

/// Batches plus the pages left out of them.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub batches: Vec<Batch>,

    /// URLs of pages with no extractable text
    pub skipped: Vec<String>,
}

impl Assembly {
    pub fn page_count(&self) -> usize {
        self.batches.iter().map(Batch::page_count).sum()
    }
}

/// Group pages into batches whose combined text stays within `size_limit`
/// bytes, separators included.
pub fn assemble(pages: &[PageContent], size_limit: usize) -> Assembly {
    let mut assembly = Assembly::default();
    let mut current: Vec<PageContent> = Vec::new();
    let mut current_size = 0usize;

    for page in pages {
        if !page.has_text() {
            warn!(url = %page.url, "Page has no extractable text, skipping");
            assembly.skipped.push(page.url.clone());
            continue;
        }

        let page_size = page.cleaned_text.len();
        let separator_size = if current.is_empty() { 0 } else { BATCH_SEPARATOR.len() };

        if !current.is_empty() && current_size + separator_size + page_size > size_limit {
            let index = assembly.batches.len();
            assembly
                .batches
                .push(Batch::new(index, std::mem::take(&mut current)));
            current.push(page.clone());
            current_size = page_size;
        } else {
            current.push(page.clone());
            current_size += separator_size + page_size;
        }
    }

    if !current.is_empty() {
        let index = assembly.batches.len();
        assembly.batches.push(Batch::new(index, current));
    }

    info!(
        pages = pages.len(),
        batches = assembly.batches.len(),
        skipped = assembly.skipped.len(),
        "Assembled batches"
    );
    for batch in &assembly.batches {
        debug!(
            batch = batch.index,
            pages = batch.page_count(),
            chars = batch.text_len(),
            manifest = batch.manifest.len(),
            "Batch"
        );
    }

    assembly
}

fn is_listing_page(page: &PageContent) -> bool {
    !page.item_links.is_empty() || is_listing_path(&page.url)
}

/// Union of the pages' item links, first name wins. A page that is not a
/// listing contributes itself.
fn build_manifest(pages: &[PageContent]) -> IndexMap<String, String> {
    let mut manifest = IndexMap::new();

    for page in pages {
        if is_listing_page(page) {
            for (url, name) in &page.item_links {
                manifest
                    .entry(url.clone())
                    .or_insert_with(|| name.trim().to_string());
            }
        } else {
            manifest
                .entry(page.url.clone())
                .or_insert_with(|| page.display_name());
        }
    }

    manifest
}
