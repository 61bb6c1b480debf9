//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the harvest library
//! without making real generation calls or waiting on the wall clock.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::clock::Clock;
use crate::credentials::{fingerprint, SecretString};
use crate::error::BackendError;
use crate::traits::backend::{GenerationBackend, GenerationRequest, GenerationResponse};
use crate::types::page::PageContent;
use crate::types::record::ExtractedRecord;

// ============================================================================
// Clock
// ============================================================================

/// A settable clock.
///
/// Starts at 2025-06-01T12:00:00Z unless built with [`ManualClock::at`].
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap()
    }
}

// ============================================================================
// Generation backend
// ============================================================================

type Handler =
    dyn Fn(&GenerationRequest) -> Result<GenerationResponse, BackendError> + Send + Sync;

/// A mock generation backend.
///
/// Scripted responses are returned in order; once the script is empty the
/// handler (if any) answers, otherwise the call fails with a service error.
#[derive(Default)]
pub struct MockBackend {
    script: Arc<RwLock<VecDeque<Result<GenerationResponse, BackendError>>>>,

    handler: Option<Arc<Handler>>,

    /// Call tracking for assertions
    calls: Arc<RwLock<Vec<MockCall>>>,
}

/// Record of a call made to the mock backend.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// Fingerprint of the credential used
    pub credential: String,
    pub prompt: String,
    pub max_output_tokens: u32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response with `text`.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Ok(GenerationResponse::complete(text)));
        self
    }

    /// Queue a raw response (e.g. one cut off by the token limit).
    pub fn with_raw_response(self, response: GenerationResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, error: BackendError) -> Self {
        self.push(Err(error));
        self
    }

    /// Answer calls the script does not cover.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<GenerationResponse, BackendError>
            + Send
            + Sync
            + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    fn push(&self, item: Result<GenerationResponse, BackendError>) {
        self.script.write().unwrap().push_back(item);
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Clear call history.
    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn generate(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, BackendError> {
        self.calls.write().unwrap().push(MockCall {
            credential: fingerprint(credential.expose()),
            prompt: request.prompt.clone(),
            max_output_tokens: request.max_output_tokens,
        });

        if let Some(next) = self.script.write().unwrap().pop_front() {
            return next;
        }

        match &self.handler {
            Some(handler) => handler(request),
            None => Err(BackendError::http(500, "mock backend: no scripted response")),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A record with a name and URL and everything else empty.
pub fn record(name: &str, url: &str) -> ExtractedRecord {
    ExtractedRecord {
        name: name.to_string(),
        opening_date: None,
        closing_date: None,
        organization: "ANID".to_string(),
        funding: None,
        url: Some(url.to_string()),
        status: None,
        description: None,
        sub_area: None,
        source_site: "anid.cl".to_string(),
        extracted_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        opening_date_text: None,
        model_missed: false,
    }
}

/// A page whose text is `size` bytes of filler.
pub fn page_of_size(url: &str, size: usize) -> PageContent {
    PageContent::new(url, "x".repeat(size))
}

/// A listing page linking to `items` (url, name).
pub fn listing_page(url: &str, text: &str, items: &[(&str, &str)]) -> PageContent {
    items
        .iter()
        .fold(PageContent::new(url, text), |page, (item_url, name)| {
            page.with_item_link(*item_url, *name)
        })
}
