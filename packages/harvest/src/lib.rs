//! Resilient batch extraction of funding calls.
//!
//! Turns scraped listing and detail pages into structured, versioned
//! records, using a schema-constrained generation service that is rate
//! limited and occasionally unreliable.
//!
//! # Design
//!
//! - Pages are grouped into size-bounded batches and sent one batch at a time
//! - Every call goes through a retry loop that rotates credentials on quota
//!   errors and raises the token budget on truncated output
//! - Everything the model does not decide (dates, status, URLs) is derived
//!   deterministically after the call
//! - History is keyed by detail-page URL only and is append-only
//! - Scrape and prediction runs on the same site never overlap
//!
//! # Usage
//!
//! ```rust,ignore
//! use harvest::{CredentialPool, ExtractionPipeline, GenerationClient, RunControl};
//! use harvest::testing::MockBackend;
//!
//! let pool = Arc::new(CredentialPool::in_memory(["key-a", "key-b"]));
//! let client = GenerationClient::new(Arc::new(MockBackend::new()), pool, GenerationConfig::default());
//! let pipeline = ExtractionPipeline::new(client, ExtractionConfig::default(), Arc::new(SystemClock));
//!
//! let result = pipeline.run("anid.cl", &pages, &RunControl::new("anid.cl")).await?;
//! println!("{} records, outcome {:?}", result.records.len(), result.report.outcome);
//! ```
//!
//! # Modules
//!
//! - [`pipeline`] - Batching, extraction, sessions, prediction
//! - [`generation`] - Retry, rotation and escalation around the backend
//! - [`credentials`] - Credential pool with durable cooldowns
//! - [`history`] - URL-keyed version history and maintenance
//! - [`lock`] - Cross-process operation locks
//! - [`stores`] - Memory, JSON-file and SQLite storage
//! - [`traits`] - Backend, storage and page-source seams
//! - [`testing`] - Mock backend, manual clock, fixtures

pub mod cancel;
pub mod clock;
pub mod credentials;
pub mod dates;
pub mod error;
pub mod generation;
pub mod history;
pub mod lock;
pub mod pipeline;
pub mod sources;
pub mod status;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

pub mod ai;

// Re-export core types at crate root
pub use cancel::RunControl;
pub use clock::{Clock, SystemClock};
pub use credentials::{CredentialPool, PoolStatus, SecretString};
pub use error::{BackendError, FetchError, GenerationError, HarvestError, Result};
pub use generation::{GenerationClient, GenerationOutput};
pub use history::{
    Enrichment, HistoryStore, IncompleteEntry, PatternAnalysis, ReconcileOutcome,
};
pub use lock::{LockGuard, LockManager, OperationKind};
pub use sources::{normalize_site, SiteKind, StaticPageSource};
pub use traits::{
    backend::{FinishReason, GenerationBackend, GenerationRequest, GenerationResponse},
    source::PageSource,
    store::{CredentialRepository, HistoryRepository, PredictionRepository, StopSignal},
};
pub use types::{
    config::{ExtractionConfig, GenerationConfig, LockConfig, PredictionConfig},
    history::{HistoryEntry, PreviousVersion, SiteHistory, VersionSnapshot},
    page::PageContent,
    prediction::{Prediction, PredictionSet, PredictionTarget, Unpredictable, UnpredictableReason},
    record::{ExtractedRecord, RecordIssue, RecordStatus},
};

// Re-export pipeline components
pub use pipeline::{
    assemble, AbortReason, Batch, ExtractionPipeline, ExtractionResult, PipelineEvent,
    PredictionPipeline, RepairOutcome, RunOutcome, RunReport, RunWarning, ScrapeSession,
    SessionOutcome, StatusSink,
};

// Re-export stores
pub use stores::{JsonFileStore, MemoryStore};

#[cfg(feature = "sqlite")]
pub use stores::SqliteStore;

#[cfg(feature = "gemini")]
pub use ai::GeminiBackend;

// Re-export testing utilities
pub use testing::{ManualClock, MockBackend};
