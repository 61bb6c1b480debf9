//! Storage traits for history, credentials, predictions and stop signals.
//!
//! Each trait persists one document per key; the format is up to the
//! implementation as long as `load` returns what `save` last stored.

use async_trait::async_trait;

use crate::credentials::PoolState;
use crate::error::Result;
use crate::types::{history::SiteHistory, prediction::PredictionSet};

/// Durable per-site history.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Load a site's history, `None` if nothing was saved yet.
    async fn load_history(&self, site: &str) -> Result<Option<SiteHistory>>;

    /// Replace a site's history.
    async fn save_history(&self, history: &SiteHistory) -> Result<()>;

    /// Remove a site's history. Returns whether anything was removed.
    async fn delete_history(&self, site: &str) -> Result<bool>;
}

/// Durable credential pool state.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn load_pool(&self) -> Result<Option<PoolState>>;

    async fn save_pool(&self, state: &PoolState) -> Result<()>;
}

/// Durable prediction results.
#[async_trait]
pub trait PredictionRepository: Send + Sync {
    async fn load_predictions(&self, site: &str) -> Result<Option<PredictionSet>>;

    async fn save_predictions(&self, predictions: &PredictionSet) -> Result<()>;
}

/// Cross-process "should stop" flag for one site.
#[async_trait]
pub trait StopSignal: Send + Sync {
    /// Ask any run on the site to stop at its next check.
    async fn request_stop(&self, site: &str) -> Result<()>;

    /// Whether a stop was requested and is still fresh.
    async fn should_stop(&self, site: &str) -> Result<bool>;

    /// Record that a run started on the site, clearing any previous stop.
    async fn mark_in_progress(&self, site: &str) -> Result<()>;

    /// Whether a run is recorded as in progress and is still fresh.
    async fn is_in_progress(&self, site: &str) -> Result<bool>;

    /// Forget all run state for the site.
    async fn clear(&self, site: &str) -> Result<()>;
}
