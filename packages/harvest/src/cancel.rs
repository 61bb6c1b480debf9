//! Cooperative cancellation for pipeline runs.
//!
//! A [`RunControl`] combines an in-process [`CancellationToken`] with an
//! optional durable [`StopSignal`] so a stop requested from another process
//! (the CLI `stop` command) is observed at the next check point.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::traits::store::StopSignal;

/// Cancellation handle passed into `run()`.
#[derive(Clone)]
pub struct RunControl {
    site: String,
    token: CancellationToken,
    signal: Option<Arc<dyn StopSignal>>,
}

impl RunControl {
    /// In-process control only.
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            token: CancellationToken::new(),
            signal: None,
        }
    }

    /// Also poll a durable stop signal.
    pub fn with_signal(mut self, signal: Arc<dyn StopSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Share an existing token (e.g. a Ctrl-C handler's).
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Request a stop from inside this process.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the run should stop accepting new work.
    ///
    /// A durable stop, once seen, also cancels the token so later checks
    /// don't hit storage again. Storage errors count as "keep going".
    pub async fn should_stop(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }

        let Some(signal) = &self.signal else {
            return false;
        };

        match signal.should_stop(&self.site).await {
            Ok(true) => {
                info!(site = %self.site, "Stop requested");
                self.token.cancel();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(site = %self.site, error = %e, "Failed to read stop signal");
                false
            }
        }
    }

    /// Record the run as in progress in the durable signal, if any.
    pub async fn begin(&self) {
        if let Some(signal) = &self.signal {
            if let Err(e) = signal.mark_in_progress(&self.site).await {
                warn!(site = %self.site, error = %e, "Failed to mark run in progress");
            }
        }
    }

    /// Clear the durable run state, if any.
    pub async fn finish(&self) {
        if let Some(signal) = &self.signal {
            if let Err(e) = signal.clear(&self.site).await {
                warn!(site = %self.site, error = %e, "Failed to clear run state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;

    #[tokio::test]
    async fn test_token_cancel() {
        let control = RunControl::new("anid.cl");
        assert!(!control.should_stop().await);
        control.cancel();
        assert!(control.should_stop().await);
    }

    #[tokio::test]
    async fn test_durable_stop_cancels_token() {
        let store = Arc::new(MemoryStore::new());
        let control = RunControl::new("anid.cl").with_signal(store.clone());

        control.begin().await;
        assert!(store.is_in_progress("anid.cl").await.unwrap());
        assert!(!control.should_stop().await);

        store.request_stop("anid.cl").await.unwrap();
        assert!(control.should_stop().await);
        assert!(control.token().is_cancelled());

        control.finish().await;
        assert!(!store.is_in_progress("anid.cl").await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_for_other_site_ignored() {
        let store = Arc::new(MemoryStore::new());
        let control = RunControl::new("anid.cl").with_signal(store.clone());

        store.request_stop("cnachile.cl").await.unwrap();
        assert!(!control.should_stop().await);
    }
}
