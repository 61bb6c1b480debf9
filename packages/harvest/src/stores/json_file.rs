//! JSON file storage.
//!
//! Layout under the data directory:
//!
//! ```text
//! history/history_<site>.json
//! predictions/predictions_<site>.json
//! run_state/<site>.json
//! credentials.json            (0600 on Unix)
//! ```
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a crash never leaves a half-written document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::credentials::PoolState;
use crate::error::Result;
use crate::sources::site_key;
use crate::traits::store::{CredentialRepository, HistoryRepository, PredictionRepository, StopSignal};
use crate::types::{history::SiteHistory, prediction::PredictionSet};

use super::RunState;

/// File-backed store rooted at a data directory.
#[derive(Clone)]
pub struct JsonFileStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_path(&self, site: &str) -> PathBuf {
        self.root
            .join("history")
            .join(format!("history_{}.json", site_key(site)))
    }

    pub fn predictions_path(&self, site: &str) -> PathBuf {
        self.root
            .join("predictions")
            .join(format!("predictions_{}.json", site_key(site)))
    }

    pub fn run_state_path(&self, site: &str) -> PathBuf {
        self.root
            .join("run_state")
            .join(format!("{}.json", site_key(site)))
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    async fn load_run_state(&self, site: &str) -> Option<RunState> {
        let path = self.run_state_path(site);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<RunState>(&bytes) {
            Ok(state) if state.is_fresh(self.clock.now()) => Some(state),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable run state");
                None
            }
        }
    }

    async fn update_run<F: FnOnce(&mut RunState)>(&self, site: &str, update: F) -> Result<()> {
        let now = self.clock.now();
        let mut state = self
            .load_run_state(site)
            .await
            .unwrap_or_else(|| RunState::new(crate::sources::normalize_site(site), now));
        update(&mut state);
        state.updated_at = now;
        write_json(&self.run_state_path(site), &state, false).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body).await?;

    if private {
        restrict_permissions(&tmp).await?;
    }

    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = body.len(), "Wrote JSON document");
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl HistoryRepository for JsonFileStore {
    async fn load_history(&self, site: &str) -> Result<Option<SiteHistory>> {
        read_json(&self.history_path(site)).await
    }

    async fn save_history(&self, history: &SiteHistory) -> Result<()> {
        write_json(&self.history_path(&history.site), history, false).await
    }

    async fn delete_history(&self, site: &str) -> Result<bool> {
        remove_if_exists(&self.history_path(site)).await
    }
}

#[async_trait]
impl CredentialRepository for JsonFileStore {
    async fn load_pool(&self) -> Result<Option<PoolState>> {
        read_json(&self.credentials_path()).await
    }

    async fn save_pool(&self, state: &PoolState) -> Result<()> {
        write_json(&self.credentials_path(), state, true).await
    }
}

#[async_trait]
impl PredictionRepository for JsonFileStore {
    async fn load_predictions(&self, site: &str) -> Result<Option<PredictionSet>> {
        read_json(&self.predictions_path(site)).await
    }

    async fn save_predictions(&self, predictions: &PredictionSet) -> Result<()> {
        write_json(&self.predictions_path(&predictions.site), predictions, false).await
    }
}

#[async_trait]
impl StopSignal for JsonFileStore {
    async fn request_stop(&self, site: &str) -> Result<()> {
        self.update_run(site, |state| state.should_stop = true).await
    }

    async fn should_stop(&self, site: &str) -> Result<bool> {
        Ok(self.load_run_state(site).await.is_some_and(|s| s.should_stop))
    }

    async fn mark_in_progress(&self, site: &str) -> Result<()> {
        self.update_run(site, |state| {
            state.in_progress = true;
            state.should_stop = false;
        })
        .await
    }

    async fn is_in_progress(&self, site: &str) -> Result<bool> {
        Ok(self.load_run_state(site).await.is_some_and(|s| s.in_progress))
    }

    async fn clear(&self, site: &str) -> Result<()> {
        remove_if_exists(&self.run_state_path(site)).await?;
        Ok(())
    }
}
