//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::credentials::PoolState;
use crate::error::Result;
use crate::sources::normalize_site;
use crate::traits::store::{CredentialRepository, HistoryRepository, PredictionRepository, StopSignal};
use crate::types::{history::SiteHistory, prediction::PredictionSet};

use super::RunState;

/// In-memory storage for history, credentials, predictions and run state.
///
/// Useful for testing and development. Not suitable for production
/// as data is lost on restart, and a stop requested here is only visible
/// inside this process.
pub struct MemoryStore {
    histories: RwLock<HashMap<String, SiteHistory>>,
    pool: RwLock<Option<PoolState>>,
    predictions: RwLock<HashMap<String, PredictionSet>>,
    runs: RwLock<HashMap<String, RunState>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store whose run state ages by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            pool: RwLock::new(None),
            predictions: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Get the number of sites with saved history.
    pub fn history_count(&self) -> usize {
        self.histories.read().unwrap().len()
    }

    fn run_state(&self, site: &str) -> Option<RunState> {
        let now = self.clock.now();
        self.runs
            .read()
            .unwrap()
            .get(&normalize_site(site))
            .filter(|state| state.is_fresh(now))
            .cloned()
    }

    fn update_run<F: FnOnce(&mut RunState)>(&self, site: &str, update: F) {
        let key = normalize_site(site);
        let now = self.clock.now();
        let mut runs = self.runs.write().unwrap();
        let state = runs
            .entry(key.clone())
            .or_insert_with(|| RunState::new(key, now));
        if !state.is_fresh(now) {
            *state = RunState::new(state.site.clone(), now);
        }
        update(state);
        state.updated_at = now;
    }
}

#[async_trait]
impl HistoryRepository for MemoryStore {
    async fn load_history(&self, site: &str) -> Result<Option<SiteHistory>> {
        Ok(self
            .histories
            .read()
            .unwrap()
            .get(&normalize_site(site))
            .cloned())
    }

    async fn save_history(&self, history: &SiteHistory) -> Result<()> {
        self.histories
            .write()
            .unwrap()
            .insert(normalize_site(&history.site), history.clone());
        Ok(())
    }

    async fn delete_history(&self, site: &str) -> Result<bool> {
        Ok(self
            .histories
            .write()
            .unwrap()
            .remove(&normalize_site(site))
            .is_some())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn load_pool(&self) -> Result<Option<PoolState>> {
        Ok(self.pool.read().unwrap().clone())
    }

    async fn save_pool(&self, state: &PoolState) -> Result<()> {
        *self.pool.write().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[async_trait]
impl PredictionRepository for MemoryStore {
    async fn load_predictions(&self, site: &str) -> Result<Option<PredictionSet>> {
        Ok(self
            .predictions
            .read()
            .unwrap()
            .get(&normalize_site(site))
            .cloned())
    }

    async fn save_predictions(&self, predictions: &PredictionSet) -> Result<()> {
        self.predictions
            .write()
            .unwrap()
            .insert(normalize_site(&predictions.site), predictions.clone());
        Ok(())
    }
}

#[async_trait]
impl StopSignal for MemoryStore {
    async fn request_stop(&self, site: &str) -> Result<()> {
        self.update_run(site, |state| state.should_stop = true);
        Ok(())
    }

    async fn should_stop(&self, site: &str) -> Result<bool> {
        Ok(self.run_state(site).is_some_and(|s| s.should_stop))
    }

    async fn mark_in_progress(&self, site: &str) -> Result<()> {
        self.update_run(site, |state| {
            state.in_progress = true;
            state.should_stop = false;
        });
        Ok(())
    }

    async fn is_in_progress(&self, site: &str) -> Result<bool> {
        Ok(self.run_state(site).is_some_and(|s| s.in_progress))
    }

    async fn clear(&self, site: &str) -> Result<()> {
        self.runs.write().unwrap().remove(&normalize_site(site));
        Ok(())
    }
}
