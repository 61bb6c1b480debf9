//! The prediction pipeline.
//!
//! Closed calls are paired with the earlier editions recorded in history and
//! sent to the model in batches. Every target ends as exactly one prediction
//! or one [`Unpredictable`] entry; the run fails with
//! [`HarvestError::Integrity`] if that does not hold.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::prompts::format_prediction_prompt;
use crate::cancel::RunControl;
use crate::clock::Clock;
use crate::dates::parse_date;
use crate::error::{HarvestError, Result};
use crate::generation::GenerationClient;
use crate::history::HistoryStore;
use crate::lock::{LockManager, OperationKind};
use crate::sources::normalize_site;
use crate::traits::store::PredictionRepository;
use crate::types::config::PredictionConfig;
use crate::types::history::{HistoryEntry, SiteHistory};
use crate::types::prediction::{
    Prediction, PredictionItem, PredictionSet, PredictionTarget, Unpredictable,
    UnpredictableReason,
};
use crate::types::record::RecordStatus;

// ============================================================================
// Response schema
// ============================================================================

/// Prediction response schema.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PredictionResponse {
    pub items: Vec<PredictionResponseItem>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PredictionResponseItem {
    /// URL of the call being predicted, as given in the prompt
    pub record_url: String,
    pub prediction: ModelPrediction,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ModelPrediction {
    /// Whether the earlier editions are really the same call
    pub same_call: bool,

    /// Next opening date as YYYY-MM-DD
    #[serde(default)]
    pub predicted_date: Option<String>,

    #[serde(default)]
    pub rationale: String,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Predicts the next opening date of closed calls.
pub struct PredictionPipeline {
    client: GenerationClient,
    history: Arc<HistoryStore>,
    predictions: Arc<dyn PredictionRepository>,
    locks: Arc<LockManager>,
    config: PredictionConfig,
    clock: Arc<dyn Clock>,
}

impl PredictionPipeline {
    pub fn new(
        client: GenerationClient,
        history: Arc<HistoryStore>,
        predictions: Arc<dyn PredictionRepository>,
        locks: Arc<LockManager>,
        config: PredictionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let generation = client
            .config()
            .clone()
            .with_max_output_tokens(config.max_output_tokens);
        Self {
            client: client.with_config(generation),
            history,
            predictions,
            locks,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Predict every closed call of `site` and save the results.
    ///
    /// Refuses to start while a scrape holds the site, and holds the
    /// site's predict lock for the whole run.
    pub async fn run(&self, site: &str, control: &RunControl) -> Result<PredictionSet> {
        let site = normalize_site(site);

        if self.locks.is_locked(&site, OperationKind::Scrape).await {
            warn!(site = %site, "Scrape in progress, not predicting");
            return Err(HarvestError::Busy {
                site,
                kind: OperationKind::Scrape,
            });
        }

        let guard = self
            .locks
            .acquire(&site, OperationKind::Predict, Some(self.config.lock_timeout))
            .await?;

        let history = self.history.load_or_new(&site).await?;
        let targets = closed_targets(&history);
        info!(site = %site, entries = history.len(), closed = targets.len(), "Predicting closed calls");

        let set = self.predict(&history, &targets, control).await?;
        self.predictions.save_predictions(&set).await?;
        guard.release()?;

        info!(
            site = %site,
            predictions = set.predictions.len(),
            unpredictable = set.unpredictable.len(),
            "Predictions saved"
        );
        Ok(set)
    }

    /// Predict `targets` against `history` without locking or saving.
    pub async fn predict(
        &self,
        history: &SiteHistory,
        targets: &[PredictionTarget],
        control: &RunControl,
    ) -> Result<PredictionSet> {
        let now = self.clock.now();
        let today = self.clock.today();
        let mut set = PredictionSet {
            site: history.site.clone(),
            generated_at: now,
            predictions: Vec::new(),
            unpredictable: Vec::new(),
        };

        let mut items = Vec::new();
        for target in targets {
            match prepare_item(history, target) {
                Ok(item) => items.push(item),
                Err(reason) => {
                    debug!(url = %target.url, %reason, "Not predictable");
                    set.unpredictable
                        .push(unpredictable(&target.url, &target.name, reason, None, now));
                }
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<&[PredictionItem]> = items.chunks(batch_size).collect();
        let total = batches.len();
        let mut stop: Option<(UnpredictableReason, Option<String>)> = None;

        for (index, batch) in batches.into_iter().enumerate() {
            if stop.is_none() && control.should_stop().await {
                info!(site = %history.site, batch = index, "Prediction run cancelled");
                stop = Some((UnpredictableReason::Cancelled, None));
            }

            if let Some((reason, detail)) = &stop {
                for item in batch {
                    set.unpredictable
                        .push(unpredictable(&item.url, &item.name, *reason, detail.clone(), now));
                }
                continue;
            }

            info!(batch = index, total, items = batch.len(), "Predicting batch");

            match self.call_batch(batch, today).await {
                Ok(response) => self.validate_batch(batch, response, today, now, &mut set),
                Err(e) => {
                    warn!(batch = index, error = %e, "Prediction batch failed");
                    let detail = Some(e.to_string());
                    for item in batch {
                        set.unpredictable.push(unpredictable(
                            &item.url,
                            &item.name,
                            UnpredictableReason::BatchFailed,
                            detail.clone(),
                            now,
                        ));
                    }
                    if is_run_terminal(&e) {
                        stop = Some((UnpredictableReason::BatchFailed, detail));
                    }
                }
            }
        }

        if set.total() != targets.len() {
            return Err(HarvestError::Integrity(format!(
                "{} predictions + {} unpredictable != {} targets",
                set.predictions.len(),
                set.unpredictable.len(),
                targets.len()
            )));
        }

        Ok(set)
    }

    /// One batch, retried when the response is unusable. Credential
    /// exhaustion is returned at once.
    async fn call_batch(
        &self,
        batch: &[PredictionItem],
        today: NaiveDate,
    ) -> Result<HashMap<String, ModelPrediction>> {
        let prompt = format_prediction_prompt(batch, today);
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .client
                .invoke_json::<PredictionResponse>(&prompt, self.config.max_output_tokens)
                .await
            {
                Ok(response) => {
                    return Ok(response
                        .items
                        .into_iter()
                        .map(|item| (url_key(&item.record_url), item.prediction))
                        .collect())
                }
                Err(e) if is_run_terminal(&e) => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Prediction call failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.client.config().retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| HarvestError::Config("no prediction attempts".into())))
    }

    fn validate_batch(
        &self,
        batch: &[PredictionItem],
        mut response: HashMap<String, ModelPrediction>,
        today: NaiveDate,
        now: DateTime<Utc>,
        set: &mut PredictionSet,
    ) {
        for item in batch {
            let Some(prediction) = response.remove(&url_key(&item.url)) else {
                set.unpredictable.push(unpredictable(
                    &item.url,
                    &item.name,
                    UnpredictableReason::NoResponse,
                    None,
                    now,
                ));
                continue;
            };

            match validate_prediction(item, &prediction, today) {
                Ok(date) => {
                    debug!(url = %item.url, date = %date, "Prediction accepted");
                    set.predictions.push(Prediction {
                        record_url: item.url.clone(),
                        name: item.name.clone(),
                        predicted_date: date,
                        rationale: prediction.rationale,
                        predicted_at: now,
                    });
                }
                Err(reason) => {
                    debug!(url = %item.url, %reason, "Prediction rejected");
                    let detail = Some(prediction.rationale).filter(|r| !r.trim().is_empty());
                    set.unpredictable
                        .push(unpredictable(&item.url, &item.name, reason, detail, now));
                }
            }
        }
    }
}

/// History entries whose latest status is closed.
pub fn closed_targets(history: &SiteHistory) -> Vec<PredictionTarget> {
    history
        .entries
        .iter()
        .filter(|entry| entry.latest_status() == Some(RecordStatus::Closed))
        .map(|entry| PredictionTarget::new(&entry.url, &entry.name))
        .collect()
}

/// Join a target with its evidence, or say why it cannot be predicted.
fn prepare_item(
    history: &SiteHistory,
    target: &PredictionTarget,
) -> std::result::Result<PredictionItem, UnpredictableReason> {
    let entry = history
        .find(&target.url)
        .ok_or(UnpredictableReason::NotFoundInHistory)?;

    if entry.previous_versions.is_empty() {
        return Err(UnpredictableReason::NoPreviousVersions);
    }
    if is_self_reference(entry) {
        return Err(UnpredictableReason::SelfReference);
    }

    let latest = entry.latest();
    Ok(PredictionItem {
        url: entry.url.clone(),
        name: entry.name.clone(),
        organization: entry.organization.clone(),
        description: entry.description.clone(),
        opening_date: latest.and_then(|v| v.opening_date.clone()),
        closing_date: latest.and_then(|v| v.closing_date.clone()),
        evidence: entry.previous_versions.clone(),
    })
}

/// Every linked earlier edition is the call itself, and at least one is linked.
fn is_self_reference(entry: &HistoryEntry) -> bool {
    let own = url_key(&entry.url);
    let mut linked = entry
        .previous_versions
        .iter()
        .filter_map(|prev| prev.url.as_deref())
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .peekable();

    linked.peek().is_some() && linked.all(|url| url_key(url) == own)
}

/// Check a model prediction against the evidence and the current date.
pub fn validate_prediction(
    item: &PredictionItem,
    prediction: &ModelPrediction,
    today: NaiveDate,
) -> std::result::Result<NaiveDate, UnpredictableReason> {
    if !prediction.same_call {
        return Err(UnpredictableReason::Rejected);
    }
    let text = prediction
        .predicted_date
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("null"))
        .ok_or(UnpredictableReason::Rejected)?;

    let date = parse_date(text).ok_or(UnpredictableReason::UnparseableDate)?;

    if date <= today {
        return Err(UnpredictableReason::DatePast);
    }
    if let Some(latest_year) = item.latest_evidence_year() {
        if date.year() <= latest_year {
            return Err(UnpredictableReason::NotFutureCycle);
        }
    }
    if date.year() - today.year() > 1 {
        return Err(UnpredictableReason::TooFar);
    }

    Ok(date)
}

fn unpredictable(
    url: &str,
    name: &str,
    reason: UnpredictableReason,
    detail: Option<String>,
    marked_at: DateTime<Utc>,
) -> Unpredictable {
    Unpredictable {
        record_url: url.to_string(),
        name: name.to_string(),
        reason,
        detail,
        marked_at,
    }
}

fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn is_run_terminal(error: &HarvestError) -> bool {
    matches!(error, HarvestError::Generation(e) if e.is_run_terminal())
}
