//! URL-keyed, append-only version history per site.
//!
//! [`HistoryStore`] is the only writer of [`SiteHistory`] documents. Every
//! mutation is a load-modify-save cycle over a [`HistoryRepository`],
//! serialized inside the process by a write gate; across processes the
//! [`OperationLock`](crate::lock::LockManager) keeps scrape and prediction
//! runs apart.
//!
//! Identity is the detail-page URL and nothing else. Two records with the
//! same URL are the same call whatever their names; two records with
//! different URLs never merge.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dates::{is_iso_date, parse_date};
use crate::error::Result;
use crate::sources::normalize_site;
use crate::status::{is_suspended_url, SUSPENDED_URL_MARKER};
use crate::traits::store::HistoryRepository;
use crate::types::history::{HistoryEntry, PreviousVersion, SiteHistory, VersionSnapshot};
use crate::types::record::{ExtractedRecord, RecordIssue, RecordStatus, UNTITLED_RECORD};

/// Days between consecutive editions that count as a yearly cadence.
const ANNUAL_INTERVAL_DAYS: std::ops::RangeInclusive<i64> = 300..=400;

// ============================================================================
// Reconcile types
// ============================================================================

/// Detail-page data gathered outside extraction, keyed by record URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Enrichment {
    /// Full detail-page text
    pub page_snapshot: Option<String>,

    /// Earlier editions listed on the detail page
    pub previous_versions: Vec<PreviousVersion>,
}

/// What one reconcile call changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// URLs of entries created by this call
    pub new_entries: Vec<String>,

    /// URLs of existing entries seen again
    pub touched_entries: Vec<String>,

    /// Snapshots written, initial ones included
    pub appended_versions: usize,

    /// Candidates excluded because they had no detail-page URL
    pub rejected: Vec<RecordIssue>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.new_entries.is_empty() && self.appended_versions == 0
    }
}

// ============================================================================
// Maintenance types
// ============================================================================

/// Why an entry counts as incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    GenericName,
    MissingStatus,
    MissingOpeningDate,
    MissingClosingDate,
    /// A date is present but not `YYYY-MM-DD`
    MalformedDate,
}

/// An entry whose latest version lacks essential data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncompleteEntry {
    pub url: String,
    pub name: String,
    pub status: Option<RecordStatus>,
    pub opening_date: Option<String>,
    pub closing_date: Option<String>,
    pub reasons: Vec<IncompleteReason>,
}

/// How the cadence of a call was inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Openings roughly one year apart
    Annual,
    /// No opening pattern, but closings roughly one year apart
    AnnualFromClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternConfidence {
    Low,
    Medium,
    High,
}

/// Date pattern across the versions of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub url: String,
    pub total_versions: usize,

    /// Versions detected inside the window
    pub relevant_versions: usize,

    /// Distinct parsed opening dates, ascending
    pub openings: Vec<NaiveDate>,

    /// Distinct parsed closing dates, ascending
    pub closings: Vec<NaiveDate>,

    /// Mean opening month (1-12), rounded
    pub average_opening_month: Option<u32>,

    pub cadence: Option<Cadence>,

    pub predicted_opening: Option<NaiveDate>,

    pub confidence: PatternConfidence,
}

impl PatternAnalysis {
    pub fn is_annual(&self) -> bool {
        self.cadence.is_some()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Reconciliation and maintenance over persisted site histories.
pub struct HistoryStore {
    repo: Arc<dyn HistoryRepository>,
    clock: Arc<dyn Clock>,
    write_gate: Mutex<()>,
}

impl HistoryStore {
    pub fn new(repo: Arc<dyn HistoryRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            clock,
            write_gate: Mutex::new(()),
        }
    }

    /// Load a site's history, or an empty one if nothing was saved yet.
    pub async fn load_or_new(&self, site: &str) -> Result<SiteHistory> {
        let site = normalize_site(site);
        Ok(self
            .repo
            .load_history(&site)
            .await?
            .unwrap_or_else(|| SiteHistory::new(site, self.clock.now())))
    }

    /// Merge candidate records into the site's history.
    ///
    /// Records without a URL are rejected. An existing entry gets a new
    /// snapshot only when its opening date, closing date or status changed;
    /// otherwise only `last_seen_at` moves. Calling twice with the same input
    /// appends nothing the second time.
    pub async fn reconcile(
        &self,
        site: &str,
        records: &[ExtractedRecord],
        enrichment: &HashMap<String, Enrichment>,
    ) -> Result<ReconcileOutcome> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.now();
        let mut history = self.load_or_new(site).await?;
        let mut outcome = ReconcileOutcome::default();

        let mut index: HashMap<String, usize> = history
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.url.clone(), i))
            .collect();

        let mut candidates: IndexMap<String, &ExtractedRecord> = IndexMap::new();
        for record in records {
            let Some(url) = record.resolved_url().map(str::to_string) else {
                debug!(site = %history.site, name = %record.name, "Rejecting record without URL");
                outcome.rejected.push(RecordIssue::MissingUrl {
                    name: record.name.clone(),
                });
                continue;
            };

            match candidates.get_mut(&url) {
                // a model record beats a fallback for the same URL
                Some(kept) if kept.model_missed && !record.model_missed => *kept = record,
                Some(_) => {
                    debug!(site = %history.site, url = %url, "Dropping duplicate candidate");
                }
                None => {
                    candidates.insert(url, record);
                }
            }
        }

        for (url, record) in candidates {
            let mut candidate = record.clone();
            candidate.url = Some(url.clone());
            if is_suspended_url(Some(&url)) {
                candidate.status = Some(RecordStatus::Suspended);
            }
            let extra = enrichment.get(&url);

            match index.get(&url) {
                Some(&position) => {
                    let entry = &mut history.entries[position];
                    if merge_into(entry, &candidate, extra, now) {
                        outcome.appended_versions += 1;
                    }
                    if !outcome.touched_entries.contains(&url)
                        && !outcome.new_entries.contains(&url)
                    {
                        outcome.touched_entries.push(url);
                    }
                }
                None => {
                    history.entries.push(new_entry(&candidate, &url, extra, now));
                    index.insert(url.clone(), history.entries.len() - 1);
                    outcome.appended_versions += 1;
                    outcome.new_entries.push(url);
                }
            }
        }

        history.last_updated = now;
        self.repo.save_history(&history).await?;

        info!(
            site = %history.site,
            candidates = records.len(),
            new = outcome.new_entries.len(),
            touched = outcome.touched_entries.len(),
            versions = outcome.appended_versions,
            rejected = outcome.rejected.len(),
            "Reconciled history"
        );

        Ok(outcome)
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete_entry(&self, site: &str, url: &str) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        let mut history = self.load_or_new(site).await?;
        let before = history.entries.len();
        history.entries.retain(|e| e.url != url.trim());

        if history.entries.len() == before {
            warn!(site = %history.site, url = %url, "No history entry to delete");
            return Ok(false);
        }

        history.last_updated = self.clock.now();
        self.repo.save_history(&history).await?;
        info!(site = %history.site, url = %url, "Deleted history entry");
        Ok(true)
    }

    /// Remove every entry of a site, keeping the (empty) document.
    /// Returns how many entries were removed.
    pub async fn clear(&self, site: &str) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let mut history = self.load_or_new(site).await?;
        let removed = history.entries.len();
        history.entries.clear();
        history.last_updated = self.clock.now();
        self.repo.save_history(&history).await?;
        info!(site = %history.site, removed, "Cleared history");
        Ok(removed)
    }

    /// Append a `Suspended` snapshot to entries whose URL carries the
    /// suspended marker but whose latest status says otherwise.
    /// Returns the URLs fixed.
    pub async fn fix_suspended_by_url(&self, site: &str) -> Result<Vec<String>> {
        let _gate = self.write_gate.lock().await;
        let now = self.clock.now();
        let mut history = self.load_or_new(site).await?;
        let mut fixed = Vec::new();

        for entry in history
            .entries
            .iter_mut()
            .filter(|e| e.url.contains(SUSPENDED_URL_MARKER))
        {
            if entry.latest_status() == Some(RecordStatus::Suspended) {
                continue;
            }

            let snapshot = match entry.latest() {
                Some(latest) => VersionSnapshot {
                    status: Some(RecordStatus::Suspended),
                    detected_at: now,
                    page_snapshot: None,
                    ..latest.clone()
                },
                None => VersionSnapshot {
                    opening_date: None,
                    closing_date: None,
                    status: Some(RecordStatus::Suspended),
                    funding: entry.funding.clone(),
                    description: entry.description.clone(),
                    sub_area: entry.sub_area.clone(),
                    detected_at: now,
                    page_snapshot: None,
                },
            };
            entry.versions.push(snapshot);
            fixed.push(entry.url.clone());
        }

        if !fixed.is_empty() {
            history.last_updated = now;
            self.repo.save_history(&history).await?;
            info!(site = %history.site, fixed = fixed.len(), "Marked suspended entries");
        }

        Ok(fixed)
    }

    /// Entries whose latest version lacks a usable name, status or dates.
    ///
    /// Entries without URL, with a suspended URL, or already suspended are
    /// skipped: they cannot be or need not be repaired.
    pub async fn find_incomplete(&self, site: &str) -> Result<Vec<IncompleteEntry>> {
        let history = self.load_or_new(site).await?;

        Ok(history
            .entries
            .iter()
            .filter(|e| !e.url.trim().is_empty() && !e.url.contains(SUSPENDED_URL_MARKER))
            .filter(|e| e.latest_status() != Some(RecordStatus::Suspended))
            .filter_map(incomplete_entry)
            .collect())
    }

    /// Date pattern of one call across versions detected in the last
    /// `window_years` years. `None` without at least two such versions.
    pub async fn analyze_patterns(
        &self,
        site: &str,
        url: &str,
        window_years: u32,
    ) -> Result<Option<PatternAnalysis>> {
        let history = self.load_or_new(site).await?;
        let Some(entry) = history.find(url) else {
            return Ok(None);
        };

        let cutoff = self.clock.now() - ChronoDuration::days(i64::from(window_years) * 365);
        Ok(analyze_entry(entry, cutoff))
    }
}

// ============================================================================
// Merge helpers
// ============================================================================

fn new_entry(
    record: &ExtractedRecord,
    url: &str,
    enrichment: Option<&Enrichment>,
    now: DateTime<Utc>,
) -> HistoryEntry {
    let page_snapshot = enrichment.and_then(|e| e.page_snapshot.clone());
    HistoryEntry {
        name: record.name.clone(),
        url: url.to_string(),
        organization: record.organization.clone(),
        funding: record.funding.clone(),
        description: record.description.clone(),
        sub_area: record.sub_area.clone(),
        first_seen_at: now,
        last_seen_at: now,
        versions: vec![VersionSnapshot::from_record(record, now, page_snapshot.clone())],
        previous_versions: enrichment
            .map(|e| e.previous_versions.clone())
            .unwrap_or_default(),
        previous_versions_updated_at: enrichment.map(|_| now),
        latest_page_snapshot: page_snapshot,
    }
}

/// Update an existing entry. Returns whether a snapshot was appended.
fn merge_into(
    entry: &mut HistoryEntry,
    record: &ExtractedRecord,
    enrichment: Option<&Enrichment>,
    now: DateTime<Utc>,
) -> bool {
    entry.last_seen_at = now;

    if is_generic_name(&entry.name) && !is_generic_name(&record.name) {
        entry.name = record.name.clone();
    }
    if entry.organization.trim().is_empty() {
        entry.organization = record.organization.clone();
    }
    backfill(&mut entry.funding, &record.funding);
    backfill(&mut entry.description, &record.description);
    backfill(&mut entry.sub_area, &record.sub_area);

    let page_snapshot = enrichment.and_then(|e| e.page_snapshot.clone());
    if let Some(extra) = enrichment {
        entry.previous_versions = extra.previous_versions.clone();
        entry.previous_versions_updated_at = Some(now);
        if page_snapshot.is_some() {
            entry.latest_page_snapshot = page_snapshot.clone();
        }
    }

    let changed = entry.latest().map_or(true, |last| last.differs_from(record));
    if changed {
        entry
            .versions
            .push(VersionSnapshot::from_record(record, now, page_snapshot));
    }
    changed
}

fn backfill(slot: &mut Option<String>, value: &Option<String>) {
    let empty = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    if empty && value.as_deref().is_some_and(|v| !v.trim().is_empty()) {
        *slot = value.clone();
    }
}

fn is_generic_name(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name.eq_ignore_ascii_case(UNTITLED_RECORD)
}

// ============================================================================
// Analysis helpers
// ============================================================================

fn is_malformed_date(date: Option<&str>) -> bool {
    match date.map(str::trim) {
        None | Some("") => false,
        Some(d) => d.contains("**") || !is_iso_date(d),
    }
}

fn incomplete_entry(entry: &HistoryEntry) -> Option<IncompleteEntry> {
    let latest = entry.latest();
    let status = latest.and_then(|v| v.status);
    let opening = latest.and_then(|v| v.opening_date.clone());
    let closing = latest.and_then(|v| v.closing_date.clone());
    let blank = |d: &Option<String>| d.as_deref().map_or(true, |s| s.trim().is_empty());

    let mut reasons = Vec::new();
    if is_generic_name(&entry.name) {
        reasons.push(IncompleteReason::GenericName);
    }
    if status.is_none() {
        reasons.push(IncompleteReason::MissingStatus);
    }
    if blank(&opening) {
        reasons.push(IncompleteReason::MissingOpeningDate);
    }
    if blank(&closing) {
        reasons.push(IncompleteReason::MissingClosingDate);
    }
    if is_malformed_date(opening.as_deref()) || is_malformed_date(closing.as_deref()) {
        reasons.push(IncompleteReason::MalformedDate);
    }

    if reasons.is_empty() {
        return None;
    }

    Some(IncompleteEntry {
        url: entry.url.clone(),
        name: entry.name.clone(),
        status,
        opening_date: opening,
        closing_date: closing,
        reasons,
    })
}

fn analyze_entry(entry: &HistoryEntry, cutoff: DateTime<Utc>) -> Option<PatternAnalysis> {
    let relevant: Vec<&VersionSnapshot> = entry
        .versions
        .iter()
        .filter(|v| v.detected_at >= cutoff)
        .collect();

    if relevant.len() < 2 {
        return None;
    }

    let openings = sorted_dates(relevant.iter().filter_map(|v| v.opening_date.as_deref()));
    let closings = sorted_dates(relevant.iter().filter_map(|v| v.closing_date.as_deref()));

    let average_opening_month = (!openings.is_empty()).then(|| {
        let total: u32 = openings.iter().map(|d| d.month()).sum();
        (f64::from(total) / openings.len() as f64).round() as u32
    });

    let (cadence, predicted_opening, confidence) =
        match (annual_projection(&openings), annual_projection(&closings)) {
            (Some(next), _) => {
                let confidence = if openings.len() >= 3 {
                    PatternConfidence::High
                } else {
                    PatternConfidence::Medium
                };
                (Some(Cadence::Annual), Some(next), confidence)
            }
            (None, Some(next)) => (
                Some(Cadence::AnnualFromClosing),
                Some(next),
                PatternConfidence::Medium,
            ),
            (None, None) => (None, None, PatternConfidence::Low),
        };

    Some(PatternAnalysis {
        url: entry.url.clone(),
        total_versions: entry.versions.len(),
        relevant_versions: relevant.len(),
        openings,
        closings,
        average_opening_month,
        cadence,
        predicted_opening,
        confidence,
    })
}

fn sorted_dates<'a>(texts: impl Iterator<Item = &'a str>) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = texts.filter_map(parse_date).collect();
    dates.sort();
    dates.dedup();
    dates
}

/// Next date one average interval after the last, if the dates are yearly.
fn annual_projection(dates: &[NaiveDate]) -> Option<NaiveDate> {
    if dates.len() < 2 {
        return None;
    }

    let intervals: Vec<i64> = dates
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_days())
        .collect();
    let average = intervals.iter().sum::<i64>() / intervals.len() as i64;

    if !ANNUAL_INTERVAL_DAYS.contains(&average) {
        return None;
    }
    dates
        .last()
        .map(|last| *last + ChronoDuration::days(average))
}
