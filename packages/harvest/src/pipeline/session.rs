//! A scrape session: lock, extract, reconcile, release.
//!
//! Repair passes run through the same path, re-fetching only the detail
//! pages of history entries that are still missing data.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::extract::ExtractionPipeline;
use super::report::{RunOutcome, RunReport, RunWarning};
use crate::cancel::RunControl;
use crate::error::{FetchError, Result};
use crate::history::{Enrichment, HistoryStore, ReconcileOutcome};
use crate::lock::{LockManager, OperationKind};
use crate::sources::{fetch_pages, normalize_site};
use crate::traits::source::PageSource;
use crate::types::page::PageContent;
use crate::types::record::ExtractedRecord;

/// Default number of page fetches in flight.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// What a session produced.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub records: Vec<ExtractedRecord>,
    pub report: RunReport,
    pub reconcile: ReconcileOutcome,
}

/// What a repair pass produced.
#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    /// Entries whose suspended URL forced a status change.
    pub suspended_fixed: Vec<String>,
    /// Incomplete entries whose pages were re-fetched.
    pub refetched: Vec<String>,
    /// `None` when nothing was incomplete.
    pub session: Option<SessionOutcome>,
}

/// Runs extraction for one site under its scrape lock and merges the
/// results into history.
pub struct ScrapeSession {
    pipeline: ExtractionPipeline,
    history: Arc<HistoryStore>,
    locks: Arc<LockManager>,
    fetch_concurrency: usize,
}

impl ScrapeSession {
    pub fn new(pipeline: ExtractionPipeline, history: Arc<HistoryStore>, locks: Arc<LockManager>) -> Self {
        Self {
            pipeline,
            history,
            locks,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    /// Extract from `pages` and reconcile. Partial results of an aborted
    /// run are reconciled too.
    pub async fn run(
        &self,
        site: &str,
        pages: &[PageContent],
        enrichment: &HashMap<String, Enrichment>,
        control: &RunControl,
    ) -> Result<SessionOutcome> {
        self.locked(site, OperationKind::Scrape, control, |site| async move {
            self.extract_and_reconcile(&site, pages, Vec::new(), enrichment, control)
                .await
        })
        .await
    }

    /// Fetch `urls` from `source`, then extract and reconcile.
    pub async fn fetch_and_run(
        &self,
        site: &str,
        source: &dyn PageSource,
        urls: &[String],
        enrichment: &HashMap<String, Enrichment>,
        control: &RunControl,
    ) -> Result<SessionOutcome> {
        self.locked(site, OperationKind::Scrape, control, |site| async move {
            self.fetch_extract_reconcile(&site, source, urls, enrichment, control)
                .await
        })
        .await
    }

    /// Fix suspended entries, then re-fetch and re-extract every entry still
    /// missing a name, status or date. Holds the history lock throughout, so
    /// it never interleaves with a scrape of the same site.
    pub async fn repair(
        &self,
        site: &str,
        source: &dyn PageSource,
        enrichment: &HashMap<String, Enrichment>,
        control: &RunControl,
    ) -> Result<RepairOutcome> {
        self.locked(site, OperationKind::Repair, control, |site| async move {
            let suspended_fixed = self.history.fix_suspended_by_url(&site).await?;
            let refetched: Vec<String> = self
                .history
                .find_incomplete(&site)
                .await?
                .into_iter()
                .map(|entry| entry.url)
                .collect();

            if refetched.is_empty() {
                info!(site = %site, fixed = suspended_fixed.len(), "Nothing to repair");
                return Ok(RepairOutcome {
                    suspended_fixed,
                    refetched,
                    session: None,
                });
            }

            info!(site = %site, incomplete = refetched.len(), "Re-fetching incomplete entries");
            let session = self
                .fetch_extract_reconcile(&site, source, &refetched, enrichment, control)
                .await?;
            Ok(RepairOutcome {
                suspended_fixed,
                refetched,
                session: Some(session),
            })
        })
        .await
    }

    async fn fetch_extract_reconcile(
        &self,
        site: &str,
        source: &dyn PageSource,
        urls: &[String],
        enrichment: &HashMap<String, Enrichment>,
        control: &RunControl,
    ) -> Result<SessionOutcome> {
        let fetched = fetch_pages(source, urls, control, self.fetch_concurrency).await;
        let warnings = fetched.failures.iter().map(fetch_warning).collect();
        self.extract_and_reconcile(site, &fetched.pages, warnings, enrichment, control)
            .await
    }

    /// Hold the site lock and the durable run state around `body`.
    async fn locked<T, F, Fut>(
        &self,
        site: &str,
        kind: OperationKind,
        control: &RunControl,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let site = normalize_site(site);
        let timeout = self.locks.config().scrape_timeout;
        let guard = self.locks.acquire(&site, kind, Some(timeout)).await?;
        control.begin().await;

        let outcome = body(site).await;

        control.finish().await;
        let released = guard.release();
        let outcome = outcome?;
        released?;
        Ok(outcome)
    }

    async fn extract_and_reconcile(
        &self,
        site: &str,
        pages: &[PageContent],
        fetch_warnings: Vec<RunWarning>,
        enrichment: &HashMap<String, Enrichment>,
        control: &RunControl,
    ) -> Result<SessionOutcome> {
        let result = self.pipeline.run(site, pages, control).await?;
        let mut report = result.report;
        if !fetch_warnings.is_empty() {
            let mut warnings = fetch_warnings;
            warnings.append(&mut report.warnings);
            report.warnings = warnings;
            if report.outcome == RunOutcome::Completed {
                report.outcome = RunOutcome::CompletedWithWarnings;
            }
        }

        let reconcile = if result.records.is_empty() {
            ReconcileOutcome::default()
        } else {
            if report.outcome.is_aborted() {
                warn!(
                    site = %site,
                    records = result.records.len(),
                    outcome = ?report.outcome,
                    "Run aborted, reconciling partial results"
                );
            }
            self.history.reconcile(site, &result.records, enrichment).await?
        };

        info!(
            site = %site,
            records = result.records.len(),
            new = reconcile.new_entries.len(),
            versions = reconcile.appended_versions,
            "Scrape session finished"
        );

        Ok(SessionOutcome {
            records: result.records,
            report,
            reconcile,
        })
    }
}

fn fetch_warning(error: &FetchError) -> RunWarning {
    match error {
        FetchError::NotFound { url } => RunWarning::FetchFailed {
            url: url.clone(),
            reason: "not found".to_string(),
        },
        FetchError::Failed { url, reason } => RunWarning::FetchFailed {
            url: url.clone(),
            reason: reason.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialPool;
    use crate::error::{BackendError, HarvestError};
    use crate::generation::GenerationClient;
    use crate::sources::StaticPageSource;
    use crate::stores::MemoryStore;
    use crate::testing::{listing_page, record, ManualClock, MockBackend};
    use crate::types::record::RecordStatus;
    use crate::traits::store::{HistoryRepository, StopSignal};
    use crate::types::config::{ExtractionConfig, GenerationConfig, LockConfig};
    use std::time::Duration;

    const LISTING: &str = "https://anid.cl/concursos/?page=1";
    const REGULAR: &str = "https://anid.cl/concursos/fondecyt-regular-2026/";
    const IDEA: &str = "https://anid.cl/concursos/fondef-idea-2026/";

    struct Fixture {
        session: ScrapeSession,
        store: Arc<MemoryStore>,
        history: Arc<HistoryStore>,
        locks: Arc<LockManager>,
        _dir: tempfile::TempDir,
    }

    fn fixture(backend: MockBackend) -> Fixture {
        fixture_with(backend, ExtractionConfig::default())
    }

    fn fixture_with(backend: MockBackend, config: ExtractionConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let pool = Arc::new(CredentialPool::in_memory_with_clock(["A"], clock.clone()));
        let client = GenerationClient::new(Arc::new(backend), pool, GenerationConfig::default());
        let pipeline = ExtractionPipeline::new(client, config, clock.clone());
        let history = Arc::new(HistoryStore::new(store.clone(), clock.clone()));
        let locks = Arc::new(LockManager::new(
            dir.path(),
            LockConfig::default().with_poll_interval(Duration::from_millis(100)),
            clock,
        ));

        Fixture {
            session: ScrapeSession::new(pipeline, history.clone(), locks.clone()),
            store,
            history,
            locks,
            _dir: dir,
        }
    }

    fn listing() -> PageContent {
        listing_page(
            LISTING,
            "FONDECYT Regular 2026 ... FONDEF IDeA 2026 ...",
            &[(REGULAR, "FONDECYT Regular 2026"), (IDEA, "FONDEF IDeA 2026")],
        )
    }

    fn response() -> String {
        serde_json::json!({ "records": [
            { "name": "FONDECYT Regular 2026", "closing_date": "19 de junio, 2025", "url": REGULAR },
        ]})
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reconciles_records_and_fallbacks() {
        let f = fixture(MockBackend::new().with_response(response()));
        let control = RunControl::new("anid.cl").with_signal(f.store.clone());

        let outcome = f
            .session
            .run("https://anid.cl", &[listing()], &HashMap::new(), &control)
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.reconcile.new_entries, vec![REGULAR.to_string(), IDEA.to_string()]);
        assert_eq!(f.store.load_history("anid.cl").await.unwrap().unwrap().len(), 2);
        assert!(!f.locks.is_locked("anid.cl", OperationKind::Scrape).await);
        assert!(!f.store.is_in_progress("anid.cl").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_reconciled_after_abort() {
        let backend = MockBackend::new()
            .with_response(response())
            .with_error(BackendError::http(429, "You exceeded your current quota"));
        let f = fixture_with(
            backend,
            ExtractionConfig::default()
                .with_batch_size(10)
                .with_quality_retry(false),
        );
        let second = listing_page(
            "https://anid.cl/concursos/?page=2",
            "Becas ...",
            &[("https://anid.cl/concursos/becas-2026/", "Becas 2026")],
        );

        let outcome = f
            .session
            .run("anid.cl", &[listing(), second], &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert!(outcome.report.outcome.is_aborted());
        assert_eq!(outcome.reconcile.new_entries.len(), 2);
        assert!(!f.locks.is_locked("anid.cl", OperationKind::Scrape).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_become_warnings() {
        let f = fixture(MockBackend::new().with_response(response()));
        let source = StaticPageSource::new([listing()]);
        let urls = vec![LISTING.to_string(), "https://anid.cl/concursos/?page=9".to_string()];

        let outcome = f
            .session
            .fetch_and_run("anid.cl", &source, &urls, &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert!(matches!(
            &outcome.report.warnings[0],
            RunWarning::FetchFailed { url, .. } if url == "https://anid.cl/concursos/?page=9"
        ));
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_held_lock_then_times_out() {
        let f = fixture(MockBackend::new());
        let _held = f
            .locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();

        let err = f
            .session
            .run("anid.cl", &[listing()], &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::LockTimeout { kind: OperationKind::Scrape, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_refetches_incomplete_entries() {
        let response = serde_json::json!({ "records": [{
            "name": "FONDEF IDeA 2026",
            "opening_date": "2026-04-01",
            "closing_date": "2026-06-01",
            "url": IDEA,
        }]});
        let f = fixture(MockBackend::new().with_response(response.to_string()));
        let suspended = "https://anid.cl/concurso-suspendido/becas-2026/";

        let mut complete = record("FONDECYT Regular 2026", REGULAR);
        complete.opening_date = Some("2025-05-01".into());
        complete.closing_date = Some("2025-07-01".into());
        complete.status = Some(RecordStatus::Open);
        f.history
            .reconcile(
                "anid.cl",
                &[complete, record("FONDEF IDeA 2026", IDEA), record("Becas 2026", suspended)],
                &HashMap::new(),
            )
            .await
            .unwrap();
        let mut stored = f.store.load_history("anid.cl").await.unwrap().unwrap();
        for entry in &mut stored.entries {
            if entry.url == suspended {
                entry.versions[0].status = Some(RecordStatus::Open);
            }
        }
        f.store.save_history(&stored).await.unwrap();

        let source = StaticPageSource::new([PageContent::new(
            IDEA,
            "FONDEF IDeA 2026. Apertura 1 de abril 2026, cierre 1 de junio 2026.",
        )]);
        let outcome = f
            .session
            .repair("anid.cl", &source, &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(outcome.suspended_fixed, vec![suspended.to_string()]);
        assert_eq!(outcome.refetched, vec![IDEA.to_string()]);
        let session = outcome.session.unwrap();
        assert_eq!(session.reconcile.appended_versions, 1);

        assert!(f.history.find_incomplete("anid.cl").await.unwrap().is_empty());
        let history = f.store.load_history("anid.cl").await.unwrap().unwrap();
        let entry = history.find(IDEA).unwrap();
        assert_eq!(entry.versions.len(), 2);
        assert_eq!(entry.latest().unwrap().opening_date.as_deref(), Some("2026-04-01"));
        assert!(!f.locks.is_locked("anid.cl", OperationKind::Repair).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_with_nothing_incomplete_skips_extraction() {
        let f = fixture(MockBackend::new());

        let outcome = f
            .session
            .repair("anid.cl", &StaticPageSource::default(), &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert!(outcome.refetched.is_empty());
        assert!(outcome.session.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_waits_for_running_scrape() {
        let f = fixture(MockBackend::new());
        let _scrape = f
            .locks
            .acquire("anid.cl", OperationKind::Scrape, None)
            .await
            .unwrap();

        let err = f
            .session
            .repair("anid.cl", &StaticPageSource::default(), &HashMap::new(), &RunControl::new("anid.cl"))
            .await
            .unwrap_err();

        assert!(matches!(err, HarvestError::LockTimeout { kind: OperationKind::Repair, .. }));
    }
}
