//! The extraction pipeline.
//!
//! Batches run one after another. Before each batch the loop checks, in
//! order: cancellation, the total time budget, the circuit breaker. A batch
//! that fails counts towards the breaker; a batch that succeeds resets it.
//! Whatever was extracted before a stop is returned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::batch::{assemble, Assembly, Batch};
use super::parse::{parse_records, ModelRecords, ParseContext};
use super::prompts::{extraction_prompt_hash, format_extraction_prompt};
use super::report::{
    AbortReason, BatchAudit, DensitySeverity, ExtractionResult, NoopSink, PipelineEvent,
    RunReport, RunWarning, StatusSink,
};
use crate::cancel::RunControl;
use crate::clock::Clock;
use crate::error::{HarvestError, Result};
use crate::generation::{initial_token_budget, response_schema, GenerationClient, GenerationOutput};
use crate::sources::{normalize_site, organization_for_url};
use crate::types::config::ExtractionConfig;
use crate::types::page::PageContent;
use crate::types::record::{ExtractedRecord, ParsedItem, RecordIssue};

/// Extracts funding calls from page text.
pub struct ExtractionPipeline {
    client: GenerationClient,
    config: ExtractionConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StatusSink>,
}

/// One accepted generation call and its parsed items.
struct Attempt {
    output: GenerationOutput,
    items: Vec<ParsedItem>,
}

impl Attempt {
    fn model_records(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }
}

impl ExtractionPipeline {
    pub fn new(client: GenerationClient, config: ExtractionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            config,
            clock,
            sink: Arc::new(NoopSink),
        }
    }

    /// Deliver progress events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Batch `pages` and extract records from every batch.
    pub async fn run(
        &self,
        site: &str,
        pages: &[PageContent],
        control: &RunControl,
    ) -> Result<ExtractionResult> {
        let assembly = assemble(pages, self.config.batch_size);
        self.run_assembly(site, assembly, control).await
    }

    /// Extract from batches that are already assembled.
    pub async fn run_assembly(
        &self,
        site: &str,
        assembly: Assembly,
        control: &RunControl,
    ) -> Result<ExtractionResult> {
        let site = normalize_site(site);
        let started = Instant::now();
        let mut report = RunReport::new(&site, self.clock.now(), extraction_prompt_hash());
        report.pages = assembly.page_count() + assembly.skipped.len();
        report.batches_total = assembly.batches.len();
        report.warnings.extend(
            assembly
                .skipped
                .iter()
                .map(|url| RunWarning::SkippedEmptyPage { url: url.clone() }),
        );

        info!(
            site = %site,
            pages = report.pages,
            batches = report.batches_total,
            "Starting extraction"
        );

        let total = assembly.batches.len();
        let mut records: Vec<ExtractedRecord> = Vec::new();
        // URLs emitted so far, model records and fallbacks alike
        let mut seen: HashSet<String> = HashSet::new();
        let mut consecutive_failures = 0u32;
        let mut abort: Option<AbortReason> = None;

        for batch in &assembly.batches {
            if control.should_stop().await {
                info!(site = %site, batch = batch.index, "Run cancelled before batch");
                abort = Some(AbortReason::Cancelled);
                break;
            }

            if let Some(limit) = self.config.max_total_time {
                if started.elapsed() >= limit {
                    warn!(
                        site = %site,
                        elapsed_secs = started.elapsed().as_secs(),
                        limit_secs = limit.as_secs(),
                        "Total time budget exceeded"
                    );
                    abort = Some(AbortReason::TotalTimeBudget);
                    break;
                }
            }

            if consecutive_failures >= self.config.max_consecutive_failures {
                warn!(
                    site = %site,
                    consecutive = consecutive_failures,
                    "Circuit breaker tripped"
                );
                abort = Some(AbortReason::CircuitBreakerTripped {
                    consecutive: consecutive_failures,
                });
                break;
            }

            self.sink.on_event(&PipelineEvent::BatchStarted {
                index: batch.index,
                total,
                pages: batch.page_count(),
                chars: batch.text_len(),
            });

            let batch_started = Instant::now();
            let mut audit = BatchAudit {
                index: batch.index,
                page_urls: batch.page_urls(),
                ..Default::default()
            };
            let is_last = batch.index + 1 == total;

            let outcome = self
                .process_batch(&site, batch, is_last, &seen, &mut audit, &mut report.warnings)
                .await;
            audit.elapsed_ms = batch_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(batch_records) => {
                    consecutive_failures = 0;
                    report.batches_succeeded += 1;
                    report.fallback_records += audit.fallback_records;

                    let recovered: HashSet<String> = batch_records
                        .iter()
                        .filter(|r| !r.model_missed)
                        .filter_map(url_key)
                        .filter(|key| seen.contains(key))
                        .collect();
                    if !recovered.is_empty() {
                        let before = records.len();
                        records.retain(|r| {
                            !(r.model_missed && url_key(r).is_some_and(|key| recovered.contains(&key)))
                        });
                        let dropped = before - records.len();
                        report.fallback_records = report.fallback_records.saturating_sub(dropped);
                        debug!(
                            site = %site,
                            batch = batch.index,
                            dropped,
                            "Later batch extracted earlier fallbacks"
                        );
                    }
                    seen.extend(batch_records.iter().filter_map(url_key));

                    info!(
                        site = %site,
                        batch = batch.index,
                        records = batch_records.len(),
                        fallbacks = audit.fallback_records,
                        elapsed_ms = audit.elapsed_ms,
                        "Batch completed"
                    );
                    self.sink.on_event(&PipelineEvent::BatchCompleted {
                        index: batch.index,
                        records: batch_records.len(),
                    });
                    records.extend(batch_records);
                    report.batches.push(audit);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    report.batches_failed += 1;
                    audit.error = Some(e.to_string());
                    report.batches.push(audit);
                    warn!(
                        site = %site,
                        batch = batch.index,
                        consecutive = consecutive_failures,
                        error = %e,
                        "Batch failed"
                    );
                    self.sink.on_event(&PipelineEvent::BatchFailed {
                        index: batch.index,
                        error: e.to_string(),
                        consecutive: consecutive_failures,
                    });

                    if is_run_terminal(&e) {
                        abort = Some(AbortReason::AllCredentialsExhausted);
                        break;
                    }
                    if !self.config.continue_on_error {
                        abort = Some(AbortReason::BatchFailed { batch: batch.index });
                        break;
                    }
                }
            }

            if batch_started.elapsed() > self.config.max_time_per_batch {
                warn!(
                    site = %site,
                    batch = batch.index,
                    elapsed_secs = batch_started.elapsed().as_secs(),
                    limit_secs = self.config.max_time_per_batch.as_secs(),
                    "Batch exceeded its time budget, stopping"
                );
                abort = Some(AbortReason::BatchTimeBudget { batch: batch.index });
                break;
            }
        }

        if let Some(reason) = &abort {
            self.sink.on_event(&PipelineEvent::Aborted {
                reason: reason.clone(),
            });
        }

        let (calls, failures) = self.client.pool().totals().await;
        report.credential_calls = calls;
        report.credential_failures = failures;
        report.records = records.len();
        report.finish(self.clock.now(), started.elapsed(), abort);

        info!(
            site = %site,
            run_id = %report.run_id,
            records = report.records,
            fallbacks = report.fallback_records,
            succeeded = report.batches_succeeded,
            failed = report.batches_failed,
            warnings = report.warnings.len(),
            outcome = ?report.outcome,
            "Extraction finished"
        );

        Ok(ExtractionResult { records, report })
    }

    async fn process_batch(
        &self,
        site: &str,
        batch: &Batch,
        is_last: bool,
        seen: &HashSet<String>,
        audit: &mut BatchAudit,
        warnings: &mut Vec<RunWarning>,
    ) -> Result<Vec<ExtractedRecord>> {
        let prompt = format_extraction_prompt(batch, self.config.expected_per_page);
        let schema = response_schema::<ModelRecords>();
        let generation = self.client.config();
        let budget = initial_token_budget(
            prompt.len(),
            generation.max_output_tokens,
            generation.max_token_budget,
        );
        audit.prompt_chars = prompt.len();

        let extracted_at = self.clock.now();
        let ctx = ParseContext::for_batch(batch, site, extracted_at).with_today(self.clock.today());

        let mut attempt = self.attempt(&prompt, &schema, budget, &ctx).await?;
        audit.calls += attempt.output.calls;

        let listing_pages = batch.listing_urls().len();
        let mut retried = false;

        if self.config.quality_retry && !is_last {
            if let Some(severity) = self.density_severity(attempt.model_records(), listing_pages, is_last) {
                info!(
                    batch = batch.index,
                    records = attempt.model_records(),
                    listing_pages,
                    ?severity,
                    "Low record density, re-issuing batch"
                );
                self.sink.on_event(&PipelineEvent::QualityRetry {
                    index: batch.index,
                    records: attempt.model_records(),
                    severity,
                });
                retried = true;
                audit.quality_retry = true;

                match self.attempt(&prompt, &schema, budget, &ctx).await {
                    Ok(second) => {
                        audit.calls += second.output.calls;
                        debug!(
                            batch = batch.index,
                            first = attempt.model_records(),
                            second = second.model_records(),
                            "Quality retry finished"
                        );
                        if second.model_records() > attempt.model_records() {
                            attempt = second;
                        }
                    }
                    Err(e) => {
                        warn!(batch = batch.index, error = %e, "Quality retry failed, keeping first result");
                    }
                }
            }
        }

        let model_records = attempt.model_records();
        if let Some(severity) = self.density_severity(model_records, listing_pages, is_last) {
            warnings.push(RunWarning::LowRecordDensity {
                batch: batch.index,
                records: model_records,
                pages: listing_pages,
                severity: Some(severity),
                retried,
            });
        }

        audit.response_text = Some(attempt.output.raw_text.clone());
        audit.budget = attempt.output.budget;
        audit.escalations = attempt.output.escalations;
        audit.model_records = model_records;

        let mut records = Vec::with_capacity(model_records);
        for item in attempt.items {
            match item {
                Ok(record) => {
                    if record.resolved_url().is_none() {
                        debug!(batch = batch.index, name = %record.name, "Record has no detail URL");
                        warnings.push(RunWarning::MissingRecordUrl {
                            batch: batch.index,
                            name: record.name.clone(),
                        });
                    }
                    records.push(record);
                }
                Err(RecordIssue::SchemaViolation { index, reason }) => {
                    audit.issues += 1;
                    warnings.push(RunWarning::SchemaViolation {
                        batch: batch.index,
                        index,
                        reason,
                    });
                }
                Err(RecordIssue::MissingUrl { name }) => {
                    audit.issues += 1;
                    warnings.push(RunWarning::MissingRecordUrl {
                        batch: batch.index,
                        name,
                    });
                }
            }
        }

        let fallbacks = missed_records(batch, &records, seen, site, extracted_at);
        audit.fallback_records = fallbacks.len();
        for fallback in &fallbacks {
            warnings.push(RunWarning::ModelMissedRecord {
                batch: batch.index,
                name: fallback.name.clone(),
                url: fallback.url.clone().unwrap_or_default(),
            });
        }
        if !fallbacks.is_empty() {
            info!(
                batch = batch.index,
                missed = fallbacks.len(),
                "Model skipped manifest items, added fallback records"
            );
        }
        records.extend(fallbacks);

        Ok(records)
    }

    async fn attempt(
        &self,
        prompt: &str,
        schema: &Value,
        budget: u32,
        ctx: &ParseContext<'_>,
    ) -> Result<Attempt> {
        let output = self.client.invoke(prompt, schema, budget).await?;
        let items = parse_records(&output.value, ctx)?;
        Ok(Attempt { output, items })
    }

    /// Severity of a low record count, measured against listing pages only.
    /// Medium only applies to batches that are not the last one.
    fn density_severity(
        &self,
        records: usize,
        listing_pages: usize,
        is_last: bool,
    ) -> Option<DensitySeverity> {
        if listing_pages == 0 {
            return None;
        }
        let expected = self.config.expected_per_page as f64;
        let per_page = records as f64 / listing_pages as f64;

        if per_page < expected - 2.0 {
            Some(DensitySeverity::High)
        } else if !is_last && per_page < expected - 1.0 {
            Some(DensitySeverity::Medium)
        } else {
            None
        }
    }
}

/// Fallback records for manifest URLs that neither this batch nor an
/// earlier one produced a record for.
fn missed_records(
    batch: &Batch,
    records: &[ExtractedRecord],
    seen: &HashSet<String>,
    site: &str,
    extracted_at: DateTime<Utc>,
) -> Vec<ExtractedRecord> {
    let returned: HashSet<&str> = records
        .iter()
        .filter_map(ExtractedRecord::resolved_url)
        .map(|url| url.trim_end_matches('/'))
        .collect();

    batch
        .manifest
        .iter()
        .filter(|(url, _)| {
            let key = url.trim_end_matches('/');
            !returned.contains(key) && !seen.contains(key)
        })
        .map(|(url, name)| {
            ExtractedRecord::fallback(
                name.as_str(),
                url.as_str(),
                organization_for_url(url),
                site,
                extracted_at,
            )
        })
        .collect()
}

fn url_key(record: &ExtractedRecord) -> Option<String> {
    record
        .resolved_url()
        .map(|url| url.trim_end_matches('/').to_string())
}

fn is_run_terminal(error: &HarvestError) -> bool {
    matches!(error, HarvestError::Generation(e) if e.is_run_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::credentials::CredentialPool;
    use crate::error::BackendError;
    use crate::pipeline::report::RunOutcome;
    use crate::testing::{listing_page, page_of_size, ManualClock, MockBackend};
    use crate::types::config::GenerationConfig;

    const LISTING: &str = "https://anid.cl/concursos/?page=1";

    fn pipeline(backend: MockBackend, tokens: &[&str], config: ExtractionConfig) -> (ExtractionPipeline, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let clock = Arc::new(ManualClock::default());
        let pool = Arc::new(CredentialPool::in_memory_with_clock(
            tokens.iter().copied(),
            clock.clone(),
        ));
        let client = GenerationClient::new(backend.clone(), pool, GenerationConfig::default());
        (ExtractionPipeline::new(client, config, clock), backend)
    }

    fn six_item_listing(url: &str, prefix: &str) -> PageContent {
        let links: Vec<(String, String)> = (1..=6)
            .map(|i| {
                (
                    format!("https://anid.cl/concursos/{}-{}/", prefix, i),
                    format!("Concurso {} {}", prefix, i),
                )
            })
            .collect();
        let refs: Vec<(&str, &str)> = links.iter().map(|(u, n)| (u.as_str(), n.as_str())).collect();
        listing_page(url, &format!("listing of {}", prefix), &refs)
    }

    fn records_json(prefix: &str, count: usize) -> String {
        let records: Vec<Value> = (1..=count)
            .map(|i| {
                serde_json::json!({
                    "name": format!("Concurso {} {}", prefix, i),
                    "closing_date": "19 de junio, 2025 - 17:00",
                    "url": format!("https://anid.cl/concursos/{}-{}/", prefix, i),
                })
            })
            .collect();
        serde_json::json!({ "records": records }).to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_batch_completes() {
        let backend = MockBackend::new().with_response(records_json("a", 6));
        let (pipeline, _) = pipeline(backend, &["A"], ExtractionConfig::default());

        let result = pipeline
            .run("https://anid.cl", &[six_item_listing(LISTING, "a")], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.records.len(), 6);
        assert_eq!(result.report.outcome, RunOutcome::Completed);
        assert_eq!(result.report.batches_succeeded, 1);
        assert_eq!(result.report.site, "anid.cl");
        assert!(result.records.iter().all(|r| !r.model_missed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_manifest_items_become_fallbacks() {
        let backend = MockBackend::new().with_response(records_json("a", 4));
        let (pipeline, _) = pipeline(backend, &["A"], ExtractionConfig::default());

        let result = pipeline
            .run("anid.cl", &[six_item_listing(LISTING, "a")], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.records.len(), 6);
        let missed: Vec<_> = result.records.iter().filter(|r| r.model_missed).collect();
        assert_eq!(missed.len(), 2);
        assert_eq!(missed[0].name, "Concurso a 5");
        assert_eq!(missed[0].opening_date, None);
        assert_eq!(result.report.fallback_records, 2);
        assert_eq!(
            result
                .report
                .warnings_of(|w| matches!(w, RunWarning::ModelMissedRecord { .. }))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_url_is_a_distinct_warning() {
        let response = serde_json::json!({ "records": [
            { "name": "Programa sin enlace", "url": "https://anid.cl/concursos/" },
        ]})
        .to_string();
        let backend = MockBackend::new().with_response(response);
        let (pipeline, _) = pipeline(backend, &["A"], ExtractionConfig::default());
        let page = PageContent::new("https://anid.cl/concursos/programa/", "Programa sin enlace");

        let result = pipeline
            .run("anid.cl", &[page], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        let kinds: Vec<_> = result.report.warnings.iter().collect();
        assert!(kinds.iter().any(|w| matches!(w, RunWarning::MissingRecordUrl { .. })));
        assert!(kinds.iter().any(|w| matches!(w, RunWarning::ModelMissedRecord { .. })));
        assert_eq!(
            result.report.outcome,
            RunOutcome::CompletedWithWarnings
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_retry_keeps_larger_result() {
        let backend = MockBackend::new()
            .with_response(records_json("a", 2))
            .with_response(records_json("a", 6))
            .with_response(records_json("b", 6));
        let (pipeline, backend) = pipeline(
            backend,
            &["A"],
            ExtractionConfig::default().with_batch_size(20),
        );
        let pages = vec![six_item_listing(LISTING, "a"), six_item_listing("https://anid.cl/concursos/?page=2", "b")];

        let result = pipeline
            .run("anid.cl", &pages, &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 3);
        assert!(result.report.batches[0].quality_retry);
        assert_eq!(result.report.batches[0].model_records, 6);
        assert_eq!(result.report.fallback_records, 0);
        assert_eq!(result.records.len(), 12);
    }

    fn shared_link_pages() -> Vec<PageContent> {
        let shared = ("https://anid.cl/concursos/fondecyt-regular/", "FONDECYT Regular");
        vec![
            listing_page(LISTING, "listing of page one", &[shared]),
            listing_page("https://anid.cl/concursos/?page=2", "listing of page two", &[shared]),
        ]
    }

    fn fondecyt_json() -> String {
        serde_json::json!({ "records": [{
            "name": "FONDECYT Regular",
            "closing_date": "2030-07-01",
            "url": "https://anid.cl/concursos/fondecyt-regular",
        }]})
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_for_url_extracted_by_earlier_batch() {
        let backend = MockBackend::new()
            .with_response(fondecyt_json())
            .with_response(r#"{"records": []}"#);
        let (pipeline, backend) = pipeline(
            backend,
            &["A"],
            ExtractionConfig::default()
                .with_batch_size(20)
                .with_quality_retry(false),
        );

        let result = pipeline
            .run("anid.cl", &shared_link_pages(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 2);
        assert_eq!(result.records.len(), 1);
        assert!(!result.records[0].model_missed);
        assert!(result.records[0].closing_date.is_some());
        assert_eq!(result.report.fallback_records, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_batch_replaces_earlier_fallback() {
        let backend = MockBackend::new()
            .with_response(r#"{"records": []}"#)
            .with_response(fondecyt_json());
        let (pipeline, _) = pipeline(
            backend,
            &["A"],
            ExtractionConfig::default()
                .with_batch_size(20)
                .with_quality_retry(false),
        );

        let result = pipeline
            .run("anid.cl", &shared_link_pages(), &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.records.len(), 1);
        assert!(!result.records[0].model_missed);
        assert!(result.records[0].closing_date.is_some());
        assert_eq!(result.report.fallback_records, 0);
        assert_eq!(result.report.records, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_batch_is_not_retried() {
        let backend = MockBackend::new().with_response(records_json("a", 1));
        let (pipeline, backend) = pipeline(backend, &["A"], ExtractionConfig::default());

        let result = pipeline
            .run("anid.cl", &[six_item_listing(LISTING, "a")], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 1);
        assert!(result.report.warnings.iter().any(|w| matches!(
            w,
            RunWarning::LowRecordDensity { severity: Some(DensitySeverity::High), retried: false, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_returns_partial_results() {
        let backend = MockBackend::new()
            .with_response(records_json("p0", 1))
            .with_handler(|_| Err(BackendError::http(500, "internal error")));
        let config = ExtractionConfig::default()
            .with_batch_size(10)
            .with_max_consecutive_failures(2)
            .with_quality_retry(false);
        let (pipeline, _) = pipeline(backend, &["A"], config);
        let pages: Vec<PageContent> = (0..5)
            .map(|i| page_of_size(&format!("https://anid.cl/concursos/p{}-1/", i), 10))
            .collect();

        let result = pipeline
            .run("anid.cl", &pages, &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.report.batches_succeeded, 1);
        assert_eq!(result.report.batches_failed, 2);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::CircuitBreakerTripped {
                consecutive: 2
            })
        );
        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_first_error() {
        let backend = MockBackend::new().with_handler(|_| Err(BackendError::http(500, "boom")));
        let config = ExtractionConfig::default()
            .with_batch_size(10)
            .with_continue_on_error(false);
        let (pipeline, _) = pipeline(backend, &["A"], config);
        let pages: Vec<PageContent> = (0..3)
            .map(|i| page_of_size(&format!("https://anid.cl/concursos/p{}/", i), 10))
            .collect();

        let result = pipeline
            .run("anid.cl", &pages, &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.report.batches_failed, 1);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::BatchFailed { batch: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_credentials_abort_immediately() {
        let backend = MockBackend::new()
            .with_handler(|_| Err(BackendError::http(429, "You exceeded your current quota")));
        let config = ExtractionConfig::default().with_batch_size(10);
        let (pipeline, backend) = pipeline(backend, &["A"], config);
        let pages: Vec<PageContent> = (0..3)
            .map(|i| page_of_size(&format!("https://anid.cl/concursos/p{}/", i), 10))
            .collect();

        let result = pipeline
            .run("anid.cl", &pages, &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 1);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::AllCredentialsExhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_batch() {
        let backend = MockBackend::new();
        let (pipeline, backend) = pipeline(backend, &["A"], ExtractionConfig::default());
        let control = RunControl::new("anid.cl");
        control.cancel();

        let result = pipeline
            .run("anid.cl", &[page_of_size("https://anid.cl/concursos/a/", 10)], &control)
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 0);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_budget_checked_between_batches() {
        let backend = MockBackend::new();
        let config = ExtractionConfig::default().with_max_total_time(Duration::ZERO);
        let (pipeline, backend) = pipeline(backend, &["A"], config);

        let result = pipeline
            .run("anid.cl", &[page_of_size("https://anid.cl/concursos/a/", 10)], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 0);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::TotalTimeBudget)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_batch_stops_run() {
        // first call fails and the client waits before retrying
        let backend = MockBackend::new()
            .with_error(BackendError::http(500, "internal error"))
            .with_response(r#"{"records": []}"#);
        let config = ExtractionConfig::default()
            .with_batch_size(10)
            .with_max_time_per_batch(Duration::from_secs(1));
        let (pipeline, backend) = pipeline(backend, &["A", "B"], config);
        let pages = vec![
            page_of_size("https://anid.cl/concursos/a/", 10),
            page_of_size("https://anid.cl/concursos/b/", 10),
        ];

        let result = pipeline
            .run("anid.cl", &pages, &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(), 2);
        assert_eq!(result.report.batches_succeeded, 1);
        assert_eq!(
            result.report.outcome,
            RunOutcome::Aborted(AbortReason::BatchTimeBudget { batch: 0 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_violations_reported() {
        let response = serde_json::json!({ "records": [
            { "name": "Concurso a 1", "url": "https://anid.cl/concursos/a-1/" },
            { "name": 42 },
        ]})
        .to_string();
        let backend = MockBackend::new().with_response(response);
        let (pipeline, _) = pipeline(backend, &["A"], ExtractionConfig::default());
        let page = PageContent::new("https://anid.cl/concursos/a-1/", "Concurso a 1");

        let result = pipeline
            .run("anid.cl", &[page], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert_eq!(result.records.len(), 1);
        assert!(result
            .report
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::SchemaViolation { index: 1, .. })));
        assert_eq!(result.report.batches[0].issues, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_delivered_to_sink() {
        let backend = MockBackend::new().with_response(records_json("a", 6));
        let (pipeline, _) = pipeline(backend, &["A"], ExtractionConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let pipeline = pipeline.with_sink(Arc::new(move |event: &PipelineEvent| {
            seen.lock().unwrap().push(event.clone());
        }));

        pipeline
            .run("anid.cl", &[six_item_listing(LISTING, "a")], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events[0], PipelineEvent::BatchStarted { index: 0, total: 1, .. }));
        assert!(matches!(events[1], PipelineEvent::BatchCompleted { index: 0, records: 6 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_processes_nothing() {
        let (pipeline, _) = pipeline(MockBackend::new(), &["A"], ExtractionConfig::default());

        let result = pipeline
            .run("anid.cl", &[PageContent::new("https://anid.cl/concursos/x/", "")], &RunControl::new("anid.cl"))
            .await
            .unwrap();

        assert!(result.records.is_empty());
        assert_eq!(
            result.report.outcome,
            RunOutcome::NothingProcessed
        );
        assert!(matches!(
            result.report.warnings[0],
            RunWarning::SkippedEmptyPage { .. }
        ));
    }
}
