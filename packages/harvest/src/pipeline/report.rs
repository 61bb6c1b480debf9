//! Run reports, warnings and status events.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::record::ExtractedRecord;

/// How far below the expected record density a batch came out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensitySeverity {
    /// Below `expected - 1` per page on a batch that is not the last
    Medium,
    /// Below `expected - 2` per page
    High,
}

/// A per-item or per-page problem that did not stop the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// Page had no text and was left out of every batch
    SkippedEmptyPage { url: String },

    /// The page source could not deliver the page
    FetchFailed { url: String, reason: String },

    /// A manifest URL the model did not return; a fallback record was made
    ModelMissedRecord {
        batch: usize,
        name: String,
        url: String,
    },

    /// A returned record without a resolvable detail-page URL
    MissingRecordUrl { batch: usize, name: String },

    /// A returned item that does not match the output schema
    SchemaViolation {
        batch: usize,
        index: usize,
        reason: String,
    },

    /// Fewer records than expected, even after a quality retry
    LowRecordDensity {
        batch: usize,
        records: usize,
        pages: usize,
        severity: Option<DensitySeverity>,
        retried: bool,
    },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::SkippedEmptyPage { url } => write!(f, "skipped empty page {}", url),
            RunWarning::FetchFailed { url, reason } => write!(f, "fetch failed for {}: {}", url, reason),
            RunWarning::ModelMissedRecord { batch, name, url } => {
                write!(f, "batch {}: model missed '{}' ({})", batch, name, url)
            }
            RunWarning::MissingRecordUrl { batch, name } => {
                write!(f, "batch {}: no detail URL for '{}'", batch, name)
            }
            RunWarning::SchemaViolation { batch, index, reason } => {
                write!(f, "batch {}: item {} violates schema: {}", batch, index, reason)
            }
            RunWarning::LowRecordDensity {
                batch,
                records,
                pages,
                ..
            } => write!(f, "batch {}: only {} records from {} pages", batch, records, pages),
        }
    }
}

/// Why a run stopped before its last batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    CircuitBreakerTripped { consecutive: u32 },
    TotalTimeBudget,
    BatchTimeBudget { batch: usize },
    AllCredentialsExhausted,
    /// A batch failed with `continue_on_error` off
    BatchFailed { batch: usize },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::CircuitBreakerTripped { consecutive } => {
                write!(f, "{} consecutive batch failures", consecutive)
            }
            AbortReason::TotalTimeBudget => write!(f, "total time budget exceeded"),
            AbortReason::BatchTimeBudget { batch } => {
                write!(f, "batch {} exceeded its time budget", batch)
            }
            AbortReason::AllCredentialsExhausted => write!(f, "all credentials exhausted"),
            AbortReason::BatchFailed { batch } => write!(f, "batch {} failed", batch),
        }
    }
}

/// Overall result of a run, as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NothingProcessed,
    Completed,
    CompletedWithWarnings,
    Aborted(AbortReason),
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted(_))
    }
}

/// Audit trail of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAudit {
    pub index: usize,
    pub page_urls: Vec<String>,
    pub prompt_chars: usize,

    /// Raw response text of the accepted call
    pub response_text: Option<String>,

    /// Records the model returned, after parsing
    pub model_records: usize,
    pub fallback_records: usize,
    pub issues: usize,

    pub calls: u32,
    pub escalations: u32,

    /// Token budget of the accepted call
    pub budget: u32,

    pub quality_retry: bool,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Everything a caller needs to judge a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub site: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,

    /// Hash of the extraction prompt template
    pub prompt_hash: String,

    pub pages: usize,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub records: usize,
    pub fallback_records: usize,

    /// Calls and failures across the credential pool at the end of the run
    pub credential_calls: u64,
    pub credential_failures: u64,

    pub warnings: Vec<RunWarning>,
    pub batches: Vec<BatchAudit>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub(crate) fn new(site: impl Into<String>, started_at: DateTime<Utc>, prompt_hash: String) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            site: site.into(),
            started_at,
            finished_at: started_at,
            elapsed_ms: 0,
            prompt_hash,
            pages: 0,
            batches_total: 0,
            batches_succeeded: 0,
            batches_failed: 0,
            records: 0,
            fallback_records: 0,
            credential_calls: 0,
            credential_failures: 0,
            warnings: Vec::new(),
            batches: Vec::new(),
            outcome: RunOutcome::NothingProcessed,
        }
    }

    /// Set timing and derive the outcome.
    pub(crate) fn finish(
        &mut self,
        finished_at: DateTime<Utc>,
        elapsed: Duration,
        abort: Option<AbortReason>,
    ) {
        self.finished_at = finished_at;
        self.elapsed_ms = elapsed.as_millis() as u64;
        self.outcome = match abort {
            Some(reason) => RunOutcome::Aborted(reason),
            None if self.batches_succeeded == 0 => RunOutcome::NothingProcessed,
            None if self.batches_failed > 0 || !self.warnings.is_empty() => {
                RunOutcome::CompletedWithWarnings
            }
            None => RunOutcome::Completed,
        };
    }

    pub fn warnings_of<'a>(
        &'a self,
        predicate: impl Fn(&RunWarning) -> bool + 'a,
    ) -> impl Iterator<Item = &'a RunWarning> + 'a {
        self.warnings.iter().filter(move |w| predicate(w))
    }
}

/// Records plus the report of the run that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub records: Vec<ExtractedRecord>,
    pub report: RunReport,
}

// ============================================================================
// Status events
// ============================================================================

/// Progress notifications delivered while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    BatchStarted {
        index: usize,
        total: usize,
        pages: usize,
        chars: usize,
    },
    BatchCompleted {
        index: usize,
        records: usize,
    },
    BatchFailed {
        index: usize,
        error: String,
        consecutive: u32,
    },
    QualityRetry {
        index: usize,
        records: usize,
        severity: DensitySeverity,
    },
    Aborted {
        reason: AbortReason,
    },
}

/// Receives [`PipelineEvent`]s. Implemented for closures.
pub trait StatusSink: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> StatusSink for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl StatusSink for NoopSink {
    fn on_event(&self, _event: &PipelineEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport::new("anid.cl", Utc::now(), "hash".into())
    }

    #[test]
    fn test_outcome_distinguishes_cases() {
        let mut nothing = report();
        nothing.finish(Utc::now(), Duration::ZERO, None);
        assert_eq!(nothing.outcome, RunOutcome::NothingProcessed);

        let mut clean = report();
        clean.batches_succeeded = 1;
        clean.finish(Utc::now(), Duration::ZERO, None);
        assert_eq!(clean.outcome, RunOutcome::Completed);

        let mut warned = report();
        warned.batches_succeeded = 1;
        warned.warnings.push(RunWarning::MissingRecordUrl {
            batch: 0,
            name: "X".into(),
        });
        warned.finish(Utc::now(), Duration::ZERO, None);
        assert_eq!(warned.outcome, RunOutcome::CompletedWithWarnings);

        let mut aborted = report();
        aborted.finish(Utc::now(), Duration::ZERO, Some(AbortReason::Cancelled));
        assert!(aborted.outcome.is_aborted());
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let warning = RunWarning::ModelMissedRecord {
            batch: 2,
            name: "FONDEF".into(),
            url: "https://anid.cl/concursos/fondef/".into(),
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "model_missed_record");
        assert_eq!(json["batch"], 2);
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |event: &PipelineEvent| seen.lock().unwrap().push(event.clone());
        sink.on_event(&PipelineEvent::BatchCompleted { index: 0, records: 3 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
