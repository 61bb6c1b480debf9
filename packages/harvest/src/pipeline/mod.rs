//! Extraction and prediction pipelines.
//!
//! - Batch assembly (size-bounded, greedy, in input order)
//! - Extraction runs with circuit breaker, time budgets and quality retry
//! - Deterministic post-processing of model output
//! - Scrape sessions (lock, extract, reconcile)
//! - Prediction of next openings for closed calls

pub mod batch;
pub mod extract;
pub mod parse;
pub mod predict;
pub mod prompts;
pub mod report;
pub mod session;

pub use batch::{assemble, Assembly, Batch, BATCH_SEPARATOR};
pub use extract::ExtractionPipeline;
pub use parse::{parse_records, resolve_url_by_name, ModelRecord, ModelRecords, ParseContext};
pub use predict::{
    closed_targets, validate_prediction, ModelPrediction, PredictionPipeline, PredictionResponse,
};
pub use prompts::{
    extraction_prompt_hash, format_extraction_prompt, format_prediction_prompt,
    EXTRACTION_PROMPT, PREDICTION_PROMPT,
};
pub use report::{
    AbortReason, BatchAudit, DensitySeverity, ExtractionResult, NoopSink, PipelineEvent,
    RunOutcome, RunReport, RunWarning, StatusSink,
};
pub use session::{RepairOutcome, ScrapeSession, SessionOutcome, DEFAULT_FETCH_CONCURRENCY};
