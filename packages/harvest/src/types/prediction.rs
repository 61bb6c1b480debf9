//! Prediction inputs and outcomes.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::history::PreviousVersion;

/// A closed call to predict the next opening for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionTarget {
    pub url: String,
    pub name: String,
}

impl PredictionTarget {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }
}

/// A target joined with its history-derived evidence, ready for the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionItem {
    pub url: String,
    pub name: String,
    pub organization: String,
    pub description: Option<String>,
    pub opening_date: Option<String>,
    pub closing_date: Option<String>,
    pub evidence: Vec<PreviousVersion>,
}

impl PredictionItem {
    /// Latest edition year among the evidence.
    pub fn latest_evidence_year(&self) -> Option<i32> {
        self.evidence.iter().filter_map(PreviousVersion::evidence_year).max()
    }
}

/// A validated prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub record_url: String,
    pub name: String,
    pub predicted_date: NaiveDate,
    pub rationale: String,
    pub predicted_at: DateTime<Utc>,
}

/// Why an item ended without a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpredictableReason {
    NotFoundInHistory,
    NoPreviousVersions,
    /// All earlier editions link back to the call itself
    SelfReference,
    NoResponse,
    /// The model judged the evidence unrelated or gave no date
    Rejected,
    DatePast,
    /// Predicted year is not after the latest known edition
    NotFutureCycle,
    /// More than one year beyond the current year
    TooFar,
    UnparseableDate,
    BatchFailed,
    Cancelled,
}

impl fmt::Display for UnpredictableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnpredictableReason::NotFoundInHistory => "not found in history",
            UnpredictableReason::NoPreviousVersions => "no previous versions",
            UnpredictableReason::SelfReference => "previous versions reference the call itself",
            UnpredictableReason::NoResponse => "no response for item",
            UnpredictableReason::Rejected => "model rejected the prediction",
            UnpredictableReason::DatePast => "predicted date is not in the future",
            UnpredictableReason::NotFutureCycle => "predicted year is not after the latest edition",
            UnpredictableReason::TooFar => "predicted date is too far ahead",
            UnpredictableReason::UnparseableDate => "predicted date is unparseable",
            UnpredictableReason::BatchFailed => "batch failed",
            UnpredictableReason::Cancelled => "run cancelled",
        };
        f.write_str(label)
    }
}

/// An item that ended without a valid prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unpredictable {
    pub record_url: String,
    pub name: String,
    pub reason: UnpredictableReason,
    #[serde(default)]
    pub detail: Option<String>,
    pub marked_at: DateTime<Utc>,
}

/// Output of one prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub site: String,
    pub generated_at: DateTime<Utc>,
    pub predictions: Vec<Prediction>,
    pub unpredictable: Vec<Unpredictable>,
}

impl PredictionSet {
    pub fn total(&self) -> usize {
        self.predictions.len() + self.unpredictable.len()
    }
}
