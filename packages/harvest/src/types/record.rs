//! Extracted records and per-item issues.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a funding call.
///
/// Always derived from dates and keywords, never taken from model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Open,
    Closed,
    Suspended,
    Upcoming,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordStatus::Open => "open",
            RecordStatus::Closed => "closed",
            RecordStatus::Suspended => "suspended",
            RecordStatus::Upcoming => "upcoming",
        };
        f.write_str(label)
    }
}

/// One funding call as extracted from a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub name: String,

    /// Normalized `YYYY-MM-DD` when parseable
    pub opening_date: Option<String>,

    /// Normalized `YYYY-MM-DD` when parseable
    pub closing_date: Option<String>,

    pub organization: String,

    pub funding: Option<String>,

    /// Detail-page URL. Mandatory before reconciliation.
    pub url: Option<String>,

    pub status: Option<RecordStatus>,

    pub description: Option<String>,

    /// Division or program area inside the organization
    pub sub_area: Option<String>,

    /// Storage key of the source site (e.g. `anid.cl`)
    pub source_site: String,

    pub extracted_at: DateTime<Utc>,

    /// Opening date text exactly as shown on the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_date_text: Option<String>,

    /// Synthesized from the batch manifest because the model skipped it
    #[serde(default)]
    pub model_missed: bool,
}

impl ExtractedRecord {
    /// Minimal record for a manifest URL the model did not return.
    pub fn fallback(
        name: impl Into<String>,
        url: impl Into<String>,
        organization: impl Into<String>,
        source_site: impl Into<String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            name: if name.trim().is_empty() {
                UNTITLED_RECORD.to_string()
            } else {
                name
            },
            opening_date: None,
            closing_date: None,
            organization: organization.into(),
            funding: None,
            url: Some(url.into()),
            status: None,
            description: None,
            sub_area: None,
            source_site: source_site.into(),
            extracted_at,
            opening_date_text: None,
            model_missed: true,
        }
    }

    /// URL if present and non-blank.
    pub fn resolved_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Name given to fallback records whose manifest entry had no text.
pub const UNTITLED_RECORD: &str = "Untitled call";

/// Why a model-returned item did not become a usable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordIssue {
    /// No detail-page URL could be resolved
    MissingUrl { name: String },

    /// Item did not match the output schema
    SchemaViolation { index: usize, reason: String },
}

impl fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordIssue::MissingUrl { name } => write!(f, "no detail URL for '{}'", name),
            RecordIssue::SchemaViolation { index, reason } => {
                write!(f, "item {} violates schema: {}", index, reason)
            }
        }
    }
}

/// A parsed item: a record, or the reason it could not be one.
pub type ParsedItem = std::result::Result<ExtractedRecord, RecordIssue>;
