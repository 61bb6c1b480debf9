//! Persistent per-site history types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{ExtractedRecord, RecordStatus};

/// Observable state of a call at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub opening_date: Option<String>,
    pub closing_date: Option<String>,
    pub status: Option<RecordStatus>,
    pub funding: Option<String>,
    pub description: Option<String>,
    pub sub_area: Option<String>,
    pub detected_at: DateTime<Utc>,

    /// Full page text captured with this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_snapshot: Option<String>,
}

impl VersionSnapshot {
    pub fn from_record(
        record: &ExtractedRecord,
        detected_at: DateTime<Utc>,
        page_snapshot: Option<String>,
    ) -> Self {
        Self {
            opening_date: record.opening_date.clone(),
            closing_date: record.closing_date.clone(),
            status: record.status,
            funding: record.funding.clone(),
            description: record.description.clone(),
            sub_area: record.sub_area.clone(),
            detected_at,
            page_snapshot,
        }
    }

    /// True when opening date, closing date or status differ.
    ///
    /// Funding, description and sub-area changes alone never create a version.
    pub fn differs_from(&self, record: &ExtractedRecord) -> bool {
        self.opening_date != record.opening_date
            || self.closing_date != record.closing_date
            || self.status != record.status
    }
}

/// An earlier edition of a call, as listed on its detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousVersion {
    pub name: String,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub opening_date: Option<String>,

    #[serde(default)]
    pub closing_date: Option<String>,

    /// Edition year, usually taken from the name
    #[serde(default)]
    pub year: Option<i32>,
}

impl PreviousVersion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            opening_date: None,
            closing_date: None,
            year: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_dates(mut self, opening: Option<&str>, closing: Option<&str>) -> Self {
        self.opening_date = opening.map(String::from);
        self.closing_date = closing.map(String::from);
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Year this edition belongs to: explicit year, else the leading
    /// `YYYY` of the opening or closing date.
    pub fn evidence_year(&self) -> Option<i32> {
        self.year.or_else(|| {
            [&self.opening_date, &self.closing_date]
                .into_iter()
                .flatten()
                .find_map(|d| leading_year(d))
        })
    }
}

fn leading_year(date: &str) -> Option<i32> {
    let head = date.trim().get(..4)?;
    if head.chars().all(|c| c.is_ascii_digit()) {
        head.parse().ok()
    } else {
        None
    }
}

/// One call, identified by its detail-page URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,

    /// Identity key
    pub url: String,

    pub organization: String,

    #[serde(default)]
    pub funding: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub sub_area: Option<String>,

    pub first_seen_at: DateTime<Utc>,

    pub last_seen_at: DateTime<Utc>,

    /// Append-only
    pub versions: Vec<VersionSnapshot>,

    /// Earlier editions listed on the detail page
    #[serde(default)]
    pub previous_versions: Vec<PreviousVersion>,

    #[serde(default)]
    pub previous_versions_updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_page_snapshot: Option<String>,
}

impl HistoryEntry {
    pub fn latest(&self) -> Option<&VersionSnapshot> {
        self.versions.last()
    }

    pub fn latest_status(&self) -> Option<RecordStatus> {
        self.latest().and_then(|v| v.status)
    }
}

/// All history for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteHistory {
    pub site: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    /// Ordered by first sighting
    pub entries: Vec<HistoryEntry>,
}

impl SiteHistory {
    pub fn new(site: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            site: site.into(),
            created_at: now,
            last_updated: now,
            entries: Vec::new(),
        }
    }

    pub fn find(&self, url: &str) -> Option<&HistoryEntry> {
        let url = url.trim();
        self.entries.iter().find(|e| e.url == url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evidence_year_prefers_explicit_year() {
        let prev = PreviousVersion::new("FONDECYT 2023")
            .with_dates(Some("2022-03-01"), None)
            .with_year(2023);
        assert_eq!(prev.evidence_year(), Some(2023));
    }

    #[test]
    fn test_evidence_year_from_dates() {
        let prev = PreviousVersion::new("Call").with_dates(None, Some("2024-05-30"));
        assert_eq!(prev.evidence_year(), Some(2024));

        let unparseable = PreviousVersion::new("Call").with_dates(Some("mayo"), None);
        assert_eq!(unparseable.evidence_year(), None);
    }

    #[test]
    fn test_snapshot_ignores_descriptive_fields() {
        let now = Utc::now();
        let mut record = crate::testing::record("A", "https://anid.cl/concursos/a/");
        record.closing_date = Some("2025-01-10".into());
        let snapshot = VersionSnapshot::from_record(&record, now, None);

        record.description = Some("changed".into());
        record.funding = Some("$1".into());
        assert!(!snapshot.differs_from(&record));

        record.closing_date = Some("2025-01-11".into());
        assert!(snapshot.differs_from(&record));
    }
}
