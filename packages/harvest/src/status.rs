//! Deterministic status derivation.

use chrono::NaiveDate;

use crate::dates::parse_date;
use crate::types::record::RecordStatus;

const SUSPENDED_KEYWORDS: &[&str] = &["suspendido", "suspendida", "suspend"];
const AWARDED_KEYWORDS: &[&str] = &["adjudicado", "adjudicada"];

/// URL marker sites use for suspended calls.
pub const SUSPENDED_URL_MARKER: &str = "concurso-suspendido";

/// Raw date texts plus the already-normalized dates of one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusInputs<'a> {
    pub opening_text: Option<&'a str>,
    pub closing_text: Option<&'a str>,
    pub opening: Option<&'a str>,
    pub closing: Option<&'a str>,
    pub url: Option<&'a str>,
}

/// Derive a record's status.
///
/// Order: suspension keyword or URL marker, award keyword, closing date
/// (past = closed, otherwise open), opening date (future = upcoming,
/// otherwise open). `None` when there is nothing to go on.
pub fn derive_status(inputs: &StatusInputs<'_>, today: NaiveDate) -> Option<RecordStatus> {
    let date_text = format!(
        "{} {}",
        inputs.opening_text.unwrap_or_default(),
        inputs.closing_text.unwrap_or_default()
    )
    .to_lowercase();

    if SUSPENDED_KEYWORDS.iter().any(|k| date_text.contains(k)) || is_suspended_url(inputs.url) {
        return Some(RecordStatus::Suspended);
    }
    if AWARDED_KEYWORDS.iter().any(|k| date_text.contains(k)) {
        return Some(RecordStatus::Closed);
    }

    if let Some(closing) = inputs.closing.or(inputs.closing_text).and_then(parse_date) {
        return Some(if closing < today {
            RecordStatus::Closed
        } else {
            RecordStatus::Open
        });
    }

    if let Some(opening) = inputs.opening.or(inputs.opening_text).and_then(parse_date) {
        return Some(if opening > today {
            RecordStatus::Upcoming
        } else {
            RecordStatus::Open
        });
    }

    None
}

/// Whether the URL carries the suspended-call marker.
pub fn is_suspended_url(url: Option<&str>) -> bool {
    url.is_some_and(|u| u.contains(SUSPENDED_URL_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn test_closing_date_decides() {
        let past = StatusInputs {
            closing: Some("2025-05-31"),
            ..Default::default()
        };
        assert_eq!(derive_status(&past, today()), Some(RecordStatus::Closed));

        let future = StatusInputs {
            opening: Some("2025-01-01"),
            closing: Some("2025-06-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&future, today()), Some(RecordStatus::Open));
    }

    #[test]
    fn test_opening_only() {
        let upcoming = StatusInputs {
            opening: Some("2025-07-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&upcoming, today()), Some(RecordStatus::Upcoming));

        let started = StatusInputs {
            opening: Some("2025-05-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&started, today()), Some(RecordStatus::Open));
    }

    #[test]
    fn test_keywords_override_dates() {
        let suspended = StatusInputs {
            closing_text: Some("Suspendido"),
            opening: Some("2025-07-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&suspended, today()), Some(RecordStatus::Suspended));

        let awarded = StatusInputs {
            closing_text: Some("Concurso adjudicado"),
            closing: Some("2026-01-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&awarded, today()), Some(RecordStatus::Closed));
    }

    #[test]
    fn test_suspended_url_marker() {
        let inputs = StatusInputs {
            url: Some("https://anid.cl/concursos/concurso-suspendido-fondef/"),
            closing: Some("2026-01-01"),
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, today()), Some(RecordStatus::Suspended));
    }

    #[test]
    fn test_raw_text_fallback_and_nothing() {
        let raw = StatusInputs {
            closing_text: Some("10 de diciembre, 2024"),
            ..Default::default()
        };
        assert_eq!(derive_status(&raw, today()), Some(RecordStatus::Closed));
        assert_eq!(derive_status(&StatusInputs::default(), today()), None);
    }
}
