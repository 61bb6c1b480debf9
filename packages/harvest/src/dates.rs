//! Date parsing for the formats funding sites publish.
//!
//! Accepts ISO dates, Spanish long forms (`10 de diciembre, 2025`,
//! `15 de marzo de 2024`) and numeric `DD/MM/YYYY` or `YYYY/MM/DD`, with
//! trailing text such as times ignored.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static RE_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").unwrap());
static RE_STRICT_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static RE_LONG_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})\s+de\s+(\w+)\s*,\s*(\d{4})").unwrap());
static RE_LONG_DE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})\s+de\s+(\w+)\s+de(?:l)?\s+(\d{4})").unwrap());
static RE_DAY_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})[/\-.](\d{1,2})[/\-.](\d{4})").unwrap());
static RE_YEAR_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[/\-.](\d{1,2})[/\-.](\d{1,2})").unwrap());

/// Spanish month name to month number.
pub fn month_from_name(name: &str) -> Option<u32> {
    let month = match name.to_lowercase().as_str() {
        "enero" => 1,
        "febrero" => 2,
        "marzo" => 3,
        "abril" => 4,
        "mayo" => 5,
        "junio" => 6,
        "julio" => 7,
        "agosto" => 8,
        "septiembre" | "setiembre" => 9,
        "octubre" => 10,
        "noviembre" => 11,
        "diciembre" => 12,
        _ => return None,
    };
    Some(month)
}

/// Parse a published date.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = RE_ISO.captures(text) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }

    for re in [&*RE_LONG_COMMA, &*RE_LONG_DE] {
        if let Some(caps) = re.captures(text) {
            if let Some(month) = month_from_name(&caps[2]) {
                let year = caps[3].parse().ok()?;
                let day = caps[1].parse().ok()?;
                return NaiveDate::from_ymd_opt(year, month, day);
            }
        }
    }

    if let Some(caps) = RE_YEAR_FIRST.captures(text) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }

    if let Some(caps) = RE_DAY_FIRST.captures(text) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }

    None
}

/// Parse and format as `YYYY-MM-DD`.
///
/// Placeholder values (`null`, `none`, `suspendido`) yield `None`.
pub fn normalize_date(text: &str) -> Option<String> {
    if is_placeholder(text) {
        return None;
    }
    parse_date(text).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Exactly `YYYY-MM-DD`.
pub fn is_iso_date(text: &str) -> bool {
    RE_STRICT_ISO.is_match(text.trim())
}

fn is_placeholder(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "" | "null" | "none" | "suspendido" | "n/a"
    )
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_iso() {
        assert_eq!(parse_date("2025-03-31"), Some(date(2025, 3, 31)));
        assert_eq!(parse_date(" 2025-3-1 "), Some(date(2025, 3, 1)));
        assert_eq!(parse_date("2025-02-30"), None);
    }

    #[test]
    fn test_spanish_long_forms() {
        assert_eq!(parse_date("10 de diciembre, 2025"), Some(date(2025, 12, 10)));
        assert_eq!(parse_date("15 de marzo de 2024"), Some(date(2024, 3, 15)));
        assert_eq!(
            parse_date("19 de Marzo, 2026 - 17:00"),
            Some(date(2026, 3, 19))
        );
        assert_eq!(parse_date("1 de setiembre del 2023"), Some(date(2023, 9, 1)));
    }

    #[test]
    fn test_numeric_forms() {
        assert_eq!(parse_date("05/04/2024"), Some(date(2024, 4, 5)));
        assert_eq!(parse_date("2024/04/05"), Some(date(2024, 4, 5)));
        assert_eq!(parse_date("Cierre: 31-01-2025 a las 17:00"), Some(date(2025, 1, 31)));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(parse_date("próximamente"), None);
        assert_eq!(parse_date("10 de brumario, 2025"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_date("10 de diciembre, 2025").as_deref(), Some("2025-12-10"));
        assert_eq!(normalize_date("Suspendido"), None);
        assert_eq!(normalize_date("null"), None);
    }

    #[test]
    fn test_is_iso_date() {
        assert!(is_iso_date("2025-01-09"));
        assert!(!is_iso_date("2025-1-9"));
        assert!(!is_iso_date("2025-**-09"));
    }
}
