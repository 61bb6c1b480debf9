//! Model output -> extracted records.
//!
//! The model returns raw date texts and optional URLs. Everything derived
//! (normalized dates, status, organization fallback, URL resolution) is
//! computed here, deterministically.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::batch::Batch;
use crate::dates::normalize_date;
use crate::error::{GenerationError, GenerationResult};
use crate::sources::{is_listing_path, normalize_site, organization_for_url};
use crate::status::{derive_status, StatusInputs};
use crate::types::record::{ExtractedRecord, ParsedItem, RecordIssue};

/// Names shorter than this only match a manifest entry exactly.
const PARTIAL_MATCH_MIN_CHARS: usize = 10;

/// One call as returned by the model.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ModelRecord {
    /// Full name of the call
    pub name: String,

    /// Opening date text as written on the page
    #[serde(default)]
    pub opening_date: Option<String>,

    /// Closing date text as written on the page
    #[serde(default)]
    pub closing_date: Option<String>,

    /// Administering agency
    #[serde(default)]
    pub organization: Option<String>,

    #[serde(default)]
    pub funding: Option<String>,

    /// Detail-page URL, if shown in the content
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Division or program area
    #[serde(default)]
    pub sub_area: Option<String>,
}

/// Extraction response schema.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ModelRecords {
    pub records: Vec<ModelRecord>,
}

/// Batch facts needed to turn model output into records.
#[derive(Debug, Clone)]
pub struct ParseContext<'a> {
    /// Storage key of the source site
    pub site: String,
    pub manifest: &'a IndexMap<String, String>,
    pub listing_urls: Vec<String>,

    /// Base for relative URLs
    pub base_url: Option<Url>,

    pub today: NaiveDate,
    pub extracted_at: DateTime<Utc>,
}

impl<'a> ParseContext<'a> {
    pub fn for_batch(batch: &'a Batch, site: &str, extracted_at: DateTime<Utc>) -> Self {
        Self {
            site: normalize_site(site),
            manifest: &batch.manifest,
            listing_urls: batch.listing_urls(),
            base_url: batch.pages.first().and_then(|p| Url::parse(&p.url).ok()),
            today: extracted_at.date_naive(),
            extracted_at,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }
}

/// The item list of a response: a bare array or `{"records": [...]}`.
pub fn record_items(value: &Value) -> GenerationResult<&[Value]> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get("records") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(GenerationError::MalformedSchema(
                "expected an object with a \"records\" array".to_string(),
            )),
        },
        other => Err(GenerationError::MalformedSchema(format!(
            "expected an array or object, got {}",
            json_kind(other)
        ))),
    }
}

/// Parse every item of a response. A malformed item becomes a
/// [`RecordIssue::SchemaViolation`]; the others still parse.
pub fn parse_records(value: &Value, ctx: &ParseContext<'_>) -> GenerationResult<Vec<ParsedItem>> {
    let items = record_items(value)?;
    Ok(items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_item(index, item, ctx))
        .collect())
}

fn parse_item(index: usize, item: &Value, ctx: &ParseContext<'_>) -> ParsedItem {
    let model: ModelRecord =
        serde_json::from_value(item.clone()).map_err(|e| RecordIssue::SchemaViolation {
            index,
            reason: e.to_string(),
        })?;

    if model.name.trim().is_empty() {
        return Err(RecordIssue::SchemaViolation {
            index,
            reason: "name is empty".to_string(),
        });
    }

    Ok(to_record(model, ctx))
}

/// Build a record from model output.
pub fn to_record(model: ModelRecord, ctx: &ParseContext<'_>) -> ExtractedRecord {
    let name = model.name.trim().to_string();
    let opening_text = non_blank(model.opening_date);
    let closing_text = non_blank(model.closing_date);
    let opening = opening_text.as_deref().and_then(normalize_date);
    let closing = closing_text.as_deref().and_then(normalize_date);

    let url = model
        .url
        .as_deref()
        .and_then(|raw| accept_model_url(raw, ctx))
        .or_else(|| resolve_url_by_name(&name, ctx.manifest));

    let status = derive_status(
        &StatusInputs {
            opening_text: opening_text.as_deref(),
            closing_text: closing_text.as_deref(),
            opening: opening.as_deref(),
            closing: closing.as_deref(),
            url: url.as_deref(),
        },
        ctx.today,
    );

    let organization = non_blank(model.organization).unwrap_or_else(|| {
        organization_for_url(url.as_deref().unwrap_or(&ctx.site)).to_string()
    });

    ExtractedRecord {
        name,
        opening_date: opening,
        closing_date: closing,
        organization,
        funding: non_blank(model.funding),
        url,
        status,
        description: non_blank(model.description),
        sub_area: non_blank(model.sub_area),
        source_site: ctx.site.clone(),
        extracted_at: ctx.extracted_at,
        opening_date_text: opening_text,
        model_missed: false,
    }
}

/// Absolute form of a model URL, or `None` when it is unusable or points at
/// a listing page.
fn accept_model_url(raw: &str, ctx: &ParseContext<'_>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let absolute = match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
        Ok(_) => return None,
        Err(_) => ctx.base_url.as_ref()?.join(raw).ok()?.to_string(),
    };

    if is_listing_path(&absolute) || is_batch_listing(&absolute, &ctx.listing_urls) {
        debug!(url = %absolute, "Clearing listing URL from model output");
        return None;
    }

    Some(absolute)
}

fn is_batch_listing(url: &str, listing_urls: &[String]) -> bool {
    let url = url.trim_end_matches('/');
    listing_urls.iter().any(|l| l.trim_end_matches('/') == url)
}

/// Manifest URL whose display name matches `name`: exact (ignoring case)
/// anywhere in the manifest first, then one containing the other when both
/// are longer than ten characters.
pub fn resolve_url_by_name(name: &str, manifest: &IndexMap<String, String>) -> Option<String> {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    let names: Vec<(&String, String)> = manifest
        .iter()
        .map(|(url, display)| (url, display.trim().to_lowercase()))
        .filter(|(_, display)| !display.is_empty())
        .collect();

    if let Some((url, _)) = names.iter().find(|(_, display)| *display == wanted) {
        return Some((*url).clone());
    }

    if wanted.chars().count() <= PARTIAL_MATCH_MIN_CHARS {
        return None;
    }
    names
        .iter()
        .find(|(_, display)| {
            display.chars().count() > PARTIAL_MATCH_MIN_CHARS
                && (display.contains(&wanted) || wanted.contains(display.as_str()))
        })
        .map(|(url, _)| (*url).clone())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch::assemble;
    use crate::testing::listing_page;
    use crate::types::record::RecordStatus;
    use chrono::TimeZone;
    use serde_json::json;

    const LISTING: &str = "https://anid.cl/concursos/?page=1";
    const REGULAR: &str = "https://anid.cl/concursos/fondecyt-regular-2026/";
    const IDEA: &str = "https://anid.cl/concursos/fondef-idea-id-2026/";

    fn batch() -> Batch {
        let page = listing_page(
            LISTING,
            "FONDECYT Regular 2026 ... FONDEF IDeA I+D 2026 ...",
            &[
                (REGULAR, "Concurso FONDECYT Regular 2026"),
                (IDEA, "FONDEF IDeA I+D 2026"),
            ],
        );
        assemble(&[page], 10_000).batches.remove(0)
    }

    fn ctx(batch: &Batch) -> ParseContext<'_> {
        ParseContext::for_batch(batch, "anid.cl", Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_accepts_array_or_wrapped_object() {
        let b = batch();
        let ctx = ctx(&b);
        let bare = json!([{ "name": "FONDEF IDeA I+D 2026" }]);
        let wrapped = json!({ "records": [{ "name": "FONDEF IDeA I+D 2026" }] });

        assert_eq!(parse_records(&bare, &ctx).unwrap().len(), 1);
        assert_eq!(parse_records(&wrapped, &ctx).unwrap().len(), 1);
        assert!(matches!(
            parse_records(&json!({ "items": [] }), &ctx),
            Err(GenerationError::MalformedSchema(_))
        ));
        assert!(parse_records(&json!("text"), &ctx).is_err());
    }

    #[test]
    fn test_bad_items_become_issues() {
        let b = batch();
        let ctx = ctx(&b);
        let value = json!({ "records": [
            { "name": "FONDEF IDeA I+D 2026" },
            { "opening_date": "1 de abril, 2025" },
            { "name": "   " },
        ]});

        let parsed = parse_records(&value, &ctx).unwrap();
        assert!(parsed[0].is_ok());
        assert!(matches!(parsed[1], Err(RecordIssue::SchemaViolation { index: 1, .. })));
        assert!(matches!(parsed[2], Err(RecordIssue::SchemaViolation { index: 2, .. })));
    }

    #[test]
    fn test_dates_normalized_and_status_derived() {
        let b = batch();
        let model = ModelRecord {
            name: "FONDECYT Regular 2026".into(),
            opening_date: Some("10 de abril, 2025".into()),
            closing_date: Some("19 de junio, 2025 - 17:00".into()),
            organization: None,
            funding: Some(" ".into()),
            url: Some(REGULAR.into()),
            description: None,
            sub_area: Some("Proyectos de Investigación".into()),
        };

        let record = to_record(model, &ctx(&b));
        assert_eq!(record.opening_date.as_deref(), Some("2025-04-10"));
        assert_eq!(record.closing_date.as_deref(), Some("2025-06-19"));
        assert_eq!(record.opening_date_text.as_deref(), Some("10 de abril, 2025"));
        assert_eq!(record.status, Some(RecordStatus::Open));
        assert_eq!(record.organization, "ANID");
        assert_eq!(record.funding, None);
        assert_eq!(record.source_site, "anid.cl");
    }

    #[test]
    fn test_unparseable_dates_keep_raw_text() {
        let b = batch();
        let model = ModelRecord {
            name: "Becas".into(),
            opening_date: Some("Próximamente".into()),
            closing_date: None,
            organization: Some("ANID".into()),
            funding: None,
            url: None,
            description: None,
            sub_area: None,
        };

        let record = to_record(model, &ctx(&b));
        assert_eq!(record.opening_date, None);
        assert_eq!(record.opening_date_text.as_deref(), Some("Próximamente"));
        assert_eq!(record.status, None);
    }

    #[test]
    fn test_listing_url_cleared_then_resolved_by_name() {
        let b = batch();
        let model = ModelRecord {
            name: "FONDEF IDeA I+D 2026".into(),
            opening_date: None,
            closing_date: None,
            organization: None,
            funding: None,
            url: Some("https://anid.cl/concursos/".into()),
            description: None,
            sub_area: None,
        };

        let record = to_record(model, &ctx(&b));
        assert_eq!(record.url.as_deref(), Some(IDEA));
    }

    #[test]
    fn test_relative_url_joined() {
        let b = batch();
        let model = ModelRecord {
            name: "Otro".into(),
            opening_date: None,
            closing_date: None,
            organization: None,
            funding: None,
            url: Some("/concursos/otro-2026/".into()),
            description: None,
            sub_area: None,
        };

        let record = to_record(model, &ctx(&b));
        assert_eq!(record.url.as_deref(), Some("https://anid.cl/concursos/otro-2026/"));
    }

    #[test]
    fn test_resolve_url_by_name() {
        let b = batch();
        assert_eq!(
            resolve_url_by_name("fondecyt regular 2026", &b.manifest).as_deref(),
            Some(REGULAR)
        );
        assert_eq!(
            resolve_url_by_name("FONDEF IDeA I+D 2026", &b.manifest).as_deref(),
            Some(IDEA)
        );
        // Short names never match partially.
        assert_eq!(resolve_url_by_name("FONDEF", &b.manifest), None);
        assert_eq!(resolve_url_by_name("Becas Chile 2026", &b.manifest), None);
    }

    #[test]
    fn test_exact_name_beats_earlier_partial_match() {
        let mut manifest = IndexMap::new();
        manifest.insert(
            "https://anid.cl/concursos/fondecyt-regular-2026-extension/".to_string(),
            "FONDECYT Regular 2026 Extensión".to_string(),
        );
        manifest.insert(REGULAR.to_string(), "FONDECYT Regular 2026".to_string());

        assert_eq!(
            resolve_url_by_name("fondecyt regular 2026", &manifest).as_deref(),
            Some(REGULAR)
        );
    }
}
