//! Prompts for extraction and prediction.
//!
//! Templates use `{placeholder}` markers filled by the `format_*` functions.
//! Output structure is enforced by the response schema sent with each
//! request; the prompts only describe field meaning.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use super::batch::Batch;
use crate::types::prediction::PredictionItem;

/// Prompt for extracting funding calls from a batch of pages.
pub const EXTRACTION_PROMPT: &str = r#"You are an analyst of research funding calls published by Chilean agencies.
Extract EVERY funding call or opportunity found in the content below.

The content comes from {pages} page(s), separated by "---". A listing page usually
shows about {expected} calls (the last page may show fewer). Extract all of them,
without skipping any; if a page shows more, extract all of those too.

For each call return:
- name (required): full name of the call
- opening_date: opening date text exactly as written (e.g. "10 de diciembre, 2025").
  Look for "Apertura:", "Inicio:", "Desde:". null if absent.
- closing_date: closing date text exactly as written, time included
  (e.g. "19 de marzo, 2026 - 17:00"). Look for "Cierre:", "Fecha de cierre:",
  "Hasta:", "Vence:". null if absent.
- organization: administering agency (e.g. "ANID", "MINEDUC", "CNA"); infer it from
  context when not explicit.
- funding: amount or kind of funding ("monto", "financiamiento", "$", "hasta", ...).
  null if absent.
- url: link to the call's own detail page when it appears in the content; never the
  listing page. null if absent.
- description: short summary (optional)
- sub_area: division or program area of the agency (optional)

Copy date texts verbatim; do not reformat them.
If there are no calls, return {"records": []}.

CONTENT:
{content}"#;

/// Prompt for predicting the next opening of closed calls.
pub const PREDICTION_PROMPT: &str = r#"You analyse funding calls and their earlier editions to estimate WHEN the NEXT
edition of each call will open.

CURRENT DATE: {today}

CALLS:
{items}

For each call, independently:
1. Study the opening and closing dates of the earlier editions: year, month, season.
2. Identify the dominant cadence (yearly, every two years, ...) and the usual window
   of the year in which the call opens.
3. Propose a FUTURE opening date consistent with that pattern, after the current
   date and strictly after the latest known edition year.
4. Set same_call to false when the earlier editions are not really the same call.
5. When the evidence is ambiguous or the next edition would be too far away, set
   predicted_date to null and explain why.

Return one item per call, keyed by its record_url, with predicted_date as
YYYY-MM-DD and a short, plain rationale."#;

/// SHA-256 of the extraction template, recorded in run reports.
pub fn extraction_prompt_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(EXTRACTION_PROMPT.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format the extraction prompt for a batch.
pub fn format_extraction_prompt(batch: &Batch, expected_per_page: usize) -> String {
    EXTRACTION_PROMPT
        .replace("{pages}", &batch.page_count().to_string())
        .replace("{expected}", &expected_per_page.to_string())
        .replace("{content}", &batch.combined_text)
}

/// Format the prediction prompt for a batch of items.
pub fn format_prediction_prompt(items: &[PredictionItem], today: NaiveDate) -> String {
    let items_text = items
        .iter()
        .enumerate()
        .map(|(i, item)| format_prediction_item(i + 1, item))
        .collect::<Vec<_>>()
        .join("\n\n");

    PREDICTION_PROMPT
        .replace("{today}", &today.format("%Y-%m-%d").to_string())
        .replace("{items}", &items_text)
}

fn format_prediction_item(position: usize, item: &PredictionItem) -> String {
    let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());

    let evidence = item
        .evidence
        .iter()
        .map(|prev| {
            let year = prev
                .evidence_year()
                .map(|y| y.to_string())
                .unwrap_or_else(|| "N/A".to_string());
            format!(
                "  - {} (year: {}, opening: {}, closing: {})",
                prev.name,
                year,
                na(&prev.opening_date),
                na(&prev.closing_date)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "CALL {}:\n- record_url: {}\n- Name: {}\n- Opening: {}\n- Closing: {}\n- Organization: {}\n- Description: {}\nEARLIER EDITIONS:\n{}",
        position,
        item.url,
        item.name,
        na(&item.opening_date),
        na(&item.closing_date),
        item.organization,
        item.description.as_deref().unwrap_or(""),
        evidence
    )
}
