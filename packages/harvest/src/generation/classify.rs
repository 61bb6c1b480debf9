//! Vendor-quirk classification.
//!
//! The only place that looks at status codes and error wording. The retry
//! loop in [`GenerationClient`](super::GenerationClient) matches on
//! [`ErrorKind`] and nothing else.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::BackendError;

/// Retry hints are capped at one week.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

static RETRY_IN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry in ([\d.]+)\s*s").unwrap());

static RETRY_DELAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)retryDelay"?\s*[:=]\s*"?([\d.]+)s"#).unwrap());

/// What a failed attempt means for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Short rate limit; the hint is below the transient threshold
    TransientRateLimit(Duration),

    /// Quota gone for the day (or hint too long / absent)
    DailyQuotaExhausted(Option<Duration>),

    Timeout,

    ConnectionFailure,

    /// The service rejected the request or output schema
    SchemaViolation,

    Service,
}

impl ErrorKind {
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientRateLimit(_) | ErrorKind::DailyQuotaExhausted(_)
        )
    }
}

/// Classify a raw backend failure.
pub fn classify_error(error: &BackendError, transient_threshold: Duration) -> ErrorKind {
    if error.timed_out {
        return ErrorKind::Timeout;
    }
    if error.connect_failed {
        return ErrorKind::ConnectionFailure;
    }

    let message = error.message.to_lowercase();

    if is_rate_limited(error.status, &message) {
        let hint = error
            .retry_after
            .map(|hint| hint.min(MAX_RETRY_HINT))
            .or_else(|| parse_retry_hint(&error.message));
        return match hint {
            Some(hint) if hint < transient_threshold => ErrorKind::TransientRateLimit(hint),
            hint => ErrorKind::DailyQuotaExhausted(hint),
        };
    }

    match error.status {
        Some(408) | Some(504) => ErrorKind::Timeout,
        Some(400) if message.contains("schema") || message.contains("invalid json") => {
            ErrorKind::SchemaViolation
        }
        None if message.contains("timed out") || message.contains("timeout") => ErrorKind::Timeout,
        _ => ErrorKind::Service,
    }
}

fn is_rate_limited(status: Option<u16>, message: &str) -> bool {
    status == Some(429)
        || message.contains("quota")
        || message.contains("resource_exhausted")
        || message.contains("rate limit")
        || message.contains("429")
}

/// Retry hint from error text: `retry in 12.5s` or `retryDelay: "37s"`.
///
/// Fractional seconds round up.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let captures = RETRY_IN
        .captures(message)
        .or_else(|| RETRY_DELAY.captures(message))?;
    let secs: f64 = captures.get(1)?.as_str().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs(secs.ceil() as u64).min(MAX_RETRY_HINT))
}

/// Whether a JSON parse error looks like output cut off mid-structure.
pub fn is_truncation_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("eof while parsing")
        || message.contains("unterminated")
        || message.contains("unexpected end")
}

/// Strip a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    // Drop the info string (```json)
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}
