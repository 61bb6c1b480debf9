//! Typed errors for the harvest library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use std::time::Duration;

use thiserror::Error;

use crate::lock::OperationKind;

/// Errors that can occur across pipeline runs.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Generation call failed after retries
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Another process kept the lock for longer than we were willing to wait
    #[error(
        "timed out after {}s waiting for the {kind} lock on {site}; \
         another {kind} run may still be active",
        .waited.as_secs()
    )]
    LockTimeout {
        site: String,
        kind: OperationKind,
        waited: Duration,
    },

    /// A conflicting operation is running on the same site
    #[error("a {kind} run is in progress for {site}")]
    Busy { site: String, kind: OperationKind },

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// A checked invariant did not hold
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    pub(crate) fn storage(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HarvestError::Storage(e.into())
    }
}

/// Outcome taxonomy of a generation invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// Short-lived rate limit
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credential's daily quota is used up
    #[error("daily quota exhausted")]
    QuotaExhaustedDaily,

    /// Call exceeded its wall-clock limit
    #[error("generation call timed out")]
    Timeout,

    /// Service unreachable
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Response does not match the output schema
    #[error("response does not match output schema: {0}")]
    MalformedSchema(String),

    /// Output still cut off at the largest allowed budget
    #[error("output truncated at {budget} tokens after {escalations} escalations")]
    TruncatedOutput { budget: u32, escalations: u32 },

    /// Every quota-path attempt failed
    #[error("all credentials exhausted after {attempts} attempts")]
    AllCredentialsExhausted { attempts: u32 },

    /// Safety or recitation filters rejected the response
    #[error("response blocked: {reason}")]
    Blocked { reason: String },

    /// Any other service-side failure
    #[error("service error ({status:?}): {message}")]
    Service {
        status: Option<u16>,
        message: String,
    },

    /// The pool has no credentials at all
    #[error("no credentials configured")]
    NoCredentials,
}

impl GenerationError {
    /// Whether the whole run should stop rather than just this batch.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            GenerationError::AllCredentialsExhausted { .. } | GenerationError::NoCredentials
        )
    }
}

/// Raw, vendor-neutral failure reported by a generation backend.
#[derive(Debug, Clone, PartialEq, Default, Error)]
#[error("{message}")]
pub struct BackendError {
    /// HTTP status when a response was received
    pub status: Option<u16>,
    pub message: String,
    /// Structured retry hint, when the service sent one
    pub retry_after: Option<Duration>,
    pub timed_out: bool,
    pub connect_failed: bool,
}

impl BackendError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            message: "request timed out".into(),
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connect_failed: true,
            ..Default::default()
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Page fetch failures. Always per-page, never fatal to a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("page not found: {url}")]
    NotFound { url: String },

    #[error("fetch failed for {url}: {reason}")]
    Failed { url: String, reason: String },
}

/// Result type alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for generation invocations.
pub type GenerationResult<T> = std::result::Result<T, GenerationError>;
