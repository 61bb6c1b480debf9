//! Error types for the Gemini client.

use std::time::Duration;

use thiserror::Error;

/// Result type for Gemini client operations.
pub type Result<T> = std::result::Result<T, GeminiError>;

/// Gemini client errors.
///
/// Errors carry enough raw detail (status, message, transport flags) for a
/// caller to decide on retry policy; the client itself never retries.
#[derive(Debug, Error)]
pub enum GeminiError {
    /// Configuration error (invalid base URL, missing model)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure before a response was received
    #[error("Network error: {message}")]
    Network {
        message: String,
        timeout: bool,
        connect: bool,
    },

    /// Non-2xx response from the API
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        /// `RetryInfo.retryDelay` from the error details, when present
        retry_after: Option<Duration>,
    },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl GeminiError {
    /// HTTP status for API errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            GeminiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GeminiError::Network { timeout: true, .. })
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, GeminiError::Network { connect: true, .. })
    }
}

impl From<reqwest::Error> for GeminiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return GeminiError::Parse(e.to_string());
        }
        GeminiError::Network {
            message: e.to_string(),
            timeout: e.is_timeout(),
            connect: e.is_connect(),
        }
    }
}
