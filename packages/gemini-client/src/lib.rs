//! Pure Gemini REST API client
//!
//! A minimal client for the `generateContent` endpoint with no domain logic,
//! no retries and no key management. The API key is supplied per call so
//! callers can rotate keys freely.
//!
//! # Example
//!
//! ```rust,ignore
//! use gemini_client::{GeminiClient, GenerateContentRequest};
//!
//! let client = GeminiClient::new().with_timeout(Duration::from_secs(60));
//!
//! let request = GenerateContentRequest::new("List the open calls")
//!     .with_temperature(0.1)
//!     .with_max_output_tokens(8000)
//!     .with_json_schema(schema);
//!
//! let response = client
//!     .generate_content(api_key, "gemini-2.5-flash-lite", &request)
//!     .await?;
//! println!("{:?}", response.text());
//! ```

pub mod error;
pub mod types;

pub use error::{GeminiError, Result};
pub use types::*;

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Pure Gemini API client.
#[derive(Clone)]
pub struct GeminiClient {
    http_client: Client,
    base_url: String,
    timeout: Option<Duration>,
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: None,
        }
    }

    /// Set a custom base URL (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Per-request timeout. Expiry surfaces as `GeminiError::Network { timeout: true, .. }`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint URL for a model, without the key parameter.
    pub fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// Call `generateContent`.
    pub async fn generate_content(
        &self,
        api_key: &str,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        if model.is_empty() {
            return Err(GeminiError::Config("model must not be empty".into()));
        }

        let start = std::time::Instant::now();

        let mut builder = self
            .http_client
            .post(self.endpoint(model))
            .query(&[("key", api_key)])
            .json(request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, model = %model, "Gemini request failed");
            GeminiError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, model = %model, "Gemini API error");
            return Err(api_error(status.as_u16(), &error_text));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GeminiError::Parse(e.to_string()))?;

        debug!(
            model = %model,
            duration_ms = start.elapsed().as_millis(),
            finish_reason = ?body.finish_reason(),
            "Gemini generateContent"
        );

        Ok(body)
    }
}

/// Build an API error from a non-2xx body, keeping the raw text when the
/// body is not the standard error envelope.
fn api_error(status: u16, body: &str) -> GeminiError {
    match serde_json::from_str::<types::ApiErrorBody>(body) {
        Ok(parsed) => {
            let retry_after = parsed.error.retry_delay();
            let message = match parsed.error.status {
                Some(s) if !parsed.error.message.contains(&s) => {
                    format!("{}: {}", s, parsed.error.message)
                }
                _ => parsed.error.message,
            };
            GeminiError::Api {
                status,
                message,
                retry_after,
            }
        }
        Err(_) => GeminiError::Api {
            status,
            message: body.to_string(),
            retry_after: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder() {
        let client = GeminiClient::new()
            .with_base_url("https://proxy.example.com/")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(client.base_url(), "https://proxy.example.com");
        assert_eq!(client.timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            client.endpoint("gemini-2.5-flash-lite"),
            "https://proxy.example.com/v1beta/models/gemini-2.5-flash-lite:generateContent"
        );
    }

    #[test]
    fn test_api_error_from_envelope() {
        let body = r#"{"error": {"code": 429, "message": "Please retry in 12.5s.",
            "status": "RESOURCE_EXHAUSTED",
            "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "12s"}]}}"#;

        match api_error(429, body) {
            GeminiError::Api {
                status,
                message,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert!(message.starts_with("RESOURCE_EXHAUSTED"));
                assert!(message.contains("retry in 12.5s"));
                assert_eq!(retry_after, Some(Duration::from_secs(12)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_from_plain_body() {
        let err = api_error(503, "upstream unavailable");
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_empty_model_rejected() {
        let client = GeminiClient::new();
        let err = client
            .generate_content("key", "", &GenerateContentRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GeminiError::Config(_)));
    }
}
