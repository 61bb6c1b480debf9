//! Gemini implementation of the generation backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest::ai::GeminiBackend;
//!
//! let backend = GeminiBackend::new().with_model("gemini-2.5-flash-lite");
//! let client = GenerationClient::new(Arc::new(backend), pool, GenerationConfig::default());
//! ```

use async_trait::async_trait;
use gemini_client::{GeminiClient, GeminiError, GenerateContentRequest, GenerateContentResponse};

use crate::credentials::SecretString;
use crate::error::BackendError;
use crate::traits::backend::{FinishReason, GenerationBackend, GenerationRequest, GenerationResponse};

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-lite";

/// Gemini `generateContent` backend.
#[derive(Clone)]
pub struct GeminiBackend {
    client: GeminiClient,
    model: String,
}

impl Default for GeminiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiBackend {
    pub fn new() -> Self {
        Self {
            client: GeminiClient::new(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Use a preconfigured client (base URL, transport timeout).
    pub fn with_client(mut self, client: GeminiClient) -> Self {
        self.client = client;
        self
    }

    /// Set the model (default: gemini-2.5-flash-lite).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Get the current model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, BackendError> {
        let body = GenerateContentRequest::new(request.prompt.clone())
            .with_temperature(request.temperature)
            .with_max_output_tokens(request.max_output_tokens)
            .with_json_schema(request.output_schema.clone());

        let response = self
            .client
            .generate_content(credential.expose(), &self.model, &body)
            .await
            .map_err(backend_error)?;

        Ok(into_response(response))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

/// Map a Gemini response to the vendor-neutral shape.
fn into_response(response: GenerateContentResponse) -> GenerationResponse {
    if let Some(reason) = response.block_reason() {
        return GenerationResponse::new("", FinishReason::Blocked(reason.to_string()));
    }

    let text = response.text().unwrap_or_default().to_string();
    let finish = match response.finish_reason() {
        None | Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::MaxTokens,
        Some(reason @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) => {
            FinishReason::Blocked(reason.to_string())
        }
        Some(reason) if text.trim().is_empty() => FinishReason::Blocked(reason.to_string()),
        Some(reason) => FinishReason::Other(reason.to_string()),
    };

    GenerationResponse::new(text, finish)
}

/// Map a client error to the raw backend error.
fn backend_error(error: GeminiError) -> BackendError {
    match error {
        GeminiError::Network {
            message,
            timeout: true,
            ..
        } => BackendError {
            message,
            timed_out: true,
            ..Default::default()
        },
        GeminiError::Network {
            message,
            connect: true,
            ..
        } => BackendError::connect(message),
        GeminiError::Network { message, .. } => BackendError::other(message),
        GeminiError::Api {
            status,
            message,
            retry_after,
        } => BackendError {
            status: Some(status),
            message,
            retry_after,
            ..Default::default()
        },
        GeminiError::Config(message) | GeminiError::Parse(message) => BackendError::other(message),
    }
}
