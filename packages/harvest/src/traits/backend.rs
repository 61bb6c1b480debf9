//! Generation service boundary.
//!
//! One call per attempt: a prompt with an output schema goes in, JSON text
//! (or a raw error) comes out. Everything vendor-specific lives behind
//! [`GenerationBackend`] implementations and
//! [`classify_error`](crate::generation::classify_error).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::SecretString;
use crate::error::BackendError;

/// A single schema-constrained generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub output_schema: serde_json::Value,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Why the service stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    /// Output-size limit reached; the text is likely cut mid-structure
    MaxTokens,
    /// Safety or recitation filters stopped the response
    Blocked(String),
    Other(String),
}

/// Raw response text plus its finish reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub finish: FinishReason,
}

impl GenerationResponse {
    pub fn new(text: impl Into<String>, finish: FinishReason) -> Self {
        Self {
            text: text.into(),
            finish,
        }
    }

    /// A normally finished response.
    pub fn complete(text: impl Into<String>) -> Self {
        Self::new(text, FinishReason::Stop)
    }
}

/// A structured-output generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Issue one request with the given credential.
    async fn generate(
        &self,
        credential: &SecretString,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResponse, BackendError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "generation"
    }
}
