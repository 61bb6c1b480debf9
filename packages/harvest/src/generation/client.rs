//! Reliable schema-constrained generation.
//!
//! [`GenerationClient::invoke`] wraps one logical request in a bounded retry
//! loop: quota failures rotate credentials, network failures retry the same
//! credential, truncated output escalates the token budget. All vendor
//! wording is handled by [`classify_error`](super::classify_error).

use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::budget::escalate;
use super::classify::{classify_error, is_truncation_error, strip_code_fences, ErrorKind};
use super::schema::response_schema;
use crate::credentials::{Credential, CredentialPool};
use crate::error::{BackendError, GenerationError, Result};
use crate::traits::backend::{
    FinishReason, GenerationBackend, GenerationRequest, GenerationResponse,
};
use crate::types::config::GenerationConfig;

/// A successful invocation.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Parsed JSON
    pub value: Value,

    /// Response text as received
    pub raw_text: String,

    /// Token budget of the successful call
    pub budget: u32,

    /// Calls made, including escalations
    pub calls: u32,

    pub escalations: u32,
}

/// How a completed response should be treated.
enum Interpretation {
    Parsed(Value),
    Truncated,
    Rejected(GenerationError),
}

/// Issues generation requests with retry, rotation and escalation.
#[derive(Clone)]
pub struct GenerationClient {
    backend: Arc<dyn GenerationBackend>,
    pool: Arc<CredentialPool>,
    config: GenerationConfig,
}

impl GenerationClient {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        pool: Arc<CredentialPool>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
        }
    }

    /// Same backend and pool, different settings.
    pub fn with_config(&self, config: GenerationConfig) -> Self {
        Self {
            backend: self.backend.clone(),
            pool: self.pool.clone(),
            config,
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Invoke and deserialize into `T`, with `T`'s schema as the output schema.
    pub async fn invoke_json<T>(&self, prompt: &str, initial_budget: u32) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = response_schema::<T>();
        let output = self.invoke(prompt, &schema, initial_budget).await?;
        serde_json::from_value(output.value)
            .map_err(|e| GenerationError::MalformedSchema(e.to_string()).into())
    }

    /// Issue one logical request.
    ///
    /// `max_attempts = min(max_retries, pool size)` counts failed calls;
    /// budget escalations and the one transient-limit convergence wait do
    /// not consume attempts.
    pub async fn invoke(
        &self,
        prompt: &str,
        schema: &Value,
        initial_budget: u32,
    ) -> Result<GenerationOutput> {
        let pool_len = self.pool.len().await;
        if pool_len == 0 {
            return Err(GenerationError::NoCredentials.into());
        }

        let max_attempts = (self.config.max_retries as usize).min(pool_len).max(1) as u32;
        let mut budget = initial_budget.min(self.config.max_token_budget);
        let mut attempt = 0u32;
        let mut calls = 0u32;
        let mut escalations = 0u32;
        let mut transient_hints: Vec<Duration> = Vec::new();
        let mut converged = false;
        let mut last_error: Option<GenerationError> = None;

        while attempt < max_attempts {
            let Some(selection) = self.pool.current().await? else {
                return Err(GenerationError::NoCredentials.into());
            };
            let credential = selection.credential;
            if selection.exhausted {
                debug!(credential = %credential.fingerprint(), "Calling with exhausted credential");
            }

            let request = GenerationRequest {
                prompt: prompt.to_string(),
                output_schema: schema.clone(),
                temperature: self.config.temperature,
                max_output_tokens: budget,
            };

            calls += 1;
            let started = tokio::time::Instant::now();
            let outcome = self.call(&credential, &request).await;
            debug!(
                backend = self.backend.name(),
                credential = %credential.fingerprint(),
                attempt = attempt + 1,
                max_attempts,
                budget,
                duration_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "Generation call"
            );

            let error = match outcome {
                Ok(response) => match interpret(&response) {
                    Interpretation::Parsed(value) => {
                        self.pool.record_call(&credential, true).await?;
                        return Ok(GenerationOutput {
                            value,
                            raw_text: response.text,
                            budget,
                            calls,
                            escalations,
                        });
                    }
                    Interpretation::Truncated => {
                        self.pool.record_call(&credential, false).await?;
                        if escalations < self.config.max_escalations
                            && budget < self.config.max_token_budget
                        {
                            let next = escalate(budget, self.config.max_token_budget);
                            escalations += 1;
                            info!(
                                from = budget,
                                to = next,
                                escalation = escalations,
                                "Output truncated, raising token budget"
                            );
                            budget = next;
                            continue;
                        }
                        warn!(budget, escalations, "Output truncated at final budget");
                        return Err(GenerationError::TruncatedOutput {
                            budget,
                            escalations,
                        }
                        .into());
                    }
                    Interpretation::Rejected(e) => {
                        self.pool.record_call(&credential, false).await?;
                        warn!(error = %e, "Generation response rejected");
                        return Err(e.into());
                    }
                },
                Err(error) => error,
            };

            self.pool.record_call(&credential, false).await?;
            attempt += 1;

            match classify_error(&error, self.config.transient_threshold) {
                ErrorKind::TransientRateLimit(hint) => {
                    transient_hints.push(hint);
                    self.pool.mark_exhausted(&credential, hint).await?;
                    last_error = Some(GenerationError::RateLimited {
                        retry_after: Some(hint),
                    });

                    let available = self.pool.available_count().await;
                    if !converged
                        && (transient_hints.len() >= self.config.transient_convergence
                            || available == 0)
                    {
                        let longest = transient_hints.iter().max().copied().unwrap_or_default();
                        let wait = longest + Duration::from_secs(1);
                        warn!(
                            credentials = transient_hints.len(),
                            wait_secs = wait.as_secs(),
                            "Transient rate limit on several credentials, waiting"
                        );
                        tokio::time::sleep(wait).await;

                        transient_hints.clear();
                        converged = true;
                        attempt = 0;
                        self.pool.reset_cursor().await?;
                        continue;
                    }

                    info!(
                        credential = %credential.fingerprint(),
                        retry_after_secs = hint.as_secs(),
                        "Transient rate limit, rotating credential"
                    );
                    self.pool.rotate().await?;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                ErrorKind::DailyQuotaExhausted(hint) => {
                    let cooldown = hint.unwrap_or(self.config.daily_cooldown);
                    self.pool.mark_exhausted(&credential, cooldown).await?;
                    last_error = Some(GenerationError::QuotaExhaustedDaily);

                    if self.pool.available_count().await == 0 {
                        warn!(attempts = calls, "Every credential is exhausted");
                        return Err(GenerationError::AllCredentialsExhausted { attempts: calls }.into());
                    }

                    warn!(
                        credential = %credential.fingerprint(),
                        cooldown_secs = cooldown.as_secs(),
                        "Quota exhausted, rotating credential"
                    );
                    self.pool.rotate().await?;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                kind @ (ErrorKind::Timeout | ErrorKind::ConnectionFailure) => {
                    // environment problem: same credential, no cooldown
                    last_error = Some(if kind == ErrorKind::Timeout {
                        GenerationError::Timeout
                    } else {
                        GenerationError::ConnectionFailure(error.message.clone())
                    });
                    warn!(
                        attempt,
                        max_attempts,
                        error = %error,
                        "Network failure, retrying with the same credential"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay * attempt).await;
                    }
                }
                ErrorKind::SchemaViolation => {
                    warn!(error = %error, "Request rejected by output schema");
                    return Err(GenerationError::MalformedSchema(error.message).into());
                }
                ErrorKind::Service => {
                    last_error = Some(GenerationError::Service {
                        status: error.status,
                        message: error.message.clone(),
                    });
                    warn!(attempt, max_attempts, error = %error, "Generation service error");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay * attempt).await;
                    }
                }
            }
        }

        let error = match last_error {
            None
            | Some(GenerationError::RateLimited { .. })
            | Some(GenerationError::QuotaExhaustedDaily) => {
                GenerationError::AllCredentialsExhausted { attempts: calls }
            }
            Some(other) => other,
        };
        warn!(error = %error, attempts = calls, "Generation failed after retries");
        Err(error.into())
    }

    async fn call(
        &self,
        credential: &Credential,
        request: &GenerationRequest,
    ) -> std::result::Result<GenerationResponse, BackendError> {
        match tokio::time::timeout(
            self.config.call_timeout,
            self.backend.generate(credential.token(), request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout()),
        }
    }
}

fn interpret(response: &GenerationResponse) -> Interpretation {
    match &response.finish {
        FinishReason::MaxTokens => return Interpretation::Truncated,
        FinishReason::Blocked(reason) => {
            return Interpretation::Rejected(GenerationError::Blocked {
                reason: reason.clone(),
            })
        }
        FinishReason::Stop | FinishReason::Other(_) => {}
    }

    let text = strip_code_fences(&response.text);
    if text.is_empty() {
        return Interpretation::Rejected(GenerationError::MalformedSchema(
            "empty response".to_string(),
        ));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) => Interpretation::Parsed(value),
        Err(e) if is_truncation_error(&e.to_string()) => Interpretation::Truncated,
        Err(e) => Interpretation::Rejected(GenerationError::MalformedSchema(e.to_string())),
    }
}
