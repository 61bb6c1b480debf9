//! Configuration types for generation, extraction, prediction and locking.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`GenerationClient`](crate::generation::GenerationClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature.
    ///
    /// Default: 0.1.
    pub temperature: f32,

    /// Output token budget used when the caller does not pick one.
    ///
    /// Default: 8000.
    pub max_output_tokens: u32,

    /// Upper bound on quota-path attempts (further capped by pool size).
    ///
    /// Default: 3.
    pub max_retries: u32,

    /// Pause between attempts.
    ///
    /// Default: 2s.
    pub retry_delay: Duration,

    /// Wall-clock limit per call.
    ///
    /// Default: 60s.
    pub call_timeout: Duration,

    /// Ceiling for truncation escalation.
    ///
    /// Default: 32000.
    pub max_token_budget: u32,

    /// Escalations allowed per invocation.
    ///
    /// Default: 3.
    pub max_escalations: u32,

    /// Retry hints shorter than this are transient limits.
    ///
    /// Default: 60s.
    pub transient_threshold: Duration,

    /// Transient hints to collect before one convergence sleep.
    ///
    /// Default: 3.
    pub transient_convergence: usize,

    /// Cooldown for a daily exhaustion without a retry hint.
    ///
    /// Default: 24h.
    pub daily_cooldown: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_output_tokens: 8000,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(60),
            max_token_budget: 32_000,
            max_escalations: 3,
            transient_threshold: Duration::from_secs(60),
            transient_convergence: 3,
            daily_cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Configuration for the extraction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Character limit per batch.
    ///
    /// Default: 250000.
    pub batch_size: usize,

    /// Consecutive failed batches before the run aborts.
    ///
    /// Default: 5.
    pub max_consecutive_failures: u32,

    /// Soft budget per batch, checked after the batch finishes.
    ///
    /// Default: 300s.
    pub max_time_per_batch: Duration,

    /// Optional budget for the whole run, checked between batches.
    ///
    /// Default: none.
    pub max_total_time: Option<Duration>,

    /// Keep going after a failed batch.
    ///
    /// Default: true.
    pub continue_on_error: bool,

    /// Typical records per listing page, for the quality heuristic.
    ///
    /// Default: 6.
    pub expected_per_page: usize,

    /// Re-issue suspiciously sparse batches once.
    ///
    /// Default: true.
    pub quality_retry: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 250_000,
            max_consecutive_failures: 5,
            max_time_per_batch: Duration::from_secs(300),
            max_total_time: None,
            continue_on_error: true,
            expected_per_page: 6,
            quality_retry: true,
        }
    }
}

impl ExtractionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_max_time_per_batch(mut self, budget: Duration) -> Self {
        self.max_time_per_batch = budget;
        self
    }

    pub fn with_max_total_time(mut self, budget: Duration) -> Self {
        self.max_total_time = Some(budget);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_quality_retry(mut self, enabled: bool) -> Self {
        self.quality_retry = enabled;
        self
    }
}

/// Configuration for the prediction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Items per generation call.
    ///
    /// Default: 10.
    pub batch_size: usize,

    /// Output token budget per batch.
    ///
    /// Default: 12000.
    pub max_output_tokens: u32,

    /// Extra attempts for a batch whose response cannot be used.
    ///
    /// Default: 3.
    pub max_retries: u32,

    /// How long to wait for the site's predict lock.
    ///
    /// Default: 30s.
    pub lock_timeout: Duration,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_output_tokens: 12_000,
            max_retries: 3,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl PredictionConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Configuration for [`LockManager`](crate::lock::LockManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Markers older than this are removed on sight.
    ///
    /// Default: 4h.
    pub stale_after: Duration,

    /// Poll interval while waiting.
    ///
    /// Default: 1s.
    pub poll_interval: Duration,

    /// Wait limit when the caller has none.
    ///
    /// Default: 30s.
    pub default_timeout: Duration,

    /// Wait limit for scrape sessions, which tend to queue behind repairs.
    ///
    /// Default: 60s.
    pub scrape_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(4 * 60 * 60),
            poll_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
            scrape_timeout: Duration::from_secs(60),
        }
    }
}

impl LockConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
