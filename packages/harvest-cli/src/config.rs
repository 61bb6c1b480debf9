use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use harvest::ai::DEFAULT_MODEL;
use harvest::ExtractionConfig;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Tokens added to the credential pool on startup
    pub api_keys: Vec<String>,
    pub model: String,
    pub base_url: Option<String>,
    pub batch_size: Option<usize>,
    pub max_consecutive_failures: Option<u32>,
    pub max_total_time: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            data_dir: env::var("HARVEST_DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            api_keys: env::var("GEMINI_API_KEYS")
                .map(|keys| split_keys(&keys))
                .unwrap_or_default(),
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            base_url: env::var("GEMINI_BASE_URL").ok(),
            batch_size: optional_number("HARVEST_BATCH_SIZE")?,
            max_consecutive_failures: optional_number("HARVEST_MAX_CONSECUTIVE_FAILURES")?,
            max_total_time: optional_number::<u64>("HARVEST_MAX_TOTAL_SECS")?
                .map(Duration::from_secs),
        })
    }

    /// Extraction settings with environment overrides applied.
    pub fn extraction(&self) -> ExtractionConfig {
        let mut config = ExtractionConfig::default();
        if let Some(size) = self.batch_size {
            config = config.with_batch_size(size);
        }
        if let Some(max) = self.max_consecutive_failures {
            config = config.with_max_consecutive_failures(max);
        }
        if let Some(budget) = self.max_total_time {
            config = config.with_max_total_time(budget);
        }
        config
    }
}

fn optional_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .ok()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(None),
    }
}

fn split_keys(keys: &str) -> Vec<String> {
    keys.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}
