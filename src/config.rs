//! Configuration for the statistics engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::Backoff;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/keiba.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Batch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum resulted events before local aggregation is trusted
    #[serde(default = "default_availability_threshold")]
    pub availability_threshold: u64,
    /// Ids per event lookup query
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Entities per checkpointed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Records per write transaction
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    /// Activity horizon for incremental runs
    #[serde(default = "default_incremental_lookback_days")]
    pub incremental_lookback_days: i64,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    #[serde(default = "default_min_pair_samples")]
    pub min_pair_samples: u32,
}

fn default_availability_threshold() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    1000
}

fn default_upsert_batch_size() -> usize {
    500
}

fn default_incremental_lookback_days() -> i64 {
    45
}

fn default_checkpoint_dir() -> String {
    "data/checkpoints".to_string()
}

fn default_min_pair_samples() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            availability_threshold: default_availability_threshold(),
            chunk_size: default_chunk_size(),
            batch_size: default_batch_size(),
            upsert_batch_size: default_upsert_batch_size(),
            incremental_lookback_days: default_incremental_lookback_days(),
            checkpoint_dir: default_checkpoint_dir(),
            min_pair_samples: default_min_pair_samples(),
        }
    }
}

/// Retry settings as they appear in config files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn to_backoff(&self) -> Backoff {
        Backoff {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// External results API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    /// Fallback is disabled when no base URL is set
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Observed retention of the provider, not a documented contract
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_lookback_days() -> i64 {
    365
}

fn default_requests_per_second() -> f64 {
    2.0
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    50
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            lookback_days: default_lookback_days(),
            requests_per_second: default_requests_per_second(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            timeout_secs: default_timeout_secs(),
            retry: RetrySettings::default(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub external: ExternalConfig,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (KEIBA_STATS__ENGINE__BATCH_SIZE, etc.)
            .add_source(
                config::Environment::with_prefix("KEIBA_STATS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
