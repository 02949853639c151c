//! Configuration loader and validator for the enrichment pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::enrichment::{LookupPolicy, PipelineSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub lookup: Lookup,
    pub embedding: Embedding,
    pub search: Search,
    #[serde(default)]
    pub pipeline: Pipeline,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Bibliographic lookup API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lookup {
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub daily_quota: u32,
    /// Defaults to one partition per API key.
    #[serde(default)]
    pub partition_count: Option<usize>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_transport_retry_delay_ms")]
    pub transport_retry_delay_ms: u64,
    #[serde(default = "default_transport_max_retries")]
    pub transport_max_retries: u32,
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Embedding {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Search index settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Search {
    pub base_url: String,
    pub index: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Batch sizing and retry caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub batch_size: i64,
    pub chunk_size: usize,
    pub enrichment_retry_cap: i64,
    pub embedding_retry_cap: i64,
    /// Keep quota counters in the database so they survive restarts.
    pub persistent_quota: bool,
    /// IN_PROGRESS claims older than this are treated as left by a crashed run.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            chunk_size: 200,
            enrichment_retry_cap: 3,
            embedding_retry_cap: 3,
            persistent_quota: true,
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

fn default_claim_lease_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_transport_retry_delay_ms() -> u64 {
    500
}

fn default_transport_max_retries() -> u32 {
    1
}

fn default_rate_limit_cooldown_ms() -> u64 {
    60_000
}

fn default_rate_limit_max_retries() -> u32 {
    2
}

fn default_embedding_concurrency() -> usize {
    8
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Database URL: explicit setting, else a file under `data_dir`.
    pub fn database_url(&self) -> String {
        match &self.app.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!("sqlite://{}/catalog.db", self.app.data_dir),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.lookup
            .partition_count
            .unwrap_or(self.lookup.api_keys.len())
    }

    pub fn lookup_policy(&self) -> LookupPolicy {
        LookupPolicy {
            transport_max_retries: self.lookup.transport_max_retries,
            transport_retry_delay: Duration::from_millis(self.lookup.transport_retry_delay_ms),
            rate_limit_max_retries: self.lookup.rate_limit_max_retries,
            rate_limit_cooldown: Duration::from_millis(self.lookup.rate_limit_cooldown_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            api_keys: self.lookup.api_keys.clone(),
            partition_count: self.partition_count(),
            batch_size: self.pipeline.batch_size,
            chunk_size: self.pipeline.chunk_size,
            enrichment_retry_cap: self.pipeline.enrichment_retry_cap,
            embedding_retry_cap: self.pipeline.embedding_retry_cap,
            embedding_concurrency: self.embedding.concurrency,
            claim_lease: Duration::from_secs(self.pipeline.claim_lease_secs),
            lookup: self.lookup_policy(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.lookup.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("lookup.base_url must be non-empty"));
    }
    if cfg.lookup.api_keys.is_empty() {
        return Err(ConfigError::Invalid("lookup.api_keys must list at least one key"));
    }
    if cfg.lookup.api_keys.iter().any(|k| k.trim().is_empty()) {
        return Err(ConfigError::Invalid("lookup.api_keys must not contain empty keys"));
    }
    if cfg.lookup.daily_quota == 0 {
        return Err(ConfigError::Invalid("lookup.daily_quota must be > 0"));
    }
    match cfg.lookup.partition_count {
        Some(0) => return Err(ConfigError::Invalid("lookup.partition_count must be > 0")),
        Some(n) if n > cfg.lookup.api_keys.len() => {
            return Err(ConfigError::Invalid(
                "lookup.partition_count must not exceed the number of api_keys",
            ))
        }
        _ => {}
    }

    if cfg.embedding.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("embedding.base_url must be non-empty"));
    }
    if cfg.embedding.model.trim().is_empty() {
        return Err(ConfigError::Invalid("embedding.model must be non-empty"));
    }
    if cfg.embedding.concurrency == 0 {
        return Err(ConfigError::Invalid("embedding.concurrency must be > 0"));
    }

    if cfg.search.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("search.base_url must be non-empty"));
    }
    if cfg.search.index.trim().is_empty() {
        return Err(ConfigError::Invalid("search.index must be non-empty"));
    }

    if cfg.pipeline.batch_size <= 0 {
        return Err(ConfigError::Invalid("pipeline.batch_size must be > 0"));
    }
    if cfg.pipeline.chunk_size == 0 {
        return Err(ConfigError::Invalid("pipeline.chunk_size must be > 0"));
    }
    if cfg.pipeline.claim_lease_secs == 0 {
        return Err(ConfigError::Invalid("pipeline.claim_lease_secs must be > 0"));
    }
    if cfg.pipeline.enrichment_retry_cap < 0 || cfg.pipeline.embedding_retry_cap < 0 {
        return Err(ConfigError::Invalid("pipeline retry caps must be >= 0"));
    }

    Ok(())
}

/// Returns the reference YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

lookup:
  base_url: "https://www.aladin.co.kr/ttb/api/"
  api_keys:
    - "TTB_KEY_ONE"
    - "TTB_KEY_TWO"
  daily_quota: 5000
  request_timeout_secs: 30
  transport_retry_delay_ms: 500
  transport_max_retries: 1
  rate_limit_cooldown_ms: 60000
  rate_limit_max_retries: 2

embedding:
  base_url: "https://api.openai.com/v1/"
  api_key: "YOUR_EMBEDDING_API_KEY"
  model: "text-embedding-3-small"
  concurrency: 8

search:
  base_url: "http://localhost:9200/"
  index: "books"

pipeline:
  batch_size: 1000
  chunk_size: 200
  enrichment_retry_cap: 3
  embedding_retry_cap: 3
  persistent_quota: true
  claim_lease_secs: 3600
"#
}
