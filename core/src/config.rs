//! Configuration Management Module
//!
//! File-based configuration (TOML or JSON) with environment-variable
//! overrides and validation, covering the database, queue, LLM access,
//! and the pipeline tuning knobs.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration file format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

/// Per-stage deadlines in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub reconnaissance: u64,
    pub generation: u64,
    /// Per-test validation budget
    pub validation: u64,
    /// Hard cap on the whole validation stage
    pub validation_cap: u64,
    pub optimization: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            reconnaissance: 60,
            generation: 120,
            validation: 30,
            validation_cap: 300,
            optimization: 60,
        }
    }
}

/// Retry ceilings for the stages that retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub reconnaissance: u32,
    pub generation: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnaissance: 2,
            generation: 3,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database path
    pub db_url: String,
    /// Job queue identifier (informational for the in-process queue)
    pub queue_url: String,
    /// HTTP bind host
    pub api_host: String,
    /// HTTP bind port
    pub api_port: u16,
    /// Worker tasks draining the job queue
    pub worker_count: usize,
    /// LLM chat-completions endpoint
    pub llm_base_url: String,
    /// IAM token endpoint
    pub llm_iam_url: String,
    /// Default model
    pub llm_model: String,
    /// IAM key id
    pub llm_key_id: Option<String>,
    /// IAM key secret
    pub llm_key_secret: Option<String>,
    /// Response cache TTL in seconds
    pub cache_ttl_s: u64,
    /// Embedding vector dimension
    pub embedding_dim: usize,
    /// Cosine threshold for semantic dedup
    pub similarity_threshold: f32,
    /// Parallel fan-out for per-test validation and embedding
    pub validator_fanout: usize,
    pub stage_timeouts_s: StageTimeouts,
    pub max_retries: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_url: "testops.db".to_string(),
            queue_url: "memory://jobs".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            worker_count: 2,
            llm_base_url: "https://foundation-models.api.cloud.ru/v1".to_string(),
            llm_iam_url: "https://iam.api.cloud.ru/api/v1/auth/token".to_string(),
            llm_model: "ai-sage/GigaChat3-10B-A1.8B".to_string(),
            llm_key_id: None,
            llm_key_secret: None,
            cache_ttl_s: 3600,
            embedding_dim: 384,
            similarity_threshold: 0.85,
            validator_fanout: 8,
            stage_timeouts_s: StageTimeouts::default(),
            max_retries: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P, format: ConfigFormat) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| anyhow!("Failed to read config file {}: {e}", path.display()))?;
            match format {
                ConfigFormat::Toml => toml::from_str(&contents)
                    .map_err(|e| anyhow!("Failed to parse TOML config: {e}"))?,
                ConfigFormat::Json => serde_json::from_str(&contents)
                    .map_err(|e| anyhow!("Failed to parse JSON config: {e}"))?,
            }
        } else {
            debug!("Config file {} not found, using defaults", path.display());
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        info!("Configuration loaded (model: {})", config.llm_model);
        Ok(config)
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TESTOPS_DB_URL") {
            self.db_url = v;
        }
        if let Ok(v) = std::env::var("TESTOPS_QUEUE_URL") {
            self.queue_url = v;
        }
        if let Ok(v) = std::env::var("TESTOPS_API_PORT") {
            if let Ok(port) = v.parse() {
                self.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("TESTOPS_LLM_BASE_URL") {
            self.llm_base_url = v;
        }
        if let Ok(v) = std::env::var("TESTOPS_LLM_MODEL") {
            self.llm_model = v;
        }
        if let Ok(v) = std::env::var("TESTOPS_LLM_KEY_ID") {
            self.llm_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("TESTOPS_LLM_KEY_SECRET") {
            self.llm_key_secret = Some(v);
        }
        if let Ok(v) = std::env::var("TESTOPS_SIMILARITY_THRESHOLD") {
            if let Ok(threshold) = v.parse() {
                self.similarity_threshold = threshold;
            }
        }
        if let Ok(v) = std::env::var("TESTOPS_VALIDATOR_FANOUT") {
            if let Ok(fanout) = v.parse() {
                self.validator_fanout = fanout;
            }
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(anyhow!("embedding_dim must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(anyhow!(
                "similarity_threshold ({}) must be within [0, 1]",
                self.similarity_threshold
            ));
        }
        if self.validator_fanout == 0 {
            return Err(anyhow!("validator_fanout must be > 0"));
        }
        if self.worker_count == 0 {
            return Err(anyhow!("worker_count must be > 0"));
        }
        Ok(())
    }
}
