//! Configuration loader and validator for the content generation pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::limiter::RateLimit;
use crate::queue::{QueueOptions, Retention, RetryPolicy};
use crate::worker::WorkerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
    pub worker: Worker,
    pub generation: Generation,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub database_url: String,
    pub poll_interval_ms: u64,
}

/// Job queue delay, retry and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub completed_retention_secs: u64,
    pub completed_retention_count: u32,
    pub failed_retention_secs: u64,
}

/// Worker concurrency and rate limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub concurrency: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
}

/// Text generation service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generation {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Config {
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            delay: Duration::from_millis(self.queue.delay_ms),
            retry: RetryPolicy {
                max_attempts: self.queue.max_attempts,
                backoff_base: Duration::from_millis(self.queue.backoff_ms),
            },
            retention: Retention {
                completed_age: Duration::from_secs(self.queue.completed_retention_secs),
                completed_count: self.queue.completed_retention_count,
                failed_age: Duration::from_secs(self.queue.failed_retention_secs),
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker.concurrency,
            rate_limit: RateLimit {
                max: self.worker.rate_limit_max,
                window: Duration::from_millis(self.worker.rate_limit_window_ms),
            },
            poll_interval: Duration::from_millis(self.app.poll_interval_ms),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - An empty `generation.api_key` is filled from `OPENAI_API_KEY`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if cfg.generation.api_key.trim().is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            cfg.generation.api_key = key;
        }
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.queue.max_attempts == 0 {
        return Err(ConfigError::Invalid("queue.max_attempts must be > 0"));
    }
    if cfg.queue.completed_retention_count == 0 {
        return Err(ConfigError::Invalid("queue.completed_retention_count must be > 0"));
    }

    if cfg.worker.concurrency == 0 {
        return Err(ConfigError::Invalid("worker.concurrency must be > 0"));
    }
    if cfg.worker.rate_limit_max == 0 {
        return Err(ConfigError::Invalid("worker.rate_limit_max must be > 0"));
    }
    if cfg.worker.rate_limit_window_ms == 0 {
        return Err(ConfigError::Invalid("worker.rate_limit_window_ms must be > 0"));
    }

    if cfg.generation.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "generation.api_key must be non-empty (or set OPENAI_API_KEY)",
        ));
    }
    if cfg.generation.model.trim().is_empty() {
        return Err(ConfigError::Invalid("generation.model must be non-empty"));
    }
    if cfg.generation.timeout_secs == 0 {
        return Err(ConfigError::Invalid("generation.timeout_secs must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/pipeline.db"
  poll_interval_ms: 500

queue:
  delay_ms: 60000
  max_attempts: 3
  backoff_ms: 2000
  completed_retention_secs: 3600
  completed_retention_count: 1000
  failed_retention_secs: 86400

worker:
  concurrency: 5
  rate_limit_max: 10
  rate_limit_window_ms: 60000

generation:
  api_key: "YOUR_OPENAI_API_KEY"
  base_url: "https://api.openai.com/"
  model: "gpt-3.5-turbo"
  timeout_secs: 60
"#
}
