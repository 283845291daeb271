//! Worker configuration.
//!
//! A single [`WorkerConfig`] value is built at startup (from the environment or
//! a YAML file) and handed to each component's constructor.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::NatsConfig;
use crate::error::{QueueError, Result};

/// Top-level configuration for one worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Service name, used as the message id prefix and in stats
    pub service_name: String,
    pub nats: NatsConfig,
    pub retry: RetryConfig,
    pub scaler: ScalerConfig,
    pub warmup: WarmupConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "pipeq-worker".to_string(),
            nats: NatsConfig::default(),
            retry: RetryConfig::default(),
            scaler: ScalerConfig::default(),
            warmup: WarmupConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failures tolerated before a message is dead-lettered
    pub max_retries: u32,
    /// Base delay per attempt, in seconds; the last entry repeats
    pub delays_secs: Vec<f64>,
    /// Symmetric jitter as a fraction of the base delay
    pub jitter_factor: f64,
    /// How long a completed record stays in the in-flight table
    pub completed_retention_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays_secs: vec![1.0, 5.0, 15.0, 60.0, 300.0],
            jitter_factor: 0.1,
            completed_retention_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown_secs: u64,
    /// Period of the scaling monitor loop
    pub check_interval_secs: u64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            cooldown_secs: 60,
            check_interval_secs: 30,
        }
    }
}

impl ScalerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub model_path: String,
    pub rounds: u32,
    pub load_time_ms: u64,
    pub inference_time_ms: u64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            model_path: "/models/stable-diffusion".to_string(),
            rounds: 3,
            load_time_ms: 2000,
            inference_time_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Build configuration from environment variables on top of the defaults.
    ///
    /// Call `dotenv::dotenv()` first if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// # Example
    /// ```ignore
    /// let config = WorkerConfig::load_from_file("config/illustration-worker.yaml")?;
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: Self = serde_yaml::from_str(&contents)
            .map_err(|e| QueueError::Config(format!("Failed to parse YAML: {}", e)))?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("SERVICE_NAME") {
            self.service_name = name;
        }
        if let Ok(url) = std::env::var("NATS_URL") {
            self.nats.url = url;
        }
        if let Ok(path) = std::env::var("MODEL_PATH") {
            self.warmup.model_path = path;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_parse("MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_parse("MIN_WORKERS")? {
            self.scaler.min_workers = v;
        }
        if let Some(v) = env_parse("MAX_WORKERS")? {
            self.scaler.max_workers = v;
        }
        if let Some(v) = env_parse("SCALING_COOLDOWN_SECS")? {
            self.scaler.cooldown_secs = v;
        }
        if let Some(v) = env_parse("SCALING_INTERVAL_SECS")? {
            self.scaler.check_interval_secs = v;
        }
        if let Some(v) = env_parse("WARMUP_ROUNDS")? {
            self.warmup.rounds = v;
        }
        if let Some(v) = env_parse("PORT")? {
            self.admin.port = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(QueueError::Config("service_name must not be empty".to_string()));
        }
        if self.scaler.min_workers == 0 {
            return Err(QueueError::Config("min_workers must be at least 1".to_string()));
        }
        if self.scaler.min_workers > self.scaler.max_workers {
            return Err(QueueError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.scaler.min_workers, self.scaler.max_workers
            )));
        }
        if let Some(bad) = self
            .retry
            .delays_secs
            .iter()
            .find(|secs| !secs.is_finite() || **secs < 0.0)
        {
            return Err(QueueError::Config(format!(
                "delays_secs entries must be finite and non-negative, got {}",
                bad
            )));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return Err(QueueError::Config(format!(
                "jitter_factor must be in [0, 1), got {}",
                self.retry.jitter_factor
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
