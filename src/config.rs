//! Process configuration for the pipeline.
//!
//! Values come from environment variables (optionally loaded from a `.env`
//! file by the binary) and can be overridden by command-line flags.

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::retry::{DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::{
    BackoffPolicy, BrokerSettings, QueueName, QueueSettings, RetentionPolicy, RetryPolicy,
    WorkerPoolConfig,
};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for brokers, worker pools and collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Broker settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every Redis key and channel.
    pub key_prefix: String,
    /// Default attempt ceiling and backoff for every queue.
    pub retry: RetryPolicy,
    /// How many completed / failed jobs stay inspectable.
    pub retention: RetentionPolicy,

    // Worker settings
    /// Concurrent handlers for `scrape-project`.
    pub scrape_concurrency: usize,
    /// Concurrent handlers for `generate-posts`.
    pub postgen_concurrency: usize,
    /// Lease duration granted per delivery.
    pub lease_timeout: Duration,
    /// Wait per lease call while a queue is empty.
    pub poll_interval: Duration,
    /// Interval of the expired-lease sweep.
    pub reap_interval: Duration,
    /// Optional cap on one handler invocation.
    pub job_timeout: Option<Duration>,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_grace: Duration,

    // Collaborators
    /// Base URL of the scraping service.
    pub scraper_url: String,
    /// Base URL of the post generation service.
    pub postgen_url: String,
    /// Forward bus events to other processes over Redis pub/sub.
    pub relay_events: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "bead".to_string(),
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),

            scrape_concurrency: 2,
            postgen_concurrency: 1,
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            reap_interval: Duration::from_secs(5),
            job_timeout: None,
            shutdown_grace: Duration::from_secs(30),

            scraper_url: "http://localhost:4100".to_string(),
            postgen_url: "http://localhost:4200".to_string(),
            relay_events: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: full Redis URL; when unset it is built from
    ///   `REDIS_HOST` (default: localhost) and `REDIS_PORT` (default: 6379)
    /// - `QUEUE_KEY_PREFIX`: Redis key prefix (default: bead)
    /// - `QUEUE_MAX_ATTEMPTS`: deliveries per job (default: 3)
    /// - `QUEUE_BACKOFF_TYPE`: `exponential` or `fixed` (default: exponential)
    /// - `QUEUE_BACKOFF_DELAY_MS`: base delay (default: 2000)
    /// - `QUEUE_BACKOFF_MAX_DELAY_MS`: exponential ceiling (default: none)
    /// - `QUEUE_RETAIN_COMPLETED` / `QUEUE_RETAIN_FAILED`: history size (default: 100 / 500)
    /// - `SCRAPE_CONCURRENCY` / `POSTGEN_CONCURRENCY`: handlers per stage (default: 2 / 1)
    /// - `QUEUE_LEASE_TIMEOUT_SECS`: lease duration (default: 300)
    /// - `QUEUE_POLL_INTERVAL_MS`: lease wait (default: 1000)
    /// - `QUEUE_REAP_INTERVAL_SECS`: expired-lease sweep (default: 5)
    /// - `JOB_TIMEOUT_SECS`: per-handler cap (default: none)
    /// - `SHUTDOWN_GRACE_SECS`: drain period (default: 30)
    /// - `SCRAPER_URL` / `POSTGEN_URL`: collaborator base URLs
    /// - `EVENT_RELAY`: relay events over Redis pub/sub (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Broker settings
        config.redis_url = match lookup("REDIS_URL") {
            Some(url) => url,
            None => {
                let host = lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
                let port: u16 = match lookup("REDIS_PORT") {
                    Some(val) => parse_env_value(&val, "REDIS_PORT")?,
                    None => 6379,
                };
                format!("redis://{}:{}", host, port)
            }
        };

        if let Some(val) = lookup("QUEUE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        let max_attempts = match lookup("QUEUE_MAX_ATTEMPTS") {
            Some(val) => parse_env_value(&val, "QUEUE_MAX_ATTEMPTS")?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let delay_ms: u64 = match lookup("QUEUE_BACKOFF_DELAY_MS") {
            Some(val) => parse_env_value(&val, "QUEUE_BACKOFF_DELAY_MS")?,
            None => DEFAULT_BACKOFF_BASE_MS,
        };
        let delay = Duration::from_millis(delay_ms);
        let mut backoff = match lookup("QUEUE_BACKOFF_TYPE").as_deref() {
            None | Some("exponential") => BackoffPolicy::exponential(delay),
            Some("fixed") => BackoffPolicy::fixed(delay),
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "QUEUE_BACKOFF_TYPE".to_string(),
                    message: format!("expected 'exponential' or 'fixed', got '{}'", other),
                })
            }
        };
        if let Some(val) = lookup("QUEUE_BACKOFF_MAX_DELAY_MS") {
            let max_ms: u64 = parse_env_value(&val, "QUEUE_BACKOFF_MAX_DELAY_MS")?;
            backoff = backoff.with_max_delay(Duration::from_millis(max_ms));
        }
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        config.retry = RetryPolicy::new(max_attempts, backoff);

        if let Some(val) = lookup("QUEUE_RETAIN_COMPLETED") {
            config.retention.completed = parse_env_value(&val, "QUEUE_RETAIN_COMPLETED")?;
        }

        if let Some(val) = lookup("QUEUE_RETAIN_FAILED") {
            config.retention.failed = parse_env_value(&val, "QUEUE_RETAIN_FAILED")?;
        }

        // Worker settings
        if let Some(val) = lookup("SCRAPE_CONCURRENCY") {
            config.scrape_concurrency = parse_env_value(&val, "SCRAPE_CONCURRENCY")?;
        }

        if let Some(val) = lookup("POSTGEN_CONCURRENCY") {
            config.postgen_concurrency = parse_env_value(&val, "POSTGEN_CONCURRENCY")?;
        }

        if let Some(val) = lookup("QUEUE_LEASE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_LEASE_TIMEOUT_SECS")?;
            config.lease_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "QUEUE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("QUEUE_REAP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_REAP_INTERVAL_SECS")?;
            config.reap_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOB_TIMEOUT_SECS")?;
            config.job_timeout = Some(Duration::from_secs(secs));
        }

        if let Some(val) = lookup("SHUTDOWN_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "SHUTDOWN_GRACE_SECS")?;
            config.shutdown_grace = Duration::from_secs(secs);
        }

        // Collaborators
        if let Some(val) = lookup("SCRAPER_URL") {
            config.scraper_url = val;
        }

        if let Some(val) = lookup("POSTGEN_URL") {
            config.postgen_url = val;
        }

        if let Some(val) = lookup("EVENT_RELAY") {
            config.relay_events = parse_env_bool(&val, "EVENT_RELAY")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrape_concurrency == 0 || self.postgen_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "stage concurrency must be greater than 0".to_string(),
            ));
        }

        if self.lease_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lease_timeout must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() || self.reap_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval and reap_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(job_timeout) = self.job_timeout {
            if job_timeout >= self.lease_timeout {
                return Err(ConfigError::ValidationFailed(
                    "job_timeout must be shorter than lease_timeout".to_string(),
                ));
            }
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Queue settings every broker in this process uses.
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings::new(QueueSettings {
            retry: self.retry,
            retention: self.retention,
        })
    }

    pub fn concurrency(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::ScrapeProject => self.scrape_concurrency,
            QueueName::GeneratePosts => self.postgen_concurrency,
        }
    }

    /// Worker pool configuration for one stage.
    pub fn pool_config(&self, queue: QueueName) -> WorkerPoolConfig {
        let config = WorkerPoolConfig::new(queue, self.concurrency(queue))
            .with_lease_timeout(self.lease_timeout)
            .with_poll_interval(self.poll_interval)
            .with_reap_interval(self.reap_interval)
            .with_shutdown_timeout(self.shutdown_grace);
        match self.job_timeout {
            Some(timeout) => config.with_job_timeout(timeout),
            None => config,
        }
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_concurrency(mut self, queue: QueueName, concurrency: usize) -> Self {
        match queue {
            QueueName::ScrapeProject => self.scrape_concurrency = concurrency,
            QueueName::GeneratePosts => self.postgen_concurrency = concurrency,
        }
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
