//! Process configuration.
//!
//! Everything is read once at start-up ([`TaxbridgeConfig::from_env`]) and
//! handed to [`crate::services::Services`]; nothing reads the environment
//! after that.

use std::str::FromStr;
use std::time::Duration;

use taxbridge_observability::{LogFormat, LoggingConfig};
use thiserror::Error;

use crate::circuit::CircuitConfig;
use crate::jobs::{BackoffPolicy, JobType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Job queue settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    pub backoff: BackoffPolicy,
    /// Used when an enqueue request does not set `max_attempts`.
    pub default_max_attempts: u32,
    /// Fixed seed for retry jitter; `None` draws from OS entropy.
    pub jitter_seed: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            default_max_attempts: 5,
            jitter_seed: None,
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name used in logs to tell worker instances apart.
    pub name: String,
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Circuit breaker key for the external authority.
    pub service: String,
    /// PROCESSING jobs older than this are treated as abandoned.
    pub stale_after: Duration,
    /// Restrict claims to these job types (`None` = all).
    pub job_types: Option<Vec<JobType>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "taxbridge-worker".to_string(),
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            service: "tax-authority".to_string(),
            stale_after: Duration::from_millis(600_000),
            job_types: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_job_types(mut self, job_types: Vec<JobType>) -> Self {
        self.job_types = Some(job_types);
        self
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxbridgeConfig {
    /// `None` selects the in-memory stores.
    pub database_url: Option<String>,
    pub queue: QueueConfig,
    pub circuit: CircuitConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Default for TaxbridgeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            queue: QueueConfig::default(),
            circuit: CircuitConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TaxbridgeConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        config.database_url = env.string("DATABASE_URL");

        let base = env.millis("TAXBRIDGE_QUEUE_BASE_DELAY_MS", config.queue.backoff.base_delay)?;
        let max = env.millis("TAXBRIDGE_QUEUE_MAX_DELAY_MS", config.queue.backoff.max_delay)?;
        if max < base {
            return Err(ConfigError::invalid(
                "TAXBRIDGE_QUEUE_MAX_DELAY_MS",
                max.as_millis().to_string(),
                "must not be below the base delay",
            ));
        }
        config.queue.backoff = BackoffPolicy::new(base, max);
        config.queue.default_max_attempts = env.positive(
            "TAXBRIDGE_QUEUE_MAX_ATTEMPTS",
            config.queue.default_max_attempts,
        )?;
        config.queue.jitter_seed = env.parsed::<u64>("TAXBRIDGE_QUEUE_JITTER_SEED")?;

        config.circuit.failure_threshold = env.positive(
            "TAXBRIDGE_CIRCUIT_FAILURE_THRESHOLD",
            config.circuit.failure_threshold,
        )?;
        config.circuit.success_threshold = env.positive(
            "TAXBRIDGE_CIRCUIT_SUCCESS_THRESHOLD",
            config.circuit.success_threshold,
        )?;
        config.circuit.timeout = env.millis("TAXBRIDGE_CIRCUIT_TIMEOUT_MS", config.circuit.timeout)?;

        config.worker.poll_interval = env.millis(
            "TAXBRIDGE_WORKER_POLL_INTERVAL_MS",
            config.worker.poll_interval,
        )?;
        config.worker.batch_size =
            env.positive("TAXBRIDGE_WORKER_BATCH_SIZE", config.worker.batch_size)?;
        if let Some(service) = env.string("TAXBRIDGE_WORKER_SERVICE") {
            config.worker.service = service;
        }
        config.worker.stale_after =
            env.millis("TAXBRIDGE_WORKER_STALE_AFTER_MS", config.worker.stale_after)?;

        if let Some(raw) = env.string("TAXBRIDGE_LOG_FORMAT") {
            config.logging.format = LogFormat::parse(&raw).ok_or_else(|| {
                ConfigError::invalid("TAXBRIDGE_LOG_FORMAT", raw.clone(), "expected json or pretty")
            })?;
        }

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(key, raw.clone(), e.to_string())),
        }
    }

    fn positive(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.parsed::<u32>(key)? {
            None => Ok(default),
            Some(0) => Err(ConfigError::invalid(key, "0", "must be at least 1")),
            Some(v) => Ok(v),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parsed::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }
}
