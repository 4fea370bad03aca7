//! Runtime configuration for the coordinator and embedded orchestrators.
//!
//! Every setting has a default and may be overridden by a `BUILDFIX_*`
//! environment variable. Fields are public so tests and embedding
//! applications can adjust them directly.

use crate::pipeline::{DispatcherConfig, ReconcileSettings};
use crate::queue::services::RetryPolicy;
use crate::telemetry::LogFormat;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every environment variable read here.
pub const ENV_PREFIX: &str = "BUILDFIX_";

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse or is out of range.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Full variable name.
        key: String,
        /// Raw value as read.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A required variable was not set.
    #[error("{0} must be set")]
    Missing(String),
}

/// Settings for queue, retry, dispatch, reconciliation, and the admin server.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// `PostgreSQL` connection URL.
    pub database_url: Option<String>,
    /// Connection pool ceiling.
    pub db_pool_size: u32,
    /// Attempts before a task fails permanently.
    pub max_attempts: u32,
    /// First retry delay.
    pub retry_base_delay: Duration,
    /// Retry delay ceiling.
    pub retry_max_delay: Duration,
    /// Jitter ratio; `None` disables jitter.
    pub retry_jitter: Option<f64>,
    /// Dispatcher sleep when idle.
    pub poll_interval: Duration,
    /// Per-invocation handler budget.
    pub handler_timeout: Duration,
    /// Dispatchers spawned per task type.
    pub workers_per_type: usize,
    /// Age at which an `IN_PROGRESS` task is reconciled.
    pub stale_after: Duration,
    /// Time between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Admin HTTP listen address.
    pub admin_bind: SocketAddr,
    /// Pending backlog above which health degrades.
    pub pending_threshold: u64,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_pool_size: 10,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
            retry_jitter: Some(0.2),
            poll_interval: Duration::from_millis(1000),
            handler_timeout: Duration::from_secs(900),
            workers_per_type: 1,
            stale_after: Duration::from_secs(1800),
            reconcile_interval: Duration::from_secs(60),
            admin_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            pending_threshold: 100,
            log_format: LogFormat::Text,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a full variable
    /// name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed variables or
    /// settings that fail [`Self::validate`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            database_url: lookup(&var("DATABASE_URL")).filter(|url| !url.trim().is_empty()),
            db_pool_size: read_positive(&lookup, "DB_POOL_SIZE")?.unwrap_or(defaults.db_pool_size),
            max_attempts: read_positive(&lookup, "MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            retry_base_delay: read_secs(&lookup, "RETRY_BASE_DELAY_SECS")?
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: read_secs(&lookup, "RETRY_MAX_DELAY_SECS")?
                .unwrap_or(defaults.retry_max_delay),
            retry_jitter: read_jitter(&lookup)?.unwrap_or(defaults.retry_jitter),
            poll_interval: read::<u64, _>(&lookup, "POLL_INTERVAL_MS")?
                .map_or(defaults.poll_interval, Duration::from_millis),
            handler_timeout: read_secs(&lookup, "HANDLER_TIMEOUT_SECS")?
                .unwrap_or(defaults.handler_timeout),
            workers_per_type: read_positive(&lookup, "WORKERS_PER_TYPE")?
                .unwrap_or(defaults.workers_per_type),
            stale_after: read_secs(&lookup, "STALE_AFTER_SECS")?.unwrap_or(defaults.stale_after),
            reconcile_interval: read_secs(&lookup, "RECONCILE_INTERVAL_SECS")?
                .unwrap_or(defaults.reconcile_interval),
            admin_bind: read(&lookup, "ADMIN_BIND")?.unwrap_or(defaults.admin_bind),
            pending_threshold: read(&lookup, "PENDING_THRESHOLD")?
                .unwrap_or(defaults.pending_threshold),
            log_format: read(&lookup, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that constrain each other.
    ///
    /// `stale_after` must exceed `handler_timeout` so a task is never
    /// reclaimed while its handler may still be running.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after <= self.handler_timeout {
            return Err(ConfigError::InvalidValue {
                key: var("STALE_AFTER_SECS"),
                value: self.stale_after.as_secs().to_string(),
                reason: format!(
                    "must exceed the handler timeout of {}s",
                    self.handler_timeout.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Returns the database URL or an error naming the missing variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when no URL is configured.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing(var("DATABASE_URL")))
    }

    /// Backoff policy built from the retry settings.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }

    /// Dispatcher polling and timeout settings.
    #[must_use]
    pub const fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: self.poll_interval,
            handler_timeout: self.handler_timeout,
        }
    }

    /// Stale-task reconciliation settings.
    #[must_use]
    pub const fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            stale_after: self.stale_after,
            interval: self.reconcile_interval,
        }
    }
}

fn var(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

fn read<T, F>(lookup: &F, suffix: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let key = var(suffix);
    let Some(raw) = lookup(&key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value: raw,
        })
}

fn read_positive<T, F>(lookup: &F, suffix: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq + Display,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match read::<T, F>(lookup, suffix)? {
        Some(value) if value == T::default() => Err(ConfigError::InvalidValue {
            key: var(suffix),
            value: value.to_string(),
            reason: "must be at least 1".to_owned(),
        }),
        parsed => Ok(parsed),
    }
}

fn read_secs<F>(lookup: &F, suffix: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(read::<u64, F>(lookup, suffix)?.map(Duration::from_secs))
}

fn read_jitter<F>(lookup: &F) -> Result<Option<Option<f64>>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(ratio) = read::<f64, F>(lookup, "RETRY_JITTER")? else {
        return Ok(None);
    };
    if !(0.0..=1.0).contains(&ratio) {
        return Err(ConfigError::InvalidValue {
            key: var("RETRY_JITTER"),
            value: ratio.to_string(),
            reason: "must be between 0 and 1".to_owned(),
        });
    }
    Ok(Some((ratio > 0.0).then_some(ratio)))
}
