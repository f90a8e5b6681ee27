//! Environment-based configuration for the worker binaries.
//!
//! Values are read through a lookup function so tests can supply them
//! without touching the process environment. Binaries load `.env` first and
//! then call [`WorkerConfig::from_env`] / [`AnalysisConfig::from_env`].

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::RetryPolicy;
use crate::workers::{AnalysisWorkerConfig, MessageWorkerConfig, ScanConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Connection settings shared by both binaries.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub redis_url: String,
    /// Overrides any password in `redis_url`
    pub redis_password: Option<String>,
    pub mongodb_url: String,
    pub mongo_database: String,
    pub connect_retry_attempts: u32,
    /// Step of the linear connect backoff
    pub connect_retry_delay: Duration,
    pub json_logs: bool,
}

impl ConnectionConfig {
    fn from_vars<F>(vars: &Vars<F>) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            redis_url: vars.required("REDIS_URL")?,
            redis_password: vars.optional("REDIS_PASSWORD"),
            mongodb_url: vars.required("MONGODB_URL")?,
            mongo_database: vars.required("MONGO_DATABASE")?,
            connect_retry_attempts: vars.at_least("CONNECT_RETRY_ATTEMPTS", 10, 1)?,
            connect_retry_delay: vars.seconds("CONNECT_RETRY_DELAY", 2.0, 0.0)?,
            json_logs: vars.flag("JSON_LOGS", false)?,
        })
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.connect_retry_attempts, self.connect_retry_delay)
    }
}

/// Settings of the `kurisu-worker` binary (message worker plus backfill scan).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub connection: ConnectionConfig,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub scan_batch_size: usize,
    pub spill_path: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let config = Self {
            connection: ConnectionConfig::from_vars(&vars)?,
            batch_size: vars.at_least("BATCH_SIZE", 10, 1)?,
            batch_timeout: vars.seconds("BATCH_TIMEOUT", 5.0, 1.0)?,
            max_retry_attempts: vars.parse("MAX_RETRY_ATTEMPTS", 3)?,
            base_retry_delay: vars.seconds("BASE_RETRY_DELAY", 1.0, 0.0)?,
            max_retry_delay: vars.seconds("MAX_RETRY_DELAY", 60.0, 0.0)?,
            scan_batch_size: vars.at_least("SCAN_BATCH_SIZE", 1000, 1)?,
            spill_path: vars.optional("SPILL_PATH").map(PathBuf::from),
        };

        if config.max_retry_delay < config.base_retry_delay {
            return Err(ConfigError::Invalid {
                key: "MAX_RETRY_DELAY",
                value: config.max_retry_delay.as_secs_f64().to_string(),
                reason: "must not be below BASE_RETRY_DELAY".into(),
            });
        }
        Ok(config)
    }

    pub fn message_worker(&self) -> MessageWorkerConfig {
        MessageWorkerConfig {
            failure_backoff: RetryPolicy::exponential(
                u32::MAX,
                self.base_retry_delay,
                self.max_retry_delay,
            ),
            connect_policy: self.connection.connect_policy(),
            spill_path: self.spill_path.clone(),
            ..MessageWorkerConfig::default()
        }
        .with_batch_size(self.batch_size)
        .with_batch_timeout(self.batch_timeout)
        .with_max_retry_attempts(self.max_retry_attempts)
    }

    pub fn scan(&self) -> ScanConfig {
        ScanConfig::default().with_page_size(self.scan_batch_size)
    }
}

/// Settings of the `kurisu-sentiment` binary.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub connection: ConnectionConfig,
    pub batch_size: usize,
    pub api_url: String,
}

impl AnalysisConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        Ok(Self {
            connection: ConnectionConfig::from_vars(&vars)?,
            batch_size: vars.at_least("SENTIMENT_BATCH_SIZE", 32, 1)?,
            api_url: vars.required("SENTIMENT_API_URL")?,
        })
    }

    pub fn analysis_worker(&self) -> AnalysisWorkerConfig {
        AnalysisWorkerConfig::default()
            .with_batch_size(self.batch_size)
            .with_connect_policy(self.connection.connect_policy())
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values are treated the same.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> ConfigResult<String> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str, default: T) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn at_least<T>(&self, key: &'static str, default: T, min: T) -> ConfigResult<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
        T::Err: Display,
    {
        let value = self.parse(key, default)?;
        if value < min {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: format!("must be at least {min}"),
            });
        }
        Ok(value)
    }

    /// Fractional seconds, e.g. `BASE_RETRY_DELAY=0.5`.
    fn seconds(&self, key: &'static str, default: f64, min: f64) -> ConfigResult<Duration> {
        let secs: f64 = self.parse(key, default)?;
        if !secs.is_finite() || secs < min {
            return Err(ConfigError::Invalid {
                key,
                value: secs.to_string(),
                reason: format!("must be a number of seconds >= {min}"),
            });
        }
        Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
            key,
            value: secs.to_string(),
            reason: e.to_string(),
        })
    }

    fn flag(&self, key: &'static str, default: bool) -> ConfigResult<bool> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value: v,
                    reason: "expected true or false".into(),
                }),
            },
        }
    }
}
