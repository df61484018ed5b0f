//! Process configuration read from environment variables.
//!
//! # Required Variables
//!
//! - `TOKEN_SYMMETRIC_KEY`: HMAC key for access tokens, at least 32 bytes
//! - `DATABASE_URL`: Postgres connection string (not needed in in-memory mode)
//!
//! # Optional Variables
//!
//! - `DB_MAX_CONNECTIONS`: Default 10
//! - `RPC_ADDRESS`: Default `0.0.0.0:9090`
//! - `HTTP_ADDRESS`: Default `0.0.0.0:8080`
//! - `TASK_QUEUES`: Default `critical=10,default=5`
//! - `TASK_CONCURRENCY`: Default 10
//! - `TASK_POLL_INTERVAL_MS`: Default 500
//! - `TASK_TIMEOUT_SECS`: Default 30
//! - `TASK_LEASE_SECS`: Default 60, must exceed `TASK_TIMEOUT_SECS`
//! - `TASK_REAP_INTERVAL_SECS`: Default 5
//! - `TASK_BACKOFF`: `exponential` (default), `fixed` or `linear`
//! - `TASK_BACKOFF_BASE_MS`: Default 1000
//! - `TASK_BACKOFF_MAX_SECS`: Default 3600
//! - `SHUTDOWN_GRACE_SECS`: Default 10
//! - `VERIFY_EMAIL_URL`: Default `http://localhost:8080/v1/verify_email`
//! - `VERIFY_EMAIL_TTL_MINS`: Default 15
//! - `NOTIFIER_WEBHOOK_URL`: Unset means messages are only logged
//! - `LOG_FORMAT`: `json` (default) or `pretty`

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use postbox_observability::LogFormat;

use crate::tasks::{BackoffStrategy, ProcessorConfig, RetryPolicy, WeightedQueues};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {var}")]
    MissingRequired { var: String },

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub rpc_address: SocketAddr,
    pub http_address: SocketAddr,
    pub token_symmetric_key: String,
    pub task_queues: Vec<(String, u32)>,
    pub task_concurrency: usize,
    pub task_poll_interval: Duration,
    pub task_timeout: Duration,
    pub task_lease: Duration,
    pub task_reap_interval: Duration,
    pub task_retry: RetryPolicy,
    pub shutdown_grace: Duration,
    pub verify_email_url: String,
    pub verify_email_ttl: chrono::Duration,
    pub notifier_webhook_url: Option<String>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let token_symmetric_key = env.required("TOKEN_SYMMETRIC_KEY")?;
        if token_symmetric_key.len() < 32 {
            return Err(ConfigError::Validation(
                "TOKEN_SYMMETRIC_KEY must be at least 32 bytes".to_string(),
            ));
        }

        let task_queues = match env.get("TASK_QUEUES") {
            Some(raw) => parse_queue_weights(&raw)?,
            None => vec![("critical".to_string(), 10), ("default".to_string(), 5)],
        };

        let task_timeout = Duration::from_secs(env.parse_or("TASK_TIMEOUT_SECS", 30)?);
        let task_lease = Duration::from_secs(env.parse_or("TASK_LEASE_SECS", 60)?);
        if task_lease <= task_timeout {
            return Err(ConfigError::Validation(
                "TASK_LEASE_SECS must exceed TASK_TIMEOUT_SECS".to_string(),
            ));
        }

        let log_format = match env.get("LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw).ok_or(ConfigError::InvalidValue {
                var: "LOG_FORMAT".to_string(),
                value: raw,
            })?,
            None => LogFormat::Json,
        };

        let task_concurrency: usize = env.parse_or("TASK_CONCURRENCY", 10)?;
        if task_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                var: "TASK_CONCURRENCY".to_string(),
                value: "0".to_string(),
            });
        }

        let strategy = match env.get("TASK_BACKOFF") {
            Some(raw) => BackoffStrategy::parse(&raw).ok_or(ConfigError::InvalidValue {
                var: "TASK_BACKOFF".to_string(),
                value: raw,
            })?,
            None => BackoffStrategy::Exponential,
        };
        let task_retry = RetryPolicy {
            strategy,
            base_delay: Duration::from_millis(env.parse_or("TASK_BACKOFF_BASE_MS", 1000)?),
            max_delay: Duration::from_secs(env.parse_or("TASK_BACKOFF_MAX_SECS", 3600)?),
        };

        Ok(Self {
            database_url: env.get("DATABASE_URL"),
            db_max_connections: env.parse_or("DB_MAX_CONNECTIONS", 10)?,
            rpc_address: env.parse_or("RPC_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 9090)))?,
            http_address: env.parse_or("HTTP_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            token_symmetric_key,
            task_queues,
            task_concurrency,
            task_poll_interval: Duration::from_millis(env.parse_or("TASK_POLL_INTERVAL_MS", 500)?),
            task_timeout,
            task_lease,
            task_reap_interval: Duration::from_secs(env.parse_or("TASK_REAP_INTERVAL_SECS", 5)?),
            task_retry,
            shutdown_grace: Duration::from_secs(env.parse_or("SHUTDOWN_GRACE_SECS", 10)?),
            verify_email_url: env
                .get("VERIFY_EMAIL_URL")
                .unwrap_or_else(|| "http://localhost:8080/v1/verify_email".to_string()),
            verify_email_ttl: chrono::Duration::minutes(env.parse_or("VERIFY_EMAIL_TTL_MINS", 15)?),
            notifier_webhook_url: env.get("NOTIFIER_WEBHOOK_URL"),
            log_format,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                var: "DATABASE_URL".to_string(),
            })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            name: "task-processor".to_string(),
            queues: self.task_queues.clone(),
            concurrency: self.task_concurrency,
            poll_interval: self.task_poll_interval,
            task_timeout: self.task_timeout,
            lease: self.task_lease,
            reap_interval: self.task_reap_interval,
            retry: self.task_retry.clone(),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are treated the same.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &str) -> Result<String, ConfigError> {
        self.get(var).ok_or_else(|| ConfigError::MissingRequired {
            var: var.to_string(),
        })
    }

    fn parse_or<T: FromStr>(&self, var: &str, default: T) -> Result<T, ConfigError> {
        match self.get(var) {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
            }),
            None => Ok(default),
        }
    }
}

/// Parse `name=weight[,name=weight...]`.
pub fn parse_queue_weights(raw: &str) -> Result<Vec<(String, u32)>, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        var: "TASK_QUEUES".to_string(),
        value: raw.to_string(),
    };

    let queues = raw
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, weight) = pair.split_once('=').ok_or_else(invalid)?;
            let weight: u32 = weight.trim().parse().map_err(|_| invalid())?;
            Ok((name.trim().to_string(), weight))
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    WeightedQueues::new(queues.clone())
        .map_err(|e| ConfigError::Validation(format!("TASK_QUEUES: {e}")))?;
    Ok(queues)
}
