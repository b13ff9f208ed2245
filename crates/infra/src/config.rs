//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::time::Duration;

use playreport_ai::OpenAiConfig;
use uuid::Uuid;

use crate::jobs::{RetryPolicy, RunnerSettings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Settings shared by the API and worker binaries.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Shared secret for the trigger endpoint; `None` rejects every trigger call
    pub cron_secret: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub openai_base_url: Option<String>,
    pub max_attempts: u32,
    pub generator_timeout: Duration,
    pub batch_limit: usize,
    pub poll_interval: Duration,
    pub max_iterations: u32,
    pub worker_id: String,
    pub bind_addr: SocketAddr,
    /// `PROCESSING` jobs locked longer than this are reported as stale
    pub stale_after: Duration,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"<redacted>")
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<redacted>"))
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field("max_attempts", &self.max_attempts)
            .field("generator_timeout", &self.generator_timeout)
            .field("batch_limit", &self.batch_limit)
            .field("poll_interval", &self.poll_interval)
            .field("max_iterations", &self.max_iterations)
            .field("worker_id", &self.worker_id)
            .field("bind_addr", &self.bind_addr)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let config = Self {
            database_url,
            cron_secret: get("CRON_SECRET"),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL"),
            openai_base_url: get("OPENAI_BASE_URL"),
            max_attempts: parse_or(get("REPORT_MAX_ATTEMPTS"), "REPORT_MAX_ATTEMPTS", 5)?,
            generator_timeout: Duration::from_secs(parse_or(
                get("REPORT_GENERATOR_TIMEOUT_SECS"),
                "REPORT_GENERATOR_TIMEOUT_SECS",
                60,
            )?),
            batch_limit: parse_or(get("WORKER_BATCH_LIMIT"), "WORKER_BATCH_LIMIT", 3)?,
            poll_interval: Duration::from_millis(parse_or(
                get("WORKER_POLL_INTERVAL_MS"),
                "WORKER_POLL_INTERVAL_MS",
                5000,
            )?),
            max_iterations: parse_or(get("WORKER_MAX_ITERATIONS"), "WORKER_MAX_ITERATIONS", 100)?,
            worker_id: get("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            bind_addr: parse_or(
                get("BIND_ADDR"),
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            stale_after: Duration::from_secs(parse_or(
                get("STALE_PROCESSING_SECS"),
                "STALE_PROCESSING_SECS",
                900,
            )?),
        };
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "REPORT_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.generator_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "REPORT_GENERATOR_TIMEOUT_SECS",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(self)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            retry_policy: RetryPolicy::default().with_max_attempts(self.max_attempts),
            generator_timeout: self.generator_timeout,
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        let defaults = OpenAiConfig::default();
        OpenAiConfig {
            api_key: self.openai_api_key.clone(),
            model: self.openai_model.clone().unwrap_or(defaults.model),
            base_url: self.openai_base_url.clone().unwrap_or(defaults.base_url),
            request_timeout: self.generator_timeout,
        }
    }
}

fn parse_or<T>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}
