use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Retry policy around the backend call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    pub jitter_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Transport read timeout; bounds a backend stream that stops sending.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub ttl: chrono::Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub models: Vec<String>,
}

impl GatewayConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, so tests need not touch the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let base_url = get("BACKEND_BASE_URL")
            .ok_or(ConfigError::Missing { name: "BACKEND_BASE_URL" })?
            .trim_end_matches('/')
            .to_string();

        let retry_defaults = RetryConfig::default();
        let session_defaults = SessionConfig::default();

        let models = get("GATEWAY_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| vec!["default".to_string()]);

        Ok(Self {
            port: parse_or(&get, "PORT", 8080)?,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            backend: BackendConfig {
                base_url,
                api_key: get("BACKEND_API_KEY"),
                read_timeout: Duration::from_secs(parse_or(&get, "BACKEND_TIMEOUT_SECS", 300)?),
                connect_timeout: Duration::from_secs(parse_or(
                    &get,
                    "BACKEND_CONNECT_TIMEOUT_SECS",
                    10,
                )?),
            },
            retry: RetryConfig {
                max_attempts: parse_or(&get, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                initial_backoff_ms: parse_or(
                    &get,
                    "RETRY_INITIAL_BACKOFF_MS",
                    retry_defaults.initial_backoff_ms,
                )?,
                max_backoff_ms: parse_or(
                    &get,
                    "RETRY_MAX_BACKOFF_MS",
                    retry_defaults.max_backoff_ms,
                )?,
                ..retry_defaults
            },
            session: SessionConfig {
                ttl: chrono::Duration::seconds(parse_or(
                    &get,
                    "SESSION_TTL_SECS",
                    session_defaults.ttl.num_seconds(),
                )?),
                sweep_interval: Duration::from_secs(parse_or(
                    &get,
                    "SESSION_SWEEP_INTERVAL_SECS",
                    session_defaults.sweep_interval.as_secs(),
                )?),
            },
            models,
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
