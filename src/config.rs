//! Process configuration read from the environment (and `.env`, if present).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HANDLERS: &str = "contact.created=ContactCreated";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub dispatcher: DispatcherConfig,
    /// `(event, handler name)` pairs, in configuration order.
    pub handlers: Vec<(String, String)>,
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr: SocketAddr = parse_or(var("WEBHOOK_BIND_ADDR"), "WEBHOOK_BIND_ADDR", || {
            DEFAULT_BIND_ADDR.parse()
        })?;
        let defaults = DispatcherConfig::default();
        let worker_count: usize =
            parse_or(var("WEBHOOK_WORKERS"), "WEBHOOK_WORKERS", || Ok(defaults.worker_count))?;
        let queue_size: usize =
            parse_or(var("WEBHOOK_QUEUE_SIZE"), "WEBHOOK_QUEUE_SIZE", || Ok(defaults.queue_size))?;
        let max_attempts: u32 = parse_or(var("WEBHOOK_MAX_ATTEMPTS"), "WEBHOOK_MAX_ATTEMPTS", || {
            Ok(defaults.retry.max_attempts)
        })?;
        let backoff_secs: u64 = parse_or(var("WEBHOOK_BACKOFF_SECS"), "WEBHOOK_BACKOFF_SECS", || {
            Ok(defaults.retry.backoff.as_secs())
        })?;
        let retry_failed = match var("WEBHOOK_RETRY_FAILED") {
            Some(v) => parse_bool(Some(v), "WEBHOOK_RETRY_FAILED")?,
            None => defaults.retry.retry_failed,
        };
        let timeout_secs: u64 = parse_or(var("WEBHOOK_JOB_TIMEOUT_SECS"), "WEBHOOK_JOB_TIMEOUT_SECS", || {
            Ok(defaults.job_timeout.as_secs())
        })?;

        for (key, value) in [
            ("WEBHOOK_WORKERS", worker_count as u64),
            ("WEBHOOK_QUEUE_SIZE", queue_size as u64),
            ("WEBHOOK_MAX_ATTEMPTS", u64::from(max_attempts)),
            ("WEBHOOK_JOB_TIMEOUT_SECS", timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        let handlers = parse_bindings(var("WEBHOOK_HANDLERS").as_deref().unwrap_or(DEFAULT_HANDLERS))?;

        let log_format = match var("LOG_FORMAT").map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("text") | Some("pretty") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(invalid("LOG_FORMAT", &format!("unknown format '{other}'"))),
        };

        Ok(Self {
            bind_addr,
            dispatcher: DispatcherConfig {
                worker_count,
                queue_size,
                retry: RetryPolicy {
                    max_attempts,
                    backoff: Duration::from_secs(backoff_secs),
                    retry_failed,
                },
                job_timeout: Duration::from_secs(timeout_secs),
            },
            handlers,
            database_url: var("DATABASE_URL"),
            log_format,
        })
    }

    pub fn handler_bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.handlers.iter().map(|(e, h)| (e.as_str(), h.as_str()))
    }
}

/// Parse `event=Handler,event=Handler`.
pub fn parse_bindings(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((event, handler)) if !event.trim().is_empty() && !handler.trim().is_empty() => {
                Ok((event.trim().to_string(), handler.trim().to_string()))
            }
            _ => Err(invalid(
                "WEBHOOK_HANDLERS",
                &format!("expected event=Handler, got '{entry}'"),
            )),
        })
        .collect()
}

fn parse_or<T, D>(value: Option<String>, key: &str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    D: FnOnce() -> Result<T, T::Err>,
{
    match value {
        Some(v) => v.parse().map_err(|e: T::Err| invalid(key, &e.to_string())),
        None => default().map_err(|e| invalid(key, &e.to_string())),
    }
}

fn parse_bool(value: Option<String>, key: &str) -> Result<bool, ConfigError> {
    match value.map(|v| v.to_ascii_lowercase()).as_deref() {
        None | Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some(other) => Err(invalid(key, &format!("expected a boolean, got '{other}'"))),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}
