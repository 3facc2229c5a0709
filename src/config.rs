//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::worker::queue::WorkerSettings;

/// Runtime configuration, read from `FORWARDER_*` environment variables.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// REST server port.
    pub http_port: u16,
    /// Bot API token. Required by the Telegram transport.
    pub telegram_bot_token: Option<SecretString>,
    /// Concurrent sends per rule dispatch (at least 1).
    pub max_parallel_sends: usize,
    /// Concurrent jobs in the worker.
    pub worker_concurrency: usize,
    /// How long a completed delivery suppresses redeliveries.
    pub dedup_window: Duration,
    /// Attempts per job before a transient failure is given up on.
    pub job_max_attempts: u32,
    /// Recent Telegram messages kept for fetches.
    pub message_cache_size: usize,
    /// `getUpdates` long-poll timeout.
    pub poll_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/forwarder.db"),
            http_port: 8080,
            telegram_bot_token: None,
            max_parallel_sends: 4,
            worker_concurrency: 8,
            dedup_window: Duration::from_secs(3600), // 1 hour
            job_max_attempts: 3,
            message_cache_size: 10_000,
            poll_timeout: Duration::from_secs(30),
        }
    }
}

impl ForwarderConfig {
    /// Build config from environment variables. Unset variables take defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup (the environment, or a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_parallel_sends: usize =
            parse_or(&non_empty, "FORWARDER_MAX_PARALLEL_SENDS", defaults.max_parallel_sends)?;
        if max_parallel_sends == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_MAX_PARALLEL_SENDS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            db_path: non_empty("FORWARDER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: parse_or(&non_empty, "FORWARDER_HTTP_PORT", defaults.http_port)?,
            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            max_parallel_sends,
            worker_concurrency: parse_or(&non_empty, "FORWARDER_WORKER_CONCURRENCY", defaults.worker_concurrency)?
                .max(1),
            dedup_window: Duration::from_secs(parse_or(
                &non_empty,
                "FORWARDER_DEDUP_WINDOW_SECS",
                defaults.dedup_window.as_secs(),
            )?),
            job_max_attempts: parse_or(&non_empty, "FORWARDER_JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?
                .max(1),
            message_cache_size: parse_or(&non_empty, "FORWARDER_MESSAGE_CACHE_SIZE", defaults.message_cache_size)?,
            poll_timeout: Duration::from_secs(parse_or(
                &non_empty,
                "FORWARDER_POLL_TIMEOUT_SECS",
                defaults.poll_timeout.as_secs(),
            )?),
        })
    }

    /// The bot token, or `MissingEnvVar` when it was not set.
    pub fn require_bot_token(&self) -> Result<&SecretString, ConfigError> {
        self.telegram_bot_token
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.worker_concurrency,
            max_attempts: self.job_max_attempts,
            ..WorkerSettings::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    fn config(vars: &[(&str, &str)]) -> Result<ForwarderConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ForwarderConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("./data/forwarder.db"));
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.max_parallel_sends, 4);
        assert_eq!(cfg.dedup_window, Duration::from_secs(3600));
        assert!(cfg.telegram_bot_token.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("FORWARDER_HTTP_PORT", "9000"),
            ("FORWARDER_DB_PATH", "/tmp/x.db"),
            ("FORWARDER_JOB_MAX_ATTEMPTS", "5"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ])
        .unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.worker_settings().max_attempts, 5);
        assert_eq!(cfg.require_bot_token().unwrap().expose_secret(), "123:abc");
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = config(&[("FORWARDER_HTTP_PORT", "eighty")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "FORWARDER_HTTP_PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_parallel_sends_is_rejected() {
        assert!(config(&[("FORWARDER_MAX_PARALLEL_SENDS", "0")]).is_err());
    }

    #[test]
    fn missing_token_is_reported() {
        let cfg = config(&[("TELEGRAM_BOT_TOKEN", "  ")]).unwrap();
        assert!(matches!(
            cfg.require_bot_token(),
            Err(ConfigError::MissingEnvVar(var)) if var == "TELEGRAM_BOT_TOKEN"
        ));
    }
}
