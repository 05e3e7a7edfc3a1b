//! Configuration types.
//!
//! Everything is read from `QUIZ_FORGE_*` environment variables with
//! defaults suitable for local development.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP port for the REST + SSE server.
    pub port: u16,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Idle time on a progress stream before a heartbeat record is sent.
    pub heartbeat_interval: Duration,
    /// Hard cap on how long a single progress stream stays open.
    pub stream_max_duration: Duration,
    /// Buffered events per subscriber channel before events are dropped.
    pub subscriber_capacity: usize,
    /// How long shutdown waits for running jobs before aborting them.
    pub shutdown_grace: Duration,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/quiz-forge.db"),
            heartbeat_interval: Duration::from_secs(15),
            stream_max_duration: Duration::from_secs(3600), // 1 hour
            subscriber_capacity: 256,
            shutdown_grace: Duration::from_secs(10),
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = parse_or(&lookup, "QUIZ_FORGE_PORT", defaults.port)?;
        let db_path = lookup("QUIZ_FORGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let heartbeat_secs = parse_or(
            &lookup,
            "QUIZ_FORGE_HEARTBEAT_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let stream_max_secs = parse_or(
            &lookup,
            "QUIZ_FORGE_STREAM_MAX_SECS",
            defaults.stream_max_duration.as_secs(),
        )?;
        let subscriber_capacity = parse_or(
            &lookup,
            "QUIZ_FORGE_SUBSCRIBER_CAPACITY",
            defaults.subscriber_capacity,
        )?;
        let shutdown_grace_secs = parse_or(
            &lookup,
            "QUIZ_FORGE_SHUTDOWN_GRACE_SECS",
            defaults.shutdown_grace.as_secs(),
        )?;

        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUIZ_FORGE_HEARTBEAT_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        if subscriber_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUIZ_FORGE_SUBSCRIBER_CAPACITY".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            port,
            db_path,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            stream_max_duration: Duration::from_secs(stream_max_secs),
            subscriber_capacity,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            log_dir: lookup("QUIZ_FORGE_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Settings for the question-generating LLM.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Base URL of the Messages API (overridable for proxies and tests).
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Attempts per request, including the first one.
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-20250514";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    /// Load LLM settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("ANTHROPIC_API_KEY")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        Ok(Self {
            api_key: secrecy::SecretString::from(api_key),
            model: lookup("QUIZ_FORGE_MODEL").unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            base_url: lookup("QUIZ_FORGE_LLM_BASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            max_tokens: parse_or(&lookup, "QUIZ_FORGE_LLM_MAX_TOKENS", 4096)?,
            temperature: parse_or(&lookup, "QUIZ_FORGE_LLM_TEMPERATURE", 0.4)?,
            max_attempts: parse_or(&lookup, "QUIZ_FORGE_LLM_MAX_ATTEMPTS", 3)?,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "QUIZ_FORGE_LLM_TIMEOUT_SECS",
                120,
            )?),
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ServiceConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.subscriber_capacity, 256);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("QUIZ_FORGE_PORT", "9090"),
            ("QUIZ_FORGE_HEARTBEAT_SECS", "3"),
            ("QUIZ_FORGE_DB_PATH", "/tmp/q.db"),
            ("QUIZ_FORGE_LOG_DIR", "/var/log/quiz"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/quiz")));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("QUIZ_FORGE_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "QUIZ_FORGE_PORT"));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("QUIZ_FORGE_HEARTBEAT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn llm_config_requires_api_key() {
        let err = LlmConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));

        let config = LlmConfig::from_lookup(lookup_from(&[("ANTHROPIC_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.model, LlmConfig::DEFAULT_MODEL);
        assert_eq!(config.max_attempts, 3);
    }
}
