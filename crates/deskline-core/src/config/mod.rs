//! Client configuration read from the environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::SYNC_BATCH_LIMIT;
use crate::sync::{RetryPolicy, SyncEngineConfig};
use crate::util::{is_http_url, normalize_text_option};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every client front end
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Sync server base URL; `None` keeps the client local-only
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    /// Replica location; front ends supply their own default
    pub db_path: Option<PathBuf>,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub max_batch: usize,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("db_path", &self.db_path)
            .field("retry_base", &self.retry_base)
            .field("retry_max", &self.retry_max)
            .field("max_batch", &self.max_batch)
            .finish()
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = normalize_text_option(lookup("DESKLINE_API_URL"))
            .map(|url| url.trim_end_matches('/').to_string());
        if let Some(url) = api_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "DESKLINE_API_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let access_token = normalize_text_option(lookup("DESKLINE_ACCESS_TOKEN"));
        let db_path = normalize_text_option(lookup("DESKLINE_DB_PATH")).map(PathBuf::from);

        let retry_base_ms = parse_in_range(&lookup, "DESKLINE_SYNC_RETRY_BASE_MS", 1_000, 100, 60_000)?;
        let retry_max_secs = parse_in_range(&lookup, "DESKLINE_SYNC_RETRY_MAX_SECS", 60, 1, 3_600)?;
        let max_batch = parse_in_range(&lookup, "DESKLINE_SYNC_MAX_BATCH", 100, 1, SYNC_BATCH_LIMIT)?;

        let retry_base = Duration::from_millis(retry_base_ms);
        let retry_max = Duration::from_secs(retry_max_secs);
        if retry_max < retry_base {
            return Err(ConfigError::Invalid(
                "DESKLINE_SYNC_RETRY_MAX_SECS must not be shorter than DESKLINE_SYNC_RETRY_BASE_MS"
                    .to_string(),
            ));
        }

        Ok(Self {
            api_url,
            access_token,
            db_path,
            retry_base,
            retry_max,
            max_batch: usize::try_from(max_batch).unwrap_or(usize::MAX),
        })
    }

    /// Whether both the server URL and a credential are present
    pub const fn is_sync_configured(&self) -> bool {
        self.api_url.is_some() && self.access_token.is_some()
    }

    pub fn engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            max_batch: self.max_batch,
            retry: RetryPolicy {
                base: self.retry_base,
                max: self.retry_max,
            },
            ..SyncEngineConfig::default()
        }
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = normalize_text_option(lookup(name)) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        ClientConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_are_local_only() {
        let config = config_from(&[]).unwrap();
        assert!(!config.is_sync_configured());
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.retry_max, Duration::from_secs(60));
        assert_eq!(config.engine_config().max_batch, 100);
    }

    #[test]
    fn api_url_is_validated_and_trimmed() {
        let config = config_from(&[
            ("DESKLINE_API_URL", " https://sync.example.com/ "),
            ("DESKLINE_ACCESS_TOKEN", "token"),
        ])
        .unwrap();
        assert_eq!(config.api_url.as_deref(), Some("https://sync.example.com"));
        assert!(config.is_sync_configured());

        let err = config_from(&[("DESKLINE_API_URL", "sync.example.com")]).unwrap_err();
        assert!(err.to_string().contains("DESKLINE_API_URL"));
    }

    #[test]
    fn numeric_settings_are_range_checked() {
        let err = config_from(&[("DESKLINE_SYNC_MAX_BATCH", "0")]).unwrap_err();
        assert!(err.to_string().contains("[1, 200]"));
        assert!(config_from(&[("DESKLINE_SYNC_MAX_BATCH", "500")]).is_err());

        let err = config_from(&[("DESKLINE_SYNC_RETRY_BASE_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("DESKLINE_SYNC_RETRY_BASE_MS"));
    }

    #[test]
    fn debug_redacts_access_token() {
        let config = config_from(&[("DESKLINE_ACCESS_TOKEN", "sensitive-token")]).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
