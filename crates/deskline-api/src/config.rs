use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use deskline_core::protocol::SYNC_BATCH_LIMIT;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Server database file, or `:memory:`
    pub database_path: String,
    /// HS256 secret for self-issued access tokens
    pub jwt_secret: Option<String>,
    pub supabase: Option<SupabaseAuthConfig>,
    pub auth_clock_skew: Duration,
    pub sync_max_batch_operations: usize,
    pub pull_page_limit: usize,
    pub realtime_buffer: usize,
    pub rate_limit_window: Duration,
    pub sync_rate_limit_per_window: u32,
    pub pull_rate_limit_per_window: u32,
    pub bootstrap: Option<BootstrapOrganization>,
}

/// RS256 verification against a Supabase project's JWKS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseAuthConfig {
    pub jwks_url: String,
    pub issuer: String,
    pub audience: String,
    pub jwks_cache_ttl: Duration,
}

/// Organization created at startup when its admin has no memberships yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOrganization {
    pub name: String,
    pub admin_user_id: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("supabase", &self.supabase)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("sync_max_batch_operations", &self.sync_max_batch_operations)
            .field("pull_page_limit", &self.pull_page_limit)
            .field("realtime_buffer", &self.realtime_buffer)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_rate_limit_per_window",
                &self.sync_rate_limit_per_window,
            )
            .field(
                "pull_rate_limit_per_window",
                &self.pull_rate_limit_per_window,
            )
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "DESKLINE_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = required_trimmed(&lookup, "DESKLINE_DATABASE_PATH")?;

        let jwt_secret = optional_trimmed(&lookup, "AUTH_JWT_SECRET");
        if jwt_secret.as_deref().is_some_and(|secret| secret.len() < 32) {
            return Err(ConfigError::Invalid(
                "AUTH_JWT_SECRET must be at least 32 characters".to_string(),
            ));
        }

        let supabase = parse_supabase_config(&lookup)?;
        if jwt_secret.is_none() && supabase.is_none() {
            return Err(ConfigError::Invalid(
                "Set AUTH_JWT_SECRET or SUPABASE_URL to enable authentication".to_string(),
            ));
        }

        let auth_clock_skew_secs = parse_in_range(&lookup, "AUTH_CLOCK_SKEW_SECS", 60, 0, 300)?;
        let sync_max_batch_operations =
            parse_in_range(&lookup, "SYNC_MAX_BATCH_OPERATIONS", SYNC_BATCH_LIMIT, 1, 1_000)?;
        let pull_page_limit = parse_in_range(&lookup, "PULL_PAGE_LIMIT", 1_000, 10, 10_000)?;
        let realtime_buffer = parse_in_range(&lookup, "REALTIME_BUFFER", 1_024, 16, 65_536)?;
        let rate_limit_window_secs =
            parse_in_range(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10, 3_600)?;
        let sync_rate_limit_per_window =
            parse_in_range(&lookup, "SYNC_RATE_LIMIT_PER_WINDOW", 120, 1, 10_000)?;
        let pull_rate_limit_per_window =
            parse_in_range(&lookup, "PULL_RATE_LIMIT_PER_WINDOW", 60, 1, 10_000)?;

        let bootstrap = parse_bootstrap(&lookup)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            supabase,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            sync_max_batch_operations: to_usize(sync_max_batch_operations),
            pull_page_limit: to_usize(pull_page_limit),
            realtime_buffer: to_usize(realtime_buffer),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_rate_limit_per_window: to_u32(sync_rate_limit_per_window),
            pull_rate_limit_per_window: to_u32(pull_rate_limit_per_window),
            bootstrap,
        })
    }
}

fn parse_supabase_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<SupabaseAuthConfig>, ConfigError> {
    let Some(supabase_url) = optional_trimmed(&lookup, "SUPABASE_URL") else {
        return Ok(None);
    };
    if !is_http_url(&supabase_url) {
        return Err(ConfigError::Invalid(
            "SUPABASE_URL must start with http:// or https://".to_string(),
        ));
    }

    let default_jwks = format!(
        "{}/auth/v1/.well-known/jwks.json",
        trim_trailing(&supabase_url)
    );
    let jwks_url = value_or_default(&lookup, "SUPABASE_JWKS_URL", &default_jwks);
    if !is_http_url(&jwks_url) {
        return Err(ConfigError::Invalid(
            "SUPABASE_JWKS_URL must start with http:// or https://".to_string(),
        ));
    }

    let default_issuer = format!("{}/auth/v1", trim_trailing(&supabase_url));
    let issuer = value_or_default(&lookup, "SUPABASE_JWT_ISSUER", &default_issuer);
    let audience = value_or_default(&lookup, "SUPABASE_JWT_AUDIENCE", "authenticated");
    let cache_ttl_secs =
        parse_in_range(&lookup, "SUPABASE_JWKS_CACHE_TTL_SECS", 300, 30, 86_400)?;

    Ok(Some(SupabaseAuthConfig {
        jwks_url,
        issuer,
        audience,
        jwks_cache_ttl: Duration::from_secs(cache_ttl_secs),
    }))
}

fn parse_bootstrap(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<BootstrapOrganization>, ConfigError> {
    let name = optional_trimmed(&lookup, "DESKLINE_BOOTSTRAP_ORG_NAME");
    let admin_user_id = optional_trimmed(&lookup, "DESKLINE_BOOTSTRAP_ADMIN_USER_ID");

    match (name, admin_user_id) {
        (None, None) => Ok(None),
        (Some(name), Some(admin_user_id)) => Ok(Some(BootstrapOrganization {
            name,
            admin_user_id,
        })),
        (Some(_), None) => Err(ConfigError::MissingVar("DESKLINE_BOOTSTRAP_ADMIN_USER_ID")),
        (None, Some(_)) => Err(ConfigError::MissingVar("DESKLINE_BOOTSTRAP_ORG_NAME")),
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
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

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        database_path: ":memory:".to_string(),
        jwt_secret: Some("test-secret-that-is-long-enough-for-hs256".to_string()),
        supabase: None,
        auth_clock_skew: Duration::from_secs(60),
        sync_max_batch_operations: 200,
        pull_page_limit: 1_000,
        realtime_buffer: 64,
        rate_limit_window: Duration::from_secs(60),
        sync_rate_limit_per_window: 1_000,
        pull_rate_limit_per_window: 1_000,
        bootstrap: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_database_path() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("DESKLINE_DATABASE_PATH"));
    }

    #[test]
    fn config_requires_an_auth_method() {
        let err = config_from(&[("DESKLINE_DATABASE_PATH", "server.db")]).unwrap_err();
        assert!(err.to_string().contains("AUTH_JWT_SECRET"));
    }

    #[test]
    fn supabase_defaults_derive_from_project_url() {
        let config = config_from(&[
            ("DESKLINE_DATABASE_PATH", "server.db"),
            ("SUPABASE_URL", "https://project.supabase.co/"),
        ])
        .unwrap();
        let supabase = config.supabase.unwrap();
        assert_eq!(
            supabase.jwks_url,
            "https://project.supabase.co/auth/v1/.well-known/jwks.json"
        );
        assert_eq!(supabase.issuer, "https://project.supabase.co/auth/v1");
        assert_eq!(config.sync_max_batch_operations, 200);
        assert_eq!(config.pull_page_limit, 1_000);
    }

    #[test]
    fn numeric_limits_are_range_checked() {
        let err = config_from(&[
            ("DESKLINE_DATABASE_PATH", "server.db"),
            ("AUTH_JWT_SECRET", "0123456789abcdef0123456789abcdef"),
            ("PULL_PAGE_LIMIT", "5"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("PULL_PAGE_LIMIT"));
    }

    #[test]
    fn bootstrap_needs_both_values() {
        let err = config_from(&[
            ("DESKLINE_DATABASE_PATH", "server.db"),
            ("AUTH_JWT_SECRET", "0123456789abcdef0123456789abcdef"),
            ("DESKLINE_BOOTSTRAP_ORG_NAME", "Acme Support"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("DESKLINE_BOOTSTRAP_ADMIN_USER_ID"));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = config_from(&[
            ("DESKLINE_DATABASE_PATH", "server.db"),
            ("AUTH_JWT_SECRET", "sensitive-secret-sensitive-secret-42"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
