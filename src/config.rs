//! Client configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::time::Duration;

use crate::query::{DEFAULT_RETRY, DEFAULT_RETRY_DELAY_MS, DEFAULT_STALE_SECS, QueryConfig};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base URL: {0} (expected http:// or https://)")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Raw session token sent as the session cookie. `None` means anonymous.
    pub session_token: Option<String>,
    pub timeouts: ClientTimeouts,
    pub query: QueryConfig,
}

impl ClientConfig {
    /// Build typed client config from environment variables.
    ///
    /// All optional:
    /// - `AUTHGATE_BASE_URL`: default `http://127.0.0.1:3000`
    /// - `AUTHGATE_SESSION_TOKEN`: session cookie value
    /// - `AUTHGATE_REQUEST_TIMEOUT_SECS`: default 30
    /// - `AUTHGATE_CONNECT_TIMEOUT_SECS`: default 10
    /// - `AUTHGATE_QUERY_STALE_SECS`: default 30
    /// - `AUTHGATE_QUERY_RETRY`: default 3
    /// - `AUTHGATE_QUERY_RETRY_DELAY_MS`: default 1000
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not an http(s) URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injectable variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not an http(s) URL.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = normalize_base_url(lookup("AUTHGATE_BASE_URL").as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let session_token = lookup("AUTHGATE_SESSION_TOKEN").as_deref().and_then(normalize_token);
        let timeouts = ClientTimeouts {
            request_secs: parse_or(&lookup, "AUTHGATE_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: parse_or(&lookup, "AUTHGATE_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        let query = QueryConfig {
            stale_time: Duration::from_secs(parse_or(&lookup, "AUTHGATE_QUERY_STALE_SECS", DEFAULT_STALE_SECS)),
            retry: parse_or(&lookup, "AUTHGATE_QUERY_RETRY", DEFAULT_RETRY),
            retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "AUTHGATE_QUERY_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
        };

        Ok(Self { base_url, session_token, timeouts, query })
    }

    /// Override the base URL, e.g. from a CLI flag.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an http(s) URL.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(base_url)?;
        Ok(self)
    }

    /// Override the session token. Surrounding whitespace is stripped and a
    /// blank token means anonymous.
    #[must_use]
    pub fn with_session_token(mut self, token: &str) -> Self {
        self.session_token = normalize_token(token);
        self
    }
}

fn normalize_token(raw: &str) -> Option<String> {
    let token = raw.trim();
    (!token.is_empty()).then(|| token.to_owned())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_owned())
    } else {
        Err(ConfigError::InvalidBaseUrl(raw.to_owned()))
    }
}
