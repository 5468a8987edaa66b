//! REST API helpers for communicating with the backend.
//!
//! SYSTEM CONTEXT
//! ==============
//! `ApiClient` resolves the session from `GET /api/auth/get-session` and
//! issues plain JSON reads for query fetch closures. The session token rides
//! in the auth cookie, the same way the browser sends it.
//!
//! ERROR HANDLING
//! ==============
//! A rejected or empty session is not an error: `401`, `403`, and a `null`
//! body all resolve to "no user". Only transport, unexpected status, and
//! parse failures surface as `ApiError`.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::provider::SessionSource;
use crate::query::QueryError;
use crate::session::UserRef;

pub const SESSION_ENDPOINT: &str = "/api/auth/get-session";
pub const SESSION_COOKIE_NAME: &str = "better-auth.session_token";

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("response parse failed: {0}")]
    Parse(String),
    #[error("session token is not a valid header value")]
    InvalidToken,
}

impl From<ApiError> for QueryError {
    fn from(err: ApiError) -> Self {
        QueryError::Fetch(err.to_string())
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    cookie: Option<HeaderValue>,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns an error if the session token cannot be sent as a header or
    /// the HTTP client fails to build.
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        let cookie = config
            .session_token
            .as_deref()
            .map(|token| HeaderValue::from_str(&session_cookie(token)).map_err(|_| ApiError::InvalidToken))
            .transpose()?;
        Ok(Self { http, base_url: config.base_url.clone(), cookie })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn has_session_token(&self) -> bool {
        self.cookie.is_some()
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(url);
        match &self.cookie {
            Some(cookie) => request.header(COOKIE, cookie.clone()),
            None => request,
        }
    }

    /// `GET {base_url}{path}` decoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, non-success status, or an
    /// undecodable body.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, ApiError> {
        let url = endpoint_url(&self.base_url, path);
        let response = self.get(&url).send().await.map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), url });
        }
        let text = response.text().await.map_err(|e| ApiError::Request(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SessionSource for ApiClient {
    async fn fetch_session(&self) -> Result<Option<UserRef>, ApiError> {
        if self.cookie.is_none() {
            debug!("no session token configured; skipping session lookup");
            return Ok(None);
        }
        let url = endpoint_url(&self.base_url, SESSION_ENDPOINT);
        let response = self.get(&url).send().await.map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(status = status.as_u16(), "session rejected");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), url });
        }
        let text = response.text().await.map_err(|e| ApiError::Request(e.to_string()))?;
        parse_session_body(&text)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct SessionEnvelope {
    #[serde(default)]
    user: Option<UserRef>,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Parse a get-session body. `null`, `{}`, and an empty body all mean no user.
fn parse_session_body(body: &str) -> Result<Option<UserRef>, ApiError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let envelope: Option<SessionEnvelope> =
        serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))?;
    Ok(envelope.and_then(|e| e.user))
}

fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE_NAME}={token}")
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') { format!("{base}{path}") } else { format!("{base}/{path}") }
}
