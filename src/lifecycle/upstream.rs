//! Calls to the upstream OAuth authorization server.
//!
//! Two endpoints are used: the token endpoint for `refresh_token` grants and
//! a protected resource that is probed with the access token to see whether
//! upstream still accepts it. Every call is single-shot with the client's
//! fixed timeout; retries are the caller's business.

use crate::config::UpstreamConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upstream call failures. Messages never include token values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream responded with HTTP {status}")]
    Rejected { status: u16 },

    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Decode(String),
}

/// Refresh grant request body
#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
    scope: &'a str,
}

/// Token endpoint response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Tokens issued by a successful refresh.
///
/// Optional fields are `None` when upstream omitted them or sent an empty
/// string; the caller keeps its previous values in that case.
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

/// Result of probing the protected resource with an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Upstream answered 200
    Accepted,
    /// Upstream answered anything else (401 for a revoked token)
    Rejected(u16),
}

/// HTTP client for the upstream authorization server.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    token_url: String,
    probe_url: String,
    client_id: String,
    scope: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            // A zero timeout would fail every request
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;

        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            probe_url: config.probe_url.clone(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
        })
    }

    /// Exchanges a refresh token for a new token set.
    ///
    /// # Errors
    /// * `Rejected` - token endpoint answered anything but 200
    /// * `Unreachable` - DNS, connect, timeout or body read failure
    /// * `Decode` - body is not a usable token response
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, UpstreamError> {
        let body = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token,
            client_id: &self.client_id,
            scope: &self.scope,
        };

        debug!(token_url = %self.token_url, "Requesting token refresh");

        let response = self
            .http
            .post(&self.token_url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("token refresh request failed", e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("failed to read token response", e))?;

        let parsed: TokenResponse = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Decode(format!("invalid token response: {}", e)))?;

        if parsed.access_token.is_empty() {
            return Err(UpstreamError::Decode(
                "token response has an empty access_token".to_string(),
            ));
        }

        debug!(
            has_refresh_token = parsed.refresh_token.is_some(),
            expires_in = parsed.expires_in,
            "Token refresh successful"
        );

        Ok(RefreshedTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
            expires_in: parsed.expires_in,
            token_type: parsed.token_type.filter(|t| !t.is_empty()),
            scope: parsed.scope.filter(|s| !s.is_empty()),
        })
    }

    /// Presents `access_token` to the protected resource.
    pub async fn probe(&self, access_token: &str) -> Result<ProbeOutcome, UpstreamError> {
        let response = self
            .http
            .get(&self.probe_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error("validation probe failed", e))?;

        let status = response.status();
        debug!(status = status.as_u16(), "Validation probe response");

        if status == StatusCode::OK {
            Ok(ProbeOutcome::Accepted)
        } else {
            Ok(ProbeOutcome::Rejected(status.as_u16()))
        }
    }
}

fn transport_error(what: &str, err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Unreachable(format!("{}: timed out", what))
    } else {
        // Drop the URL so query strings never reach logs or callers
        UpstreamError::Unreachable(format!("{}: {}", what, err.without_url()))
    }
}
