//! Token custody API endpoints.
//!
//! Thin HTTP layer over [`TokenLifecycleManager`]. Every `/api/v1` route
//! passes through the optional static bearer-token check; `/health` does not.

use crate::auth::authorize_request;
use crate::credentials::AuditRecord;
use crate::lifecycle::{
    AuditStats, CredentialSummary, LifecycleError, SaveCredential, TokenLifecycleManager,
    ValidToken, ValidationOutcome,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};


/// Shared application state for the token API
#[derive(Clone)]
pub struct TokenAppState {
    pub manager: Arc<TokenLifecycleManager>,
    /// Static bearer token required on /api routes (None = check disabled)
    pub api_token: Option<String>,
}

/// Request body for POST /api/v1/tokens
#[derive(Deserialize)]
pub struct SaveTokenRequest {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Optional request body for POST /api/v1/tokens/:account_id/validate
#[derive(Deserialize, Default)]
pub struct ValidateTokenRequest {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Query parameters for GET /api/v1/tokens/:account_id/logs
#[derive(Deserialize)]
pub struct LogsParams {
    /// Max entries (default 100, max 1000); unparseable values use the default
    pub limit: Option<String>,
}

/// Response for GET /api/v1/tokens
#[derive(Serialize)]
pub struct ListTokensResponse {
    pub tokens: Vec<CredentialSummary>,
}

/// Response for GET /api/v1/tokens/:account_id/logs
#[derive(Serialize)]
pub struct ListLogsResponse {
    pub account_id: String,
    pub entries: Vec<AuditRecord>,
}

/// Response for DELETE /api/v1/tokens/:account_id
#[derive(Serialize)]
pub struct DeleteTokenResponse {
    pub success: bool,
}

/// Response for GET /health
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub audit: AuditStats,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    kind: &'static str,
    error: String,
}

/// Create token API router
pub fn create_token_router(state: TokenAppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/v1/tokens", get(list_tokens).post(save_token))
        .route(
            "/api/v1/tokens/:account_id",
            get(get_token).delete(delete_token),
        )
        .route("/api/v1/tokens/:account_id/refresh", post(refresh_token))
        .route("/api/v1/tokens/:account_id/validate", post(validate_token))
        .route("/api/v1/tokens/:account_id/logs", get(list_logs))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_token,
        ))
        .route("/health", get(health))
        .with_state(state)
}

/// Rejects requests without the configured bearer token.
async fn require_api_token(
    State(state): State<Arc<TokenAppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authorize_request(request.headers(), state.api_token.as_deref()).map_err(|e| {
        debug!(error = %e, "API request rejected");
        AppError::Unauthorized(e.to_string())
    })?;

    Ok(next.run(request).await)
}

/// GET /health - Liveness plus audit writer counters
async fn health(State(state): State<Arc<TokenAppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "custody",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        audit: state.manager.audit_stats(),
    })
}

/// GET /api/v1/tokens - Summaries of every stored credential (no tokens)
async fn list_tokens(
    State(state): State<Arc<TokenAppState>>,
) -> Result<Json<ListTokensResponse>, AppError> {
    let tokens = state.manager.list_credentials()?;
    debug!(count = tokens.len(), "Listing credentials");
    Ok(Json(ListTokensResponse { tokens }))
}

/// POST /api/v1/tokens - Save or replace a token pair
async fn save_token(
    State(state): State<Arc<TokenAppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<CredentialSummary>), AppError> {
    let request: SaveTokenRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?;

    if request.account_id.trim().is_empty() {
        return Err(AppError::BadRequest("account_id is required".to_string()));
    }

    let summary = state
        .manager
        .save_or_update(SaveCredential {
            account_id: request.account_id,
            access_token: request.access_token,
            refresh_token: request.refresh_token,
            ttl_seconds: request.expires_in,
            token_type: request.token_type,
            scope: request.scope,
        })
        .await?;

    info!(account_id = %summary.account_id, "Token saved via API");
    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /api/v1/tokens/:account_id - A usable access token, refreshed if stale
async fn get_token(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<ValidToken>, AppError> {
    let token = state.manager.get_valid(&account_id).await?;
    Ok(Json(token))
}

/// DELETE /api/v1/tokens/:account_id
async fn delete_token(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<DeleteTokenResponse>, AppError> {
    state.manager.delete(&account_id).await?;
    Ok(Json(DeleteTokenResponse { success: true }))
}

/// POST /api/v1/tokens/:account_id/refresh - Force a refresh grant
async fn refresh_token(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
) -> Result<Json<CredentialSummary>, AppError> {
    let summary = state.manager.refresh(&account_id).await?;
    Ok(Json(summary))
}

/// POST /api/v1/tokens/:account_id/validate
///
/// With `{"access_token": ...}` the presented token is checked against the
/// stored one; with no body the stored token itself is checked. Answers 200
/// when valid and 401 when not, with the outcome as body either way.
async fn validate_token(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ValidationOutcome>), AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ValidateTokenRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))?
    };

    let presented = request.access_token.as_deref().filter(|t| !t.is_empty());
    let outcome = state.manager.validate(&account_id, presented).await?;

    let status = if outcome.valid {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    };
    Ok((status, Json(outcome)))
}

/// GET /api/v1/tokens/:account_id/logs?limit=N - Audit entries, newest first
async fn list_logs(
    State(state): State<Arc<TokenAppState>>,
    Path(account_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<ListLogsResponse>, AppError> {
    let limit = parse_limit(params.limit.as_deref());
    let entries = state.manager.list_audit_log(&account_id, limit)?;
    Ok(Json(ListLogsResponse {
        account_id,
        entries,
    }))
}

/// Non-numeric or missing limits fall back to the store default.
fn parse_limit(raw: Option<&str>) -> i64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(0)
}

/// Application error types
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    BadRequest(String),
    Lifecycle(LifecycleError),
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        AppError::Lifecycle(err)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Lifecycle(err) => match err {
                LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                LifecycleError::UpstreamRejected { .. }
                | LifecycleError::UpstreamUnreachable(_)
                | LifecycleError::Decode(_) => StatusCode::BAD_GATEWAY,
                LifecycleError::TokenUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                LifecycleError::Persistence(_) | LifecycleError::Encryption(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "invalid_request",
            AppError::Lifecycle(err) => err.kind(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        let message = match self {
            AppError::Unauthorized(msg) | AppError::BadRequest(msg) => msg,
            AppError::Lifecycle(err) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                error!(kind = kind, error = %err, "Internal error handling token request");
                "Internal server error".to_string()
            }
            AppError::Lifecycle(err) => {
                if status.is_server_error() {
                    warn!(kind = kind, error = %err, "Upstream error handling token request");
                }
                err.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                success: false,
                kind,
                error: message,
            }),
        )
            .into_response()
    }
}
