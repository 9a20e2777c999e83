// Integration tests for the token custody API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use custody::api::{create_token_router, TokenAppState};
use custody::config::{LifecycleConfig, UpstreamConfig};
use custody::credentials::{CredentialStore, TokenCipher};
use custody::lifecycle::{AuditLog, TokenLifecycleManager, UpstreamClient};
use mockito::{Server, ServerGuard};
use std::sync::Arc;
use tower::ServiceExt;

const TOKEN_PATH: &str = "/oauth2/v3/token";
const PROBE_PATH: &str = "/api/1/users/me";

struct TestApp {
    router: Router,
    manager: Arc<TokenLifecycleManager>,
    server: ServerGuard,
}

async fn create_test_app(api_token: Option<&str>) -> TestApp {
    let server = Server::new_async().await;
    let upstream = UpstreamConfig {
        token_url: format!("{}{}", server.url(), TOKEN_PATH),
        probe_url: format!("{}{}", server.url(), PROBE_PATH),
        timeout_seconds: 5,
        ..UpstreamConfig::default()
    };

    let store = Arc::new(CredentialStore::in_memory().unwrap());
    let cipher = TokenCipher::from_base64_key(&TokenCipher::generate_key()).unwrap();
    let (audit, _handle) = AuditLog::spawn(Arc::clone(&store), 64);
    let manager = Arc::new(TokenLifecycleManager::new(
        store,
        cipher,
        UpstreamClient::new(&upstream).unwrap(),
        audit,
        &LifecycleConfig::default(),
    ));

    let router = create_token_router(TokenAppState {
        manager: Arc::clone(&manager),
        api_token: api_token.map(|t| t.to_string()),
    });

    TestApp {
        router,
        manager,
        server,
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

fn save_body(account_id: &str, expires_in: i64) -> Body {
    Body::from(
        serde_json::json!({
            "account_id": account_id,
            "access_token": "at-old",
            "refresh_token": "rt-old",
            "expires_in": expires_in,
            "scope": "openid offline_access"
        })
        .to_string(),
    )
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn save_token(router: &Router, account_id: &str, expires_in: i64) {
    let (status, _) = send(
        router,
        Request::builder()
            .method("POST")
            .uri("/api/v1/tokens")
            .header("content-type", "application/json")
            .body(save_body(account_id, expires_in))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_audit_counters() {
    let app = create_test_app(Some("gateway-secret")).await;

    // Health bypasses the gateway check
    let (status, json) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "custody");
    assert_eq!(json["audit"]["dropped"], 0);
}

#[tokio::test]
async fn test_save_then_get_token() {
    let app = create_test_app(None).await;
    save_token(&app.router, "acct-1", 3600).await;

    let (status, json) = send(&app.router, get("/api/v1/tokens/acct-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["account_id"], "acct-1");
    assert_eq!(json["access_token"], "at-old");
    assert_eq!(json["token_type"], "Bearer");
}

#[tokio::test]
async fn test_list_tokens_never_includes_token_values() {
    let app = create_test_app(None).await;
    save_token(&app.router, "acct-b", 3600).await;
    save_token(&app.router, "acct-a", 3600).await;

    let (status, json) = send(&app.router, get("/api/v1/tokens")).await;
    assert_eq!(status, StatusCode::OK);

    let tokens = json["tokens"].as_array().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0]["account_id"], "acct-a");
    assert!(tokens[0]["remaining_seconds"].as_i64().unwrap() > 0);

    let raw = json.to_string();
    assert!(!raw.contains("at-old"));
    assert!(!raw.contains("rt-old"));
}

#[tokio::test]
async fn test_save_rejects_bad_bodies() {
    let app = create_test_app(None).await;

    let (status, json) = send(&app.router, post("/api/v1/tokens", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(json["kind"], "invalid_request");

    let empty_account = r#"{"account_id":"","access_token":"a","refresh_token":"r","expires_in":60}"#;
    let (status, _) = send(&app.router, post("/api/v1/tokens", empty_account)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let empty_token = r#"{"account_id":"acct","access_token":"","refresh_token":"r","expires_in":60}"#;
    let (status, json) = send(&app.router, post("/api/v1/tokens", empty_token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_request");

    // The rejected save on a named account leaves a failed create entry
    app.manager.flush_audit().await;
    let (status, json) = send(&app.router, get("/api/v1/tokens/acct/logs")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["action"], "create");
    assert_eq!(entries[0]["success"], false);
}

#[tokio::test]
async fn test_get_missing_token_is_404() {
    let app = create_test_app(None).await;

    let (status, json) = send(&app.router, get("/api/v1/tokens/nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["kind"], "not_found");
}

#[tokio::test]
async fn test_get_expired_token_with_failing_refresh_is_503() {
    let mut app = create_test_app(None).await;
    let token_mock = app
        .server
        .mock("POST", TOKEN_PATH)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    save_token(&app.router, "acct-1", -10).await;

    let (status, json) = send(&app.router, get("/api/v1/tokens/acct-1")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["kind"], "token_unavailable");
    assert!(!json.to_string().contains("at-old"));
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_refresh_endpoint() {
    let mut app = create_test_app(None).await;
    let _token_mock = app
        .server
        .mock("POST", TOKEN_PATH)
        .with_status(200)
        .with_body(r#"{"access_token":"at-new","refresh_token":"rt-new","expires_in":7200}"#)
        .create_async()
        .await;

    save_token(&app.router, "acct-1", 3600).await;

    let (status, json) = send(&app.router, post("/api/v1/tokens/acct-1/refresh", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["remaining_seconds"].as_i64().unwrap() > 3600);
    assert!(json.get("access_token").is_none());

    let (_, json) = send(&app.router, get("/api/v1/tokens/acct-1")).await;
    assert_eq!(json["access_token"], "at-new");
}

#[tokio::test]
async fn test_refresh_upstream_rejection_is_502() {
    let mut app = create_test_app(None).await;
    let _token_mock = app
        .server
        .mock("POST", TOKEN_PATH)
        .with_status(400)
        .create_async()
        .await;

    save_token(&app.router, "acct-1", 3600).await;

    let (status, json) = send(&app.router, post("/api/v1/tokens/acct-1/refresh", "")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["kind"], "upstream_rejected");
}

#[tokio::test]
async fn test_validate_statuses() {
    let mut app = create_test_app(None).await;
    let _probe = app
        .server
        .mock("GET", PROBE_PATH)
        .match_header("authorization", "Bearer at-old")
        .with_status(200)
        .create_async()
        .await;

    save_token(&app.router, "acct-1", 3600).await;

    // Presented token matches and upstream accepts it
    let (status, json) = send(
        &app.router,
        post("/api/v1/tokens/acct-1/validate", r#"{"access_token":"at-old"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["valid"], true);

    // Mismatch
    let (status, json) = send(
        &app.router,
        post("/api/v1/tokens/acct-1/validate", r#"{"access_token":"at-other"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["valid"], false);
    assert_eq!(json["reason"], "token mismatch");

    // No body: the stored token is checked
    let (status, json) = send(&app.router, post("/api/v1/tokens/acct-1/validate", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["refreshed"], false);

    // Unknown account
    let (status, json) = send(&app.router, post("/api/v1/tokens/nobody/validate", "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["reason"], "token not found");
}

#[tokio::test]
async fn test_delete_then_delete_again() {
    let app = create_test_app(None).await;
    save_token(&app.router, "acct-1", 3600).await;

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri("/api/v1/tokens/acct-1")
            .body(Body::empty())
            .unwrap()
    };

    let (status, json) = send(&app.router, delete()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, json) = send(&app.router, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["kind"], "not_found");
}

#[tokio::test]
async fn test_logs_endpoint_newest_first_with_limit() {
    let app = create_test_app(None).await;
    save_token(&app.router, "acct-1", 3600).await;
    send(
        &app.router,
        post("/api/v1/tokens/acct-1/validate", r#"{"access_token":"wrong"}"#),
    )
    .await;
    app.manager.flush_audit().await;

    let (status, json) = send(&app.router, get("/api/v1/tokens/acct-1/logs")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = json["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["action"], "validate");
    assert_eq!(entries[0]["error_message"], "token mismatch");
    assert_eq!(entries[1]["action"], "create");

    let (_, json) = send(&app.router, get("/api/v1/tokens/acct-1/logs?limit=1")).await;
    assert_eq!(json["entries"].as_array().unwrap().len(), 1);

    // Unparseable limit falls back to the default
    let (status, json) = send(&app.router, get("/api/v1/tokens/acct-1/logs?limit=abc")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["entries"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_gateway_token_required_when_configured() {
    let app = create_test_app(Some("gateway-secret")).await;

    let (status, json) = send(&app.router, get("/api/v1/tokens")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["kind"], "unauthorized");

    let wrong = Request::builder()
        .uri("/api/v1/tokens")
        .header("Authorization", bearer("nope"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/api/v1/tokens")
        .header("Authorization", bearer("gateway-secret"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&app.router, right).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["tokens"].as_array().unwrap().is_empty());
}
