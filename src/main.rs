use anyhow::{Context, Result};
use custody::api::{create_token_router, TokenAppState};
use custody::config::CustodyConfig;
use custody::credentials::{CredentialStore, TokenCipher};
use custody::lifecycle::{run_sweeper, AuditLog, TokenLifecycleManager, UpstreamClient};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "custody=info".into()),
        )
        .init();

    info!("Custody starting...");

    let config = CustodyConfig::load().context("Failed to load configuration")?;

    let encryption_key = config
        .encryption
        .key
        .as_deref()
        .context("CUSTODY_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let cipher =
        TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

    info!(
        bind_addr = %config.server.bind_addr(),
        database_path = %config.storage.database_path,
        token_url = %config.upstream.token_url,
        api_auth = config.api.auth_token.is_some(),
        "Configuration loaded"
    );

    let store = Arc::new(
        CredentialStore::new(&config.storage.database_path)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let upstream =
        UpstreamClient::new(&config.upstream).context("Failed to build upstream HTTP client")?;

    let (audit, audit_handle) = AuditLog::spawn(Arc::clone(&store), config.audit.queue_capacity);

    let manager = Arc::new(TokenLifecycleManager::new(
        store,
        cipher,
        upstream,
        audit,
        &config.lifecycle,
    ));

    let sweeper_handle = tokio::spawn(run_sweeper(
        Arc::clone(&manager),
        config.lifecycle.sweep_interval_seconds,
    ));
    info!(
        interval_seconds = config.lifecycle.sweep_interval_seconds,
        retention_days = config.lifecycle.retention_days,
        "Credential sweeper started"
    );

    let router = create_token_router(TokenAppState {
        manager: Arc::clone(&manager),
        api_token: config.api.auth_token.clone(),
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr()))?;
    info!(addr = %config.server.bind_addr(), "Custody API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutdown signal received");

    sweeper_handle.abort();
    let _ = sweeper_handle.await;
    manager.flush_audit().await;

    // Dropping the last AuditLog handle lets the writer drain and exit
    let stats = manager.audit_stats();
    drop(manager);
    if let Err(e) = audit_handle.await {
        warn!(error = %e, "Audit writer did not exit cleanly");
    }

    info!(
        audit_written = stats.written,
        audit_failed = stats.failed,
        audit_dropped = stats.dropped,
        "Custody stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl_c signal");
        std::future::pending::<()>().await;
    }
}
