use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;

/// Complete custody service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustodyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SQLite location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "custody.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Master key for token encryption (base64, 32 bytes). Required at startup.
#[derive(Clone, Default, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub key: Option<String>,
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Upstream OAuth authorization server
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Token endpoint used for refresh_token grants
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Protected resource probed to validate an access token
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_token_url() -> String {
    "https://auth.tesla.com/oauth2/v3/token".to_string()
}

fn default_probe_url() -> String {
    "https://owner-api.teslamotors.com/api/1/users/me".to_string()
}

fn default_client_id() -> String {
    "ownerapi".to_string()
}

fn default_scope() -> String {
    "openid email offline_access".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            probe_url: default_probe_url(),
            client_id: default_client_id(),
            scope: default_scope(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Refresh and retention policy
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Tokens this close to expiry are refreshed before being handed out
    #[serde(default = "default_refresh_lead_seconds")]
    pub refresh_lead_seconds: i64,
    /// Days past `expires_at` before the sweep deletes a record
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Probe upstream after a successful match-mode comparison
    #[serde(default = "default_probe_on_match")]
    pub probe_on_match: bool,
}

fn default_refresh_lead_seconds() -> i64 {
    300
}

fn default_retention_days() -> i64 {
    7
}

fn default_sweep_interval_seconds() -> u64 {
    3600
}

fn default_probe_on_match() -> bool {
    true
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_lead_seconds: default_refresh_lead_seconds(),
            retention_days: default_retention_days(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            probe_on_match: default_probe_on_match(),
        }
    }
}

/// Audit queue sizing
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Entries buffered before new ones are dropped (and counted)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// API gateway settings
#[derive(Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Static bearer token required on /api routes. None = check disabled.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CustodyConfig {
    /// Loads `CUSTODY_CONFIG` (if set) and applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("CUSTODY_CONFIG") {
            Ok(path) => load_config(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `CUSTODY_*` overrides from `lookup`, falling back to the
    /// current value when a variable is missing or does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CUSTODY_ENCRYPTION_KEY") {
            self.encryption.key = Some(v);
        }
        if let Some(v) = lookup("CUSTODY_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = lookup("CUSTODY_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("CUSTODY_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Some(v) = lookup("CUSTODY_TOKEN_URL") {
            self.upstream.token_url = v;
        }
        if let Some(v) = lookup("CUSTODY_PROBE_URL") {
            self.upstream.probe_url = v;
        }
        if let Some(v) = lookup("CUSTODY_CLIENT_ID") {
            self.upstream.client_id = v;
        }
        if let Some(v) = lookup("CUSTODY_SCOPE") {
            self.upstream.scope = v;
        }
        if let Some(v) = lookup("CUSTODY_UPSTREAM_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.upstream.timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("CUSTODY_API_TOKEN") {
            if !v.is_empty() {
                self.api.auth_token = Some(v);
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<CustodyConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: CustodyConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
