//! Token lifecycle orchestration.
//!
//! [`TokenLifecycleManager`] is the only component that sees plaintext
//! tokens. It decides when a stored token is stale, drives refresh grants
//! against the upstream authorization server, validates tokens against a
//! protected upstream resource, and records every operation in the audit
//! log.
//!
//! # Flow
//!
//! ```text
//! caller ──► TokenLifecycleManager ──► RefreshLocks (per account)
//!                 │        │
//!                 │        └──► UpstreamClient (refresh / probe)
//!                 ▼
//!            TokenCipher ◄──► CredentialStore ◄── AuditLog worker
//! ```

mod audit;
mod refresh_lock;
mod upstream;


pub use audit::{AuditLog, AuditStats};
pub use refresh_lock::{AccountGuard, RefreshLocks};
pub use upstream::{ProbeOutcome, RefreshedTokens, UpstreamClient, UpstreamError};

use crate::config::LifecycleConfig;
use crate::credentials::{
    AuditAction, AuditEntry, AuditRecord, CipherError, CredentialStore, StoreError,
    StoredCredential, TokenCipher, UpsertOutcome, DEFAULT_TOKEN_TYPE,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest accepted refresh lead time (one day).
const MAX_REFRESH_LEAD_SECONDS: i64 = 86_400;

/// Longest accepted retention window (ten years).
const MAX_RETENTION_DAYS: i64 = 3_650;

/// Largest `expires_in` magnitude accepted from callers or upstream (100 years).
const MAX_TTL_SECONDS: i64 = 100 * 365 * 86_400;

/// Lifecycle operation failures. Messages never include token values.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no credential stored for account '{0}'")]
    NotFound(String),

    #[error("persistence failure: {0}")]
    Persistence(#[source] StoreError),

    #[error("encryption failure: {0}")]
    Encryption(#[from] CipherError),

    #[error("upstream rejected the request with HTTP {status}")]
    UpstreamRejected { status: u16 },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LifecycleError {
    /// Stable snake_case tag for API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Persistence(_) => "persistence_failure",
            LifecycleError::Encryption(_) => "encryption_failure",
            LifecycleError::UpstreamRejected { .. } => "upstream_rejected",
            LifecycleError::UpstreamUnreachable(_) => "upstream_unreachable",
            LifecycleError::TokenUnavailable(_) => "token_unavailable",
            LifecycleError::Decode(_) => "decode_failure",
            LifecycleError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// True for failures caused by the upstream server or the network.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            LifecycleError::UpstreamRejected { .. }
                | LifecycleError::UpstreamUnreachable(_)
                | LifecycleError::Decode(_)
        )
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(account_id) => LifecycleError::NotFound(account_id),
            other => LifecycleError::Persistence(other),
        }
    }
}

impl From<UpstreamError> for LifecycleError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Rejected { status } => LifecycleError::UpstreamRejected { status },
            UpstreamError::Unreachable(msg) => LifecycleError::UpstreamUnreachable(msg),
            UpstreamError::Decode(msg) => LifecycleError::Decode(msg),
        }
    }
}

/// Input for [`TokenLifecycleManager::save_or_update`].
pub struct SaveCredential {
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds from now until the access token expires
    pub ttl_seconds: i64,
    /// Defaults to `Bearer` when absent or empty
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

/// Token-free view of a stored credential.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CredentialSummary {
    pub account_id: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Zero once expired
    pub remaining_seconds: i64,
}

impl CredentialSummary {
    fn from_record(record: &StoredCredential, now: DateTime<Utc>) -> Self {
        Self {
            account_id: record.account_id.clone(),
            token_type: record.token_type.clone(),
            scope: record.scope.clone(),
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
            remaining_seconds: record.remaining_seconds_at(now),
        }
    }
}

/// A usable access token, decrypted for the caller.
#[derive(Clone, Serialize)]
pub struct ValidToken {
    pub account_id: String,
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ValidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidToken")
            .field("account_id", &self.account_id)
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of [`TokenLifecycleManager::validate`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_seconds: i64,
    /// True when this call refreshed the stored token
    pub refreshed: bool,
}

impl ValidationOutcome {
    fn new(
        account_id: &str,
        record: Option<&StoredCredential>,
        valid: bool,
        reason: impl Into<String>,
        refreshed: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            valid,
            reason: reason.into(),
            account_id: account_id.to_string(),
            expires_at: record.map(|r| r.expires_at),
            remaining_seconds: record.map(|r| r.remaining_seconds_at(now)).unwrap_or(0),
            refreshed,
        }
    }
}

/// Orchestrates storage, encryption, refresh and validation of tokens.
///
/// Shared behind an `Arc`; every method takes `&self`.
pub struct TokenLifecycleManager {
    store: Arc<CredentialStore>,
    cipher: TokenCipher,
    upstream: UpstreamClient,
    audit: AuditLog,
    locks: RefreshLocks,
    refresh_lead: Duration,
    retention: Duration,
    probe_on_match: bool,
}

impl TokenLifecycleManager {
    pub fn new(
        store: Arc<CredentialStore>,
        cipher: TokenCipher,
        upstream: UpstreamClient,
        audit: AuditLog,
        config: &LifecycleConfig,
    ) -> Self {
        let lead_seconds = config.refresh_lead_seconds.clamp(0, MAX_REFRESH_LEAD_SECONDS);
        let retention_days = config.retention_days.clamp(0, MAX_RETENTION_DAYS);

        Self {
            store,
            cipher,
            upstream,
            audit,
            locks: RefreshLocks::new(),
            refresh_lead: Duration::seconds(lead_seconds),
            retention: Duration::days(retention_days),
            probe_on_match: config.probe_on_match,
        }
    }

    /// Encrypts and stores a token pair, replacing any existing one.
    ///
    /// Writes one `create` audit entry whether the row was inserted or
    /// overwritten, and one failed `create` entry when the save fails.
    pub async fn save_or_update(
        &self,
        request: SaveCredential,
    ) -> Result<CredentialSummary, LifecycleError> {
        if request.account_id.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "account_id must not be empty".to_string(),
            ));
        }

        let account_id = request.account_id.clone();
        let _guard = self.locks.acquire(&account_id).await;

        let result = self.store_credential(request);
        self.record_audit(&account_id, AuditAction::Create, &result);

        match result {
            Ok((record, outcome)) => {
                info!(
                    account_id = %account_id,
                    outcome = ?outcome,
                    expires_at = %record.expires_at,
                    "Credential saved"
                );
                Ok(CredentialSummary::from_record(&record, Utc::now()))
            }
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "Failed to save credential");
                Err(e)
            }
        }
    }

    fn store_credential(
        &self,
        request: SaveCredential,
    ) -> Result<(StoredCredential, UpsertOutcome), LifecycleError> {
        if request.access_token.is_empty() || request.refresh_token.is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "access_token and refresh_token must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = expiry_after(now, request.ttl_seconds).ok_or_else(|| {
            LifecycleError::InvalidRequest(format!(
                "expires_in {} is out of range",
                request.ttl_seconds
            ))
        })?;

        let token_type = request
            .token_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        let record = StoredCredential {
            account_id: request.account_id,
            access_token: self.cipher.encrypt(&request.access_token)?,
            refresh_token: self.cipher.encrypt(&request.refresh_token)?,
            token_type,
            scope: request.scope.filter(|s| !s.is_empty()),
            expires_at,
            created_at: now,
            updated_at: now,
        };

        let outcome = self.store.upsert(&record)?;

        // Read back so an overwrite reports the original created_at
        let stored = self.store.get(&record.account_id)?;
        Ok((stored, outcome))
    }

    /// Returns a decrypted access token that is not about to expire.
    ///
    /// A token inside the refresh lead time is refreshed first. If that
    /// refresh fails the call fails with `TokenUnavailable`; a stale token
    /// is never returned.
    pub async fn get_valid(&self, account_id: &str) -> Result<ValidToken, LifecycleError> {
        let now = Utc::now();
        let mut record = self.store.get(account_id)?;

        if record.is_expiring_within(now, self.refresh_lead) {
            debug!(account_id = %account_id, "Token inside refresh lead time");
            let lead = self.refresh_lead;
            match self
                .renew_if(account_id, |current| {
                    current.is_expiring_within(Utc::now(), lead)
                })
                .await
            {
                Ok((current, _)) => record = current,
                Err(LifecycleError::NotFound(id)) => return Err(LifecycleError::NotFound(id)),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "Token refresh failed, no usable token");
                    return Err(LifecycleError::TokenUnavailable(e.to_string()));
                }
            }
        }

        let access_token = self.cipher.decrypt(&record.access_token)?;

        Ok(ValidToken {
            account_id: record.account_id,
            access_token,
            token_type: record.token_type,
            scope: record.scope,
            expires_at: record.expires_at,
        })
    }

    /// Checks whether a token is usable.
    ///
    /// With `presented` set, the presented token must equal the stored one
    /// (no upstream call on mismatch), must not be expired, and is then
    /// probed upstream when `probe_on_match` is enabled. Without it, the
    /// stored token is judged: an expired token is refreshed once, then
    /// probed; a rejected probe triggers at most one refresh and one
    /// re-probe.
    ///
    /// Writes exactly one `validate` audit entry per call.
    pub async fn validate(
        &self,
        account_id: &str,
        presented: Option<&str>,
    ) -> Result<ValidationOutcome, LifecycleError> {
        let result = self.evaluate(account_id, presented).await;

        let entry = match &result {
            Ok(outcome) => AuditEntry::new(
                account_id,
                AuditAction::Validate,
                outcome.valid,
                Some(outcome.reason.clone()),
            ),
            Err(e) => AuditEntry::new(account_id, AuditAction::Validate, false, Some(e.to_string())),
        };
        self.audit.record(entry);

        match &result {
            Ok(outcome) => debug!(
                account_id = %account_id,
                valid = outcome.valid,
                reason = %outcome.reason,
                "Token validated"
            ),
            Err(e) => warn!(account_id = %account_id, error = %e, "Token validation failed"),
        }

        result
    }

    async fn evaluate(
        &self,
        account_id: &str,
        presented: Option<&str>,
    ) -> Result<ValidationOutcome, LifecycleError> {
        let record = match self.store.get(account_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Ok(ValidationOutcome::new(
                    account_id,
                    None,
                    false,
                    "token not found",
                    false,
                ))
            }
            Err(e) => return Err(e.into()),
        };

        match presented {
            Some(token) => self.validate_presented(record, token).await,
            None => self.validate_stored(record).await,
        }
    }

    async fn validate_presented(
        &self,
        record: StoredCredential,
        presented: &str,
    ) -> Result<ValidationOutcome, LifecycleError> {
        let account_id = record.account_id.as_str();
        let stored = self.cipher.decrypt(&record.access_token)?;

        if !bool::from(stored.as_bytes().ct_eq(presented.as_bytes())) {
            return Ok(ValidationOutcome::new(account_id, Some(&record), false, "token mismatch", false));
        }

        if record.is_expired_at(Utc::now()) {
            return Ok(ValidationOutcome::new(account_id, Some(&record), false, "token expired", false));
        }

        if !self.probe_on_match {
            return Ok(ValidationOutcome::new(account_id, Some(&record), true, "token valid", false));
        }

        let (valid, reason) = probe_verdict(self.upstream.probe(&stored).await, "token valid");
        Ok(ValidationOutcome::new(account_id, Some(&record), valid, reason, false))
    }

    async fn validate_stored(
        &self,
        record: StoredCredential,
    ) -> Result<ValidationOutcome, LifecycleError> {
        let account_id = record.account_id.clone();
        let mut record = record;
        let mut refreshed = false;

        if record.is_expired_at(Utc::now()) {
            match self
                .renew_if(&account_id, |current| current.is_expired_at(Utc::now()))
                .await
            {
                Ok((current, renewed)) => {
                    record = current;
                    refreshed = renewed;
                }
                Err(e) => return invalid_after_refresh(&account_id, Some(&record), "token expired", e),
            }
        }

        let access_token = self.cipher.decrypt(&record.access_token)?;
        let status = match self.upstream.probe(&access_token).await {
            Ok(ProbeOutcome::Accepted) => {
                let reason = if refreshed { "token valid after refresh" } else { "token valid" };
                return Ok(ValidationOutcome::new(&account_id, Some(&record), true, reason, refreshed));
            }
            Ok(ProbeOutcome::Rejected(status)) => status,
            Err(e) => {
                return Ok(ValidationOutcome::new(
                    &account_id,
                    Some(&record),
                    false,
                    format!("upstream probe failed: {}", e),
                    refreshed,
                ))
            }
        };

        if refreshed {
            return Ok(ValidationOutcome::new(
                &account_id,
                Some(&record),
                false,
                format!("upstream rejected token after refresh (HTTP {})", status),
                true,
            ));
        }

        debug!(account_id = %account_id, status = status, "Probe rejected token, refreshing once");

        // Another caller may have renewed the token while this one waited
        let rejected_blob = record.access_token.clone();
        let (current, renewed) = match self
            .renew_if(&account_id, |current| current.access_token == rejected_blob)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let context = format!("upstream rejected token (HTTP {})", status);
                return invalid_after_refresh(&account_id, Some(&record), &context, e);
            }
        };

        let access_token = self.cipher.decrypt(&current.access_token)?;
        let (valid, reason) =
            probe_verdict(self.upstream.probe(&access_token).await, "token valid after refresh");
        Ok(ValidationOutcome::new(&account_id, Some(&current), valid, reason, renewed))
    }

    /// Refreshes the stored token pair through the upstream token endpoint.
    ///
    /// Writes exactly one `refresh` audit entry, including on `NotFound`.
    pub async fn refresh(&self, account_id: &str) -> Result<CredentialSummary, LifecycleError> {
        let _guard = self.locks.acquire(account_id).await;
        let record = self.refresh_locked(account_id).await?;
        Ok(CredentialSummary::from_record(&record, Utc::now()))
    }

    /// Re-reads the record under the account lock and refreshes it only if
    /// `stale` still holds. Returns the current record and whether it was
    /// refreshed.
    async fn renew_if<F>(
        &self,
        account_id: &str,
        stale: F,
    ) -> Result<(StoredCredential, bool), LifecycleError>
    where
        F: Fn(&StoredCredential) -> bool,
    {
        let _guard = self.locks.acquire(account_id).await;

        let current = self.store.get(account_id)?;
        if !stale(&current) {
            debug!(account_id = %account_id, "Token already renewed by another caller");
            return Ok((current, false));
        }

        let renewed = self.refresh_locked(account_id).await?;
        Ok((renewed, true))
    }

    /// Caller must hold the account lock.
    async fn refresh_locked(&self, account_id: &str) -> Result<StoredCredential, LifecycleError> {
        let result = self.perform_refresh(account_id).await;
        self.record_audit(account_id, AuditAction::Refresh, &result);

        match &result {
            Ok(record) => info!(
                account_id = %account_id,
                expires_at = %record.expires_at,
                "Token refreshed"
            ),
            Err(e) => warn!(
                account_id = %account_id,
                kind = e.kind(),
                error = %e,
                "Token refresh failed"
            ),
        }

        result
    }

    async fn perform_refresh(&self, account_id: &str) -> Result<StoredCredential, LifecycleError> {
        let current = self.store.get(account_id)?;
        let refresh_token = self.cipher.decrypt(&current.refresh_token)?;

        let tokens = self.upstream.refresh(&refresh_token).await?;

        let now = Utc::now();
        let expires_at = expiry_after(now, tokens.expires_in).ok_or_else(|| {
            LifecycleError::Decode(format!("expires_in {} is out of range", tokens.expires_in))
        })?;

        // Upstream may omit the refresh token; the old one stays valid then
        let refresh_blob = match tokens.refresh_token {
            Some(new_refresh) => self.cipher.encrypt(&new_refresh)?,
            None => current.refresh_token.clone(),
        };

        let updated = StoredCredential {
            account_id: current.account_id.clone(),
            access_token: self.cipher.encrypt(&tokens.access_token)?,
            refresh_token: refresh_blob,
            token_type: tokens.token_type.unwrap_or(current.token_type),
            scope: tokens.scope.or(current.scope),
            expires_at,
            created_at: current.created_at,
            updated_at: now,
        };

        self.store.upsert(&updated)?;
        Ok(updated)
    }

    /// Physically removes the credential for an account.
    pub async fn delete(&self, account_id: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(account_id).await;

        let result = self.store.delete(account_id).map_err(LifecycleError::from);
        self.record_audit(account_id, AuditAction::Delete, &result);

        match &result {
            Ok(()) => info!(account_id = %account_id, "Credential deleted"),
            Err(e) => debug!(account_id = %account_id, error = %e, "Credential delete failed"),
        }
        result
    }

    /// Purges credentials expired for longer than the retention window.
    pub fn sweep(&self) -> Result<usize, LifecycleError> {
        let cutoff = Utc::now() - self.retention;
        let removed = self.store.purge_expired(cutoff)?;
        info!(removed = removed, cutoff = %cutoff, "Expired credentials swept");
        Ok(removed)
    }

    /// Audit entries for an account, newest first.
    pub fn list_audit_log(
        &self,
        account_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditRecord>, LifecycleError> {
        Ok(self.store.list_audit(account_id, limit)?)
    }

    /// Summaries of every stored credential.
    pub fn list_credentials(&self) -> Result<Vec<CredentialSummary>, LifecycleError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_all()?
            .iter()
            .map(|record| CredentialSummary::from_record(record, now))
            .collect())
    }

    pub fn audit_stats(&self) -> AuditStats {
        self.audit.stats()
    }

    /// Waits until every audit entry queued so far has been written.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    fn record_audit<T>(&self, account_id: &str, action: AuditAction, result: &Result<T, LifecycleError>) {
        let entry = match result {
            Ok(_) => AuditEntry::new(account_id, action, true, None),
            Err(e) => AuditEntry::new(account_id, action, false, Some(e.to_string())),
        };
        self.audit.record(entry);
    }
}

/// `now + seconds`, or `None` when `seconds` exceeds [`MAX_TTL_SECONDS`]
/// in either direction.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    if !(-MAX_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&seconds) {
        return None;
    }
    Duration::try_seconds(seconds).and_then(|ttl| now.checked_add_signed(ttl))
}

fn probe_verdict(probe: Result<ProbeOutcome, UpstreamError>, valid_reason: &str) -> (bool, String) {
    match probe {
        Ok(ProbeOutcome::Accepted) => (true, valid_reason.to_string()),
        Ok(ProbeOutcome::Rejected(status)) => {
            (false, format!("upstream rejected token (HTTP {})", status))
        }
        Err(e) => (false, format!("upstream probe failed: {}", e)),
    }
}

/// Maps a failed refresh during validation to an invalid outcome. Store and
/// cipher failures are not a verdict on the token and propagate instead.
fn invalid_after_refresh(
    account_id: &str,
    record: Option<&StoredCredential>,
    context: &str,
    err: LifecycleError,
) -> Result<ValidationOutcome, LifecycleError> {
    match err {
        LifecycleError::NotFound(_) => Ok(ValidationOutcome::new(
            account_id,
            None,
            false,
            "token not found",
            false,
        )),
        e if e.is_upstream() => Ok(ValidationOutcome::new(
            account_id,
            record,
            false,
            format!("{} and refresh failed: {}", context, e),
            false,
        )),
        e => Err(e),
    }
}

/// Background task that periodically runs [`TokenLifecycleManager::sweep`].
pub async fn run_sweeper(manager: Arc<TokenLifecycleManager>, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        if let Err(e) = manager.sweep() {
            warn!(error = %e, "Credential sweep failed");
        }
    }
}
