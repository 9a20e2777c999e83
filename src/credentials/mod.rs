//! Encrypted credential storage for OAuth tokens.
//!
//! This module provides the two leaf components of the custody service:
//! the token cipher (AES-256-GCM) and the SQLite-backed credential store with
//! its append-only audit log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenLifecycleManager              │
//! │  - encrypts before upsert                │
//! │  - decrypts right before use             │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM                           │
//! │  - Unique nonce per token                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (SQLite)           │
//! │  - Ciphertext only, never plaintext      │
//! │  - Atomic upsert on account_id           │
//! │  - Append-only audit_log table           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - The store never sees plaintext tokens; it has no access to the key
//! - Each token has a unique nonce (never reused)
//! - Master key must be 32 bytes (256 bits)
//! - Authenticated encryption (tampering detected)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod encryption;
mod storage;

pub use encryption::{CipherError, TokenCipher, KEY_SIZE};
pub use storage::{CredentialStore, StoreError, UpsertOutcome, DEFAULT_AUDIT_LIMIT, MAX_AUDIT_LIMIT};

/// Token type assumed when the caller or upstream does not name one.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// A credential row exactly as persisted.
///
/// `access_token` and `refresh_token` hold cipher blobs, never plaintext.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredCredential {
    pub account_id: String,
    /// Encrypted access token (base64 blob)
    pub access_token: String,
    /// Encrypted refresh token (base64 blob)
    pub refresh_token: String,
    pub token_type: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredCredential {
    /// True once `now` has passed `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the token is expired or will be within `lead`.
    pub fn is_expiring_within(&self, now: DateTime<Utc>, lead: chrono::Duration) -> bool {
        now >= self.expires_at - lead
    }

    /// Whole seconds left before expiry, zero once expired.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Action tag recorded on every audit entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Refresh,
    Validate,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Refresh => "refresh",
            AuditAction::Validate => "validate",
            AuditAction::Delete => "delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(AuditAction::Create),
            "refresh" => Ok(AuditAction::Refresh),
            "validate" => Ok(AuditAction::Validate),
            "delete" => Ok(AuditAction::Delete),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

/// An audit entry waiting to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub account_id: String,
    pub action: AuditAction,
    pub success: bool,
    /// Failure reason, or the outcome reason for validations
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        account_id: impl Into<String>,
        action: AuditAction,
        success: bool,
        message: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            action,
            success,
            error_message: message,
            created_at: Utc::now(),
        }
    }
}

/// An audit entry as read back from the log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub account_id: String,
    pub action: AuditAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
