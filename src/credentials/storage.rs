//! Credential persistence using SQLite.
//!
//! Stores one credential row per account plus an append-only audit log.
//! Token columns only ever receive cipher blobs; encryption happens in the
//! lifecycle manager before a record reaches this module.

use super::{AuditAction, AuditEntry, AuditRecord, StoredCredential};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Rows returned by `list_audit` when the caller passes a non-positive limit.
pub const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Upper bound on rows returned by a single `list_audit` call.
pub const MAX_AUDIT_LIMIT: usize = 1000;

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no credential stored for account '{0}'")]
    NotFound(String),

    #[error("{context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

/// Attaches operation context to a SQLite error.
trait PersistenceContext<T> {
    fn context(self, context: &'static str) -> Result<T, StoreError>;
}

impl<T> PersistenceContext<T> for Result<T, rusqlite::Error> {
    fn context(self, context: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Persistence { context, source })
    }
}

/// Whether an upsert created the row or overwrote an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     account_id TEXT NOT NULL UNIQUE,
///     access_token TEXT NOT NULL,       -- cipher blob
///     refresh_token TEXT NOT NULL,      -- cipher blob
///     token_type TEXT NOT NULL,
///     scope TEXT,
///     expires_at TEXT NOT NULL,         -- RFC 3339, UTC, microseconds
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
///
/// CREATE TABLE audit_log (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     account_id TEXT NOT NULL,
///     action TEXT NOT NULL,             -- create | refresh | validate | delete
///     success INTEGER NOT NULL,
///     error_message TEXT,
///     created_at TEXT NOT NULL
/// );
/// ```
///
/// Timestamps are written with a fixed width so that SQL string comparison
/// orders them chronologically.
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Upsert runs as one statement inside an immediate transaction
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                account_id TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_type TEXT NOT NULL DEFAULT 'Bearer',
                scope TEXT,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_expires_at
                ON credentials(expires_at);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                action TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_account_created
                ON audit_log(account_id, created_at);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts the record, or overwrites the existing one for its account.
    ///
    /// `created_at` is kept from the existing row on overwrite.
    pub fn upsert(&self, record: &StoredCredential) -> Result<UpsertOutcome, StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin upsert transaction")?;

        let existed: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM credentials WHERE account_id = ?1)",
                params![record.account_id],
                |row| row.get(0),
            )
            .context("Failed to check existing credential")?;

        tx.execute(
            r#"
            INSERT INTO credentials (
                account_id, access_token, refresh_token,
                token_type, scope, expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                record.account_id,
                record.access_token,
                record.refresh_token,
                record.token_type,
                record.scope,
                format_timestamp(record.expires_at),
                format_timestamp(record.created_at),
                format_timestamp(record.updated_at),
            ],
        )
        .context("Failed to store credential")?;

        tx.commit().context("Failed to commit upsert")?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Retrieves the credential for an account.
    pub fn get(&self, account_id: &str) -> Result<StoredCredential, StoreError> {
        self.conn()
            .query_row(
                r#"
                SELECT account_id, access_token, refresh_token, token_type,
                       scope, expires_at, created_at, updated_at
                FROM credentials
                WHERE account_id = ?1
                "#,
                params![account_id],
                credential_from_row,
            )
            .optional()
            .context("Failed to load credential")?
            .ok_or_else(|| StoreError::NotFound(account_id.to_string()))
    }

    /// Deletes the credential for an account.
    ///
    /// Returns `NotFound` when no row was affected.
    pub fn delete(&self, account_id: &str) -> Result<(), StoreError> {
        let rows_affected = self
            .conn()
            .execute(
                "DELETE FROM credentials WHERE account_id = ?1",
                params![account_id],
            )
            .context("Failed to delete credential")?;

        if rows_affected == 0 {
            return Err(StoreError::NotFound(account_id.to_string()));
        }
        Ok(())
    }

    /// Lists every stored credential ordered by account id.
    pub fn list_all(&self) -> Result<Vec<StoredCredential>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT account_id, access_token, refresh_token, token_type,
                       scope, expires_at, created_at, updated_at
                FROM credentials
                ORDER BY account_id
                "#,
            )
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map([], credential_from_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(records)
    }

    /// Deletes every credential whose `expires_at` precedes `older_than`.
    ///
    /// Returns the number of rows removed.
    pub fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        self.conn()
            .execute(
                "DELETE FROM credentials WHERE expires_at < ?1",
                params![format_timestamp(older_than)],
            )
            .context("Failed to purge expired credentials")
    }

    /// Appends an entry to the audit log.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                r#"
                INSERT INTO audit_log (account_id, action, success, error_message, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    entry.account_id,
                    entry.action.as_str(),
                    entry.success,
                    entry.error_message,
                    format_timestamp(entry.created_at),
                ],
            )
            .context("Failed to append audit entry")?;
        Ok(())
    }

    /// Lists audit entries for an account, newest first.
    ///
    /// `limit <= 0` falls back to [`DEFAULT_AUDIT_LIMIT`]; larger values are
    /// clamped to [`MAX_AUDIT_LIMIT`].
    pub fn list_audit(&self, account_id: &str, limit: i64) -> Result<Vec<AuditRecord>, StoreError> {
        let limit = effective_audit_limit(limit);

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, account_id, action, success, error_message, created_at
                FROM audit_log
                WHERE account_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
                "#,
            )
            .context("Failed to prepare query")?;

        let entries = stmt
            .query_map(params![account_id, limit as i64], |row| {
                let action: String = row.get(2)?;
                let action = action.parse::<AuditAction>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
                })?;
                Ok(AuditRecord {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    action,
                    success: row.get(3)?,
                    error_message: row.get(4)?,
                    created_at: timestamp_column(row, 5)?,
                })
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(entries)
    }
}

fn effective_audit_limit(limit: i64) -> usize {
    if limit <= 0 {
        DEFAULT_AUDIT_LIMIT
    } else {
        (limit as u64).min(MAX_AUDIT_LIMIT as u64) as usize
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCredential> {
    Ok(StoredCredential {
        account_id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        token_type: row.get(3)?,
        scope: row.get(4)?,
        expires_at: timestamp_column(row, 5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::DEFAULT_TOKEN_TYPE;
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        CredentialStore::in_memory().expect("Failed to create test store")
    }

    fn create_test_record(account_id: &str, expires_at: DateTime<Utc>) -> StoredCredential {
        let now = Utc::now();
        StoredCredential {
            account_id: account_id.to_string(),
            access_token: "enc-access".to_string(),
            refresh_token: "enc-refresh".to_string(),
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
            scope: Some("openid".to_string()),
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();
        let record = create_test_record("acct-1", Utc::now() + Duration::hours(1));

        let outcome = store.upsert(&record).expect("Failed to store");
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let retrieved = store.get("acct-1").expect("Failed to get");
        assert_eq!(retrieved.access_token, "enc-access");
        assert_eq!(retrieved.refresh_token, "enc-refresh");
        assert_eq!(retrieved.scope.as_deref(), Some("openid"));
        assert_eq!(
            retrieved.expires_at.timestamp_micros(),
            record.expires_at.timestamp_micros()
        );
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(matches!(store.get("nobody"), Err(StoreError::NotFound(id)) if id == "nobody"));
    }

    #[test]
    fn test_upsert_overwrites_single_row() {
        let store = create_test_store();
        let first = create_test_record("acct-1", Utc::now() + Duration::hours(1));
        store.upsert(&first).unwrap();

        let mut second = create_test_record("acct-1", Utc::now() + Duration::hours(2));
        second.access_token = "enc-access-2".to_string();
        second.scope = None;
        second.created_at = Utc::now() + Duration::days(1);

        assert_eq!(store.upsert(&second).unwrap(), UpsertOutcome::Updated);

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].access_token, "enc-access-2");
        assert!(all[0].scope.is_none());
        // created_at survives the overwrite
        assert_eq!(
            all[0].created_at.timestamp_micros(),
            first.created_at.timestamp_micros()
        );
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store
            .upsert(&create_test_record("acct-1", Utc::now()))
            .unwrap();

        store.delete("acct-1").expect("first delete succeeds");
        assert!(matches!(store.get("acct-1"), Err(StoreError::NotFound(_))));

        // Deleting again reports NotFound
        assert!(matches!(store.delete("acct-1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_all_ordered() {
        let store = create_test_store();
        for id in ["charlie", "alpha", "bravo"] {
            store.upsert(&create_test_record(id, Utc::now())).unwrap();
        }

        let ids: Vec<String> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| r.account_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn test_purge_expired_respects_cutoff() {
        let store = create_test_store();
        let now = Utc::now();
        store
            .upsert(&create_test_record("ancient", now - Duration::days(30)))
            .unwrap();
        store
            .upsert(&create_test_record("recent", now - Duration::days(2)))
            .unwrap();
        store
            .upsert(&create_test_record("live", now + Duration::hours(1)))
            .unwrap();

        let removed = store.purge_expired(now - Duration::days(7)).unwrap();
        assert_eq!(removed, 1);

        assert!(matches!(store.get("ancient"), Err(StoreError::NotFound(_))));
        assert!(store.get("recent").is_ok());
        assert!(store.get("live").is_ok());
    }

    #[test]
    fn test_audit_newest_first_and_scoped() {
        let store = create_test_store();
        let base = Utc::now();

        for (i, action) in [AuditAction::Create, AuditAction::Refresh, AuditAction::Validate]
            .into_iter()
            .enumerate()
        {
            let mut entry = AuditEntry::new("acct-1", action, true, None);
            entry.created_at = base + Duration::seconds(i as i64);
            store.append_audit(&entry).unwrap();
        }
        store
            .append_audit(&AuditEntry::new(
                "acct-2",
                AuditAction::Delete,
                false,
                Some("Token not found".to_string()),
            ))
            .unwrap();

        let entries = store.list_audit("acct-1", 0).unwrap();
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Validate, AuditAction::Refresh, AuditAction::Create]
        );

        let other = store.list_audit("acct-2", 10).unwrap();
        assert_eq!(other.len(), 1);
        assert!(!other[0].success);
        assert_eq!(other[0].error_message.as_deref(), Some("Token not found"));
    }

    #[test]
    fn test_audit_limit_bounds() {
        let store = create_test_store();
        for _ in 0..(DEFAULT_AUDIT_LIMIT + 5) {
            store
                .append_audit(&AuditEntry::new("acct-1", AuditAction::Validate, true, None))
                .unwrap();
        }

        assert_eq!(store.list_audit("acct-1", 3).unwrap().len(), 3);
        assert_eq!(store.list_audit("acct-1", 0).unwrap().len(), DEFAULT_AUDIT_LIMIT);
        assert_eq!(store.list_audit("acct-1", -4).unwrap().len(), DEFAULT_AUDIT_LIMIT);
    }

    #[test]
    fn test_effective_audit_limit() {
        assert_eq!(effective_audit_limit(0), DEFAULT_AUDIT_LIMIT);
        assert_eq!(effective_audit_limit(-1), DEFAULT_AUDIT_LIMIT);
        assert_eq!(effective_audit_limit(25), 25);
        assert_eq!(effective_audit_limit(i64::MAX), MAX_AUDIT_LIMIT);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.db");

        {
            let store = CredentialStore::new(&path).unwrap();
            store
                .upsert(&create_test_record("acct-1", Utc::now()))
                .unwrap();
        }

        let reopened = CredentialStore::new(&path).unwrap();
        assert_eq!(reopened.get("acct-1").unwrap().access_token, "enc-access");
    }
}
