//! Asynchronous audit log writer.
//!
//! Operations hand entries to a bounded queue and return immediately; one
//! worker task drains the queue into the credential store. Nothing is lost
//! silently: a full queue or a failed insert is logged at warn level and
//! counted, and the counters are exposed through [`AuditLog::stats`].

use crate::credentials::{AuditEntry, CredentialStore};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum AuditCommand {
    Record(AuditEntry),
    /// Acknowledged once every earlier command has been processed
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct AuditCounters {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of audit writer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Entries persisted
    pub written: u64,
    /// Entries the store refused
    pub failed: u64,
    /// Entries discarded because the queue was full or closed
    pub dropped: u64,
}

/// Handle to the audit queue. Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditCommand>,
    counters: Arc<AuditCounters>,
}

impl AuditLog {
    /// Starts the writer task. Must be called from inside a Tokio runtime.
    ///
    /// The task ends once every `AuditLog` handle has been dropped and the
    /// queue is drained.
    pub fn spawn(store: Arc<CredentialStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(AuditCounters::default());

        let handle = tokio::spawn(run_audit_writer(store, rx, Arc::clone(&counters)));

        (Self { tx, counters }, handle)
    }

    /// Queues an entry without waiting.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.tx.try_send(AuditCommand::Record(entry)) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match &err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            if let AuditCommand::Record(entry) = err.into_inner() {
                warn!(
                    account_id = %entry.account_id,
                    action = %entry.action,
                    reason = reason,
                    "Dropped audit entry"
                );
            }
        }
    }

    /// Waits until every entry queued before this call has been processed.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_audit_writer(
    store: Arc<CredentialStore>,
    mut rx: mpsc::Receiver<AuditCommand>,
    counters: Arc<AuditCounters>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Record(entry) => match store.append_audit(&entry) {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        account_id = %entry.account_id,
                        action = %entry.action,
                        error = %e,
                        "Failed to write audit entry"
                    );
                }
            },
            AuditCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    debug!("Audit writer stopped");
}
