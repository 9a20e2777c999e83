//! Per-account serialization of token-mutating operations.
//!
//! Each account that currently has a refresh (or save/delete) in progress
//! owns one async mutex in the map. Callers for the same account queue on
//! it; callers for different accounts never contend. Once the last holder
//! or waiter lets go, the entry is removed so the map only ever holds
//! in-flight accounts.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct RefreshLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `account_id`.
    pub async fn acquire(&self, account_id: &str) -> AccountGuard<'_> {
        // Clone out of the map first; the shard lock must not be held across .await
        let lock = self
            .locks
            .entry(account_id.to_string())
            .or_default()
            .clone();

        let guard = lock.lock_owned().await;

        AccountGuard {
            locks: self,
            account_id: account_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of accounts with a holder or waiter.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one account; released on drop.
pub struct AccountGuard<'a> {
    locks: &'a RefreshLocks,
    account_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the only remaining reference
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.account_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = RefreshLocks::new();
        {
            let _guard = locks.acquire("acct-1").await;
            assert_eq!(locks.in_flight(), 1);
        }
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_same_account_is_serialized() {
        let locks = Arc::new(RefreshLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("acct-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_block() {
        let locks = RefreshLocks::new();
        let _a = locks.acquire("acct-a").await;

        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("acct-b")).await;
        assert!(b.is_ok());
    }
}
