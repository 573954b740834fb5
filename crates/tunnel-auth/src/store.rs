//! Persistent user store and the reconciler that keeps it in sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AuthError;
use crate::traits::Authenticator;

/// Quota and accumulated traffic of one stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuota {
    pub hash: String,
    /// Byte limit; negative means unlimited.
    pub quota: i64,
    pub upload: u64,
    pub download: u64,
}

impl UserQuota {
    /// Whether the user may stay active.
    pub fn within_quota(&self) -> bool {
        self.quota < 0 || self.download.saturating_add(self.upload) < self.quota as u64
    }
}

/// Persistent backing store for users and their traffic.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Add traffic to a stored user. Returns `AuthError::NotFound` if the
    /// store does not know the user.
    async fn push_traffic(&self, hash: &str, upload: u64, download: u64) -> Result<(), AuthError>;

    /// Every stored user with their quota.
    async fn load_users(&self) -> Result<Vec<UserQuota>, AuthError>;
}

/// Store kept in memory; useful for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, UserQuota>>,
}

impl MemoryStore {
    pub fn new<I: IntoIterator<Item = UserQuota>>(users: I) -> Self {
        Self {
            users: Mutex::new(users.into_iter().map(|u| (u.hash.clone(), u)).collect()),
        }
    }

    pub fn get(&self, hash: &str) -> Option<UserQuota> {
        self.users.lock().get(hash).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn push_traffic(&self, hash: &str, upload: u64, download: u64) -> Result<(), AuthError> {
        let mut users = self.users.lock();
        let user = users.get_mut(hash).ok_or(AuthError::NotFound)?;
        user.upload = user.upload.saturating_add(upload);
        user.download = user.download.saturating_add(download);
        Ok(())
    }

    async fn load_users(&self) -> Result<Vec<UserQuota>, AuthError> {
        Ok(self.users.lock().values().cloned().collect())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub flushed: usize,
    pub removed_unknown: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Flushes traffic to a [`UserStore`] and applies quotas to an
/// [`Authenticator`].
pub struct Reconciler<S> {
    store: S,
    authenticator: Arc<dyn Authenticator>,
    interval: Duration,
}

impl<S: UserStore> Reconciler<S> {
    pub fn new(store: S, authenticator: Arc<dyn Authenticator>, interval: Duration) -> Self {
        Self {
            store,
            authenticator,
            interval,
        }
    }

    /// Run one pass.
    ///
    /// Every active user's counters are reset and pushed to the store
    /// (sent as upload, received as download); users unknown to the store
    /// are deactivated. Then stored users within quota are activated and
    /// the others deactivated.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, AuthError> {
        let mut report = ReconcileReport::default();

        for user in self.authenticator.list_users().await {
            let (sent, recv) = user.reset_traffic();
            match self.store.push_traffic(user.hash(), sent, recv).await {
                Ok(()) => report.flushed += 1,
                Err(AuthError::NotFound) => {
                    warn!(user = user.hash(), "user missing from store, removing");
                    let _ = self.authenticator.del_user(user.hash()).await;
                    report.removed_unknown += 1;
                }
                Err(e) => {
                    // Keep the bytes for the next pass.
                    user.add_traffic(sent, recv);
                    error!(user = user.hash(), error = %e, "failed to push traffic");
                }
            }
        }

        for quota in self.store.load_users().await? {
            if quota.within_quota() {
                self.authenticator.add_user(&quota.hash).await?;
                report.enabled += 1;
            } else {
                // Already inactive users are fine.
                let _ = self.authenticator.del_user(&quota.hash).await;
                report.disabled += 1;
            }
        }

        debug!(?report, "user store reconciled");
        Ok(report)
    }

    /// Reconcile every interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "user store reconciler started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "user store reconciliation failed");
                    }
                }
            }
        }
        debug!("user store reconciler exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAuthenticator;

    fn quota(hash: &str, quota: i64, upload: u64, download: u64) -> UserQuota {
        UserQuota {
            hash: hash.to_string(),
            quota,
            upload,
            download,
        }
    }

    #[test]
    fn test_within_quota() {
        assert!(quota("a", -1, 1 << 40, 1 << 40).within_quota());
        assert!(quota("a", 100, 40, 59).within_quota());
        assert!(!quota("a", 100, 40, 60).within_quota());
        assert!(!quota("a", 0, 0, 0).within_quota());
    }

    #[tokio::test]
    async fn test_reconcile_flushes_and_applies_quota() {
        let store = MemoryStore::new([
            quota("alice", 1000, 0, 0),
            quota("bob", 100, 90, 0),
            quota("carol", -1, 0, 0),
        ]);
        let auth = Arc::new(MemoryAuthenticator::from_hashes(["alice", "bob", "mallory"]));
        auth.auth_user("alice").await.unwrap().add_traffic(10, 20);
        auth.auth_user("bob").await.unwrap().add_traffic(5, 5);

        let reconciler = Reconciler::new(store, auth.clone(), Duration::from_secs(60));
        let report = reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.flushed, 2);
        assert_eq!(report.removed_unknown, 1);
        assert_eq!(report.enabled, 2);
        assert_eq!(report.disabled, 1);

        let alice = reconciler.store.get("alice").unwrap();
        assert_eq!((alice.upload, alice.download), (10, 20));
        assert_eq!(auth.auth_user("alice").await.unwrap().traffic(), (0, 0));
        assert!(auth.contains("carol"));
        assert!(!auth.contains("bob"));
        assert!(!auth.contains("mallory"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let store = MemoryStore::new([quota("alice", -1, 0, 0)]);
        let auth = Arc::new(MemoryAuthenticator::new());
        let reconciler = Reconciler::new(store, auth.clone(), Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reconciler.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(auth.contains("alice"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
