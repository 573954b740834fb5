//! Authenticator trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AuthError;
use crate::user::User;

/// Lookup and management of active users.
///
/// Implementations must be thread-safe (`Send + Sync`) as they may be
/// called concurrently from multiple connections.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Find an active user by password hash.
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError>;

    /// Activate a user. Re-adding an active user keeps their counters.
    async fn add_user(&self, hash: &str) -> Result<(), AuthError>;

    /// Deactivate a user.
    async fn del_user(&self, hash: &str) -> Result<(), AuthError>;

    /// Snapshot of the active users.
    async fn list_users(&self) -> Vec<Arc<User>>;
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    #[inline]
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError> {
        (**self).auth_user(hash).await
    }

    #[inline]
    async fn add_user(&self, hash: &str) -> Result<(), AuthError> {
        (**self).add_user(hash).await
    }

    #[inline]
    async fn del_user(&self, hash: &str) -> Result<(), AuthError> {
        (**self).del_user(hash).await
    }

    #[inline]
    async fn list_users(&self) -> Vec<Arc<User>> {
        (**self).list_users().await
    }
}
