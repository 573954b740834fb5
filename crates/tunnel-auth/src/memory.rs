//! In-memory authenticator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::AuthError;
use crate::hash::sha224_hex;
use crate::traits::Authenticator;
use crate::user::User;

/// Authenticator keeping active users in a hash map.
#[derive(Debug, Default)]
pub struct MemoryAuthenticator {
    users: RwLock<HashMap<String, Arc<User>>>,
}

impl MemoryAuthenticator {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from pre-computed SHA224 hashes.
    pub fn from_hashes<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users = hashes
            .into_iter()
            .map(|h| {
                let hash = h.into();
                (hash.clone(), Arc::new(User::new(hash)))
            })
            .collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// Create from plaintext passwords (will be hashed).
    pub fn from_passwords<I, S>(passwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_hashes(passwords.into_iter().map(|p| sha224_hex(p.as_ref())))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    #[inline]
    pub fn contains(&self, hash: &str) -> bool {
        self.users.read().contains_key(hash)
    }
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn auth_user(&self, hash: &str) -> Result<Arc<User>, AuthError> {
        self.users
            .read()
            .get(hash)
            .cloned()
            .ok_or(AuthError::Invalid)
    }

    async fn add_user(&self, hash: &str) -> Result<(), AuthError> {
        self.users
            .write()
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(User::new(hash)));
        Ok(())
    }

    async fn del_user(&self, hash: &str) -> Result<(), AuthError> {
        self.users
            .write()
            .remove(hash)
            .map(|_| ())
            .ok_or(AuthError::NotFound)
    }

    async fn list_users(&self) -> Vec<Arc<User>> {
        self.users.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_passwords() {
        let auth = MemoryAuthenticator::from_passwords(["test123", "password"]);
        assert_eq!(auth.len(), 2);

        let user = auth.auth_user(&sha224_hex("test123")).await.unwrap();
        assert_eq!(user.hash(), sha224_hex("test123"));
        assert!(auth.auth_user(&sha224_hex("wrong")).await.is_err());
    }

    #[tokio::test]
    async fn test_readd_keeps_counters() {
        let auth = MemoryAuthenticator::new();
        auth.add_user("h1").await.unwrap();
        auth.auth_user("h1").await.unwrap().add_traffic(5, 6);
        auth.add_user("h1").await.unwrap();
        assert_eq!(auth.auth_user("h1").await.unwrap().traffic(), (5, 6));
    }

    #[tokio::test]
    async fn test_add_del() {
        let auth = MemoryAuthenticator::new();
        assert!(auth.is_empty());
        auth.add_user("h1").await.unwrap();
        assert!(auth.contains("h1"));
        auth.del_user("h1").await.unwrap();
        assert!(auth.is_empty());
        assert!(matches!(auth.del_user("h1").await, Err(AuthError::NotFound)));
    }
}
