//! User authentication and traffic accounting for tunnel-rs.
//!
//! Protocol layers look users up by the SHA-224 hex hash of their password
//! and add the bytes they relay to the user's counters. A [`Reconciler`]
//! periodically flushes those counters to a persistent [`UserStore`] and
//! enables or disables users according to their quota.
//!
//! # Example
//!
//! ```
//! use tunnel_auth::{Authenticator, MemoryAuthenticator, sha224_hex};
//!
//! # async fn example() -> Result<(), tunnel_auth::AuthError> {
//! let auth = MemoryAuthenticator::from_passwords(["my_password"]);
//! let user = auth.auth_user(&sha224_hex("my_password")).await?;
//! user.add_traffic(1024, 4096);
//! # Ok(())
//! # }
//! ```
//!
//! # Reconciling with a store
//!
//! No persistent store ships with tunnel-rs, so the proxy CLI never starts a
//! reconciler. Embedders that keep users in a database implement
//! [`UserStore`] for it and spawn [`Reconciler::run`] under their root
//! cancellation token:
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use tunnel_auth::{MemoryAuthenticator, MemoryStore, Reconciler};
//!
//! # async fn example(shutdown: CancellationToken) {
//! let auth = Arc::new(MemoryAuthenticator::from_passwords(["my_password"]));
//! let store = MemoryStore::default();
//! tokio::spawn(Reconciler::new(store, auth, Duration::from_secs(60)).run(shutdown));
//! # }
//! ```

mod error;
mod hash;
mod memory;
mod store;
mod traits;
mod user;

pub use error::AuthError;
pub use hash::{sha224_hex, verify_password};
pub use memory::MemoryAuthenticator;
pub use store::{MemoryStore, ReconcileReport, Reconciler, UserQuota, UserStore};
pub use traits::Authenticator;
pub use user::User;
