//! Per-user traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// An authenticated user and the traffic relayed on their behalf.
#[derive(Debug)]
pub struct User {
    hash: String,
    sent: AtomicU64,
    recv: AtomicU64,
}

impl User {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
        }
    }

    /// SHA-224 hex hash identifying the user.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn add_traffic(&self, sent: u64, recv: u64) {
        self.sent.fetch_add(sent, Ordering::Relaxed);
        self.recv.fetch_add(recv, Ordering::Relaxed);
    }

    /// Bytes `(sent, received)` since the last reset.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }

    /// Take the counters, leaving them at zero.
    pub fn reset_traffic(&self) -> (u64, u64) {
        (
            self.sent.swap(0, Ordering::Relaxed),
            self.recv.swap(0, Ordering::Relaxed),
        )
    }
}
