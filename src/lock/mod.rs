// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named, time-bounded mutual exclusion.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        LockManager                           │
//! │  acquire / release / extend / with_lock / lock (guard)       │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  RedisLockStore (shared)     │  LocalLockStore (fallback)    │
//! │  SET NX PX + Lua compare     │  DashMap entry API            │
//! │  exclusion across processes  │  exclusion inside one process │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! When the shared store errors at acquisition time the manager grants the
//! lock from the local table and logs a warning. Liveness is kept, cross-process
//! exclusion is not.
//!
//! # Example
//!
//! ```
//! use sync_core::lock::{lock_key, LockManager, ESCROW};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), sync_core::lock::LockError> {
//! let locks = LockManager::local_only(Default::default());
//! let key = lock_key(ESCROW, "escrow-17");
//!
//! let released = locks
//!     .with_lock(&key, Duration::from_secs(30), || async { "settled" })
//!     .await?;
//! assert_eq!(released, "settled");
//! assert!(!locks.is_locked(&key).await?);
//! # Ok(())
//! # }
//! ```

mod keys;
mod manager;
mod memory;
mod redis;
mod store;

pub use keys::{
    lock_key, validate_resource, BID_SELECTION, ESCROW, GLOBAL_LOCK_KEY, GOOGLE_SHEETS,
    TOKEN_REFRESH,
};
pub use manager::{LockConfig, LockGuard, LockManager};
pub use memory::LocalLockStore;
pub use self::redis::RedisLockStore;
pub use store::LockStore;

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Which store granted a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockBackend {
    /// Shared key-value store, exclusion across all instances
    Shared,
    /// Process-local table, exclusion inside this instance only
    Local,
}

impl LockBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Could not acquire after every attempt. Retry later.
    #[error("timed out acquiring lock '{resource}' after {attempts} attempts")]
    Timeout { resource: String, attempts: u32 },
    #[error("invalid lock key '{resource}': {reason}")]
    InvalidResource { resource: String, reason: &'static str },
    #[error("lock TTL must be greater than zero")]
    InvalidTtl,
    #[error("lock store error: {0}")]
    Store(String),
}

impl LockError {
    /// Contention and store hiccups clear up on their own; bad keys don't.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Store(_))
    }

    /// Suggested HTTP status code for this error
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } | Self::Store(_) => 503,
            Self::InvalidResource { .. } | Self::InvalidTtl => 500,
        }
    }
}

/// Ownership of one named resource until `expires_at`.
///
/// A handle past its expiry is unowned: releasing it is a no-op, and
/// extending it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    resource: String,
    holder_token: String,
    expires_at: Instant,
    backend: LockBackend,
}

impl Lock {
    pub(crate) fn new(resource: &str, holder_token: String, granted_at: Instant, ttl: Duration, backend: LockBackend) -> Self {
        Self {
            resource: resource.to_string(),
            holder_token,
            expires_at: granted_at + ttl,
            backend,
        }
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn holder_token(&self) -> &str {
        &self.holder_token
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    #[must_use]
    pub fn backend(&self) -> LockBackend {
        self.backend
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before the lock lapses, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
