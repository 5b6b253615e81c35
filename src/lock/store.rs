use async_trait::async_trait;
use std::time::Duration;

use super::{LockBackend, LockError};

/// Atomic primitives a lock backend must provide.
///
/// Every method is keyed by the full resource key and the holder token of
/// one acquisition. Implementations must make `try_acquire` an atomic
/// set-if-absent and `release`/`extend` atomic compare-then-act on the token.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Which side of the fallback this store sits on.
    fn backend(&self) -> LockBackend;

    /// Store `token` under `resource` for `ttl` unless a live entry exists.
    /// Returns `false` when another holder owns the resource.
    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete the entry only if it still holds `token`.
    /// Returns `false` for a stale release (expired or re-acquired).
    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError>;

    /// Push the expiry of a lock we still own to `now + ttl`.
    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Token of the current live holder, if any.
    async fn holder(&self, resource: &str) -> Result<Option<String>, LockError>;
}
