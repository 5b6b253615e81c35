//! Process-local lock table.
//!
//! Used as the fallback when the shared store is unreachable, and on its own
//! when no shared store is configured. Same TTL and token semantics as the
//! shared store, but exclusion only holds inside this process.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::store::LockStore;
use super::{LockBackend, LockError};

#[derive(Debug, Clone)]
struct LocalEntry {
    token: String,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Keyed lock table. Every mutation goes through the map's entry API,
/// so check-then-act on one key is atomic.
pub struct LocalLockStore {
    entries: DashMap<String, LocalEntry>,
}

impl LocalLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn try_acquire_now(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let fresh = LocalEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        let acquired = match self.entries.entry(resource.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        crate::metrics::set_local_lock_entries(self.entries.len());
        acquired
    }

    /// Returns `true` only when a live entry owned by `token` was removed.
    /// An expired entry with our token is cleaned up but reported as stale.
    pub fn release_now(&self, resource: &str, token: &str) -> bool {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(resource, |_, entry| entry.token == token)
            .map_or(false, |(_, entry)| entry.is_live(now));
        crate::metrics::set_local_lock_entries(self.entries.len());
        removed
    }

    pub fn extend_now(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(resource) {
            Some(mut entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn holder_now(&self, resource: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(resource)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone())
    }

    /// Drop expired entries. Not needed for correctness (reads compare
    /// against expiry); bounds memory when many keys are used once.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut swept = 0;
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                swept += 1;
            }
            live
        });
        if swept > 0 {
            crate::metrics::record_locks_swept(swept);
        }
        crate::metrics::set_local_lock_entries(self.entries.len());
        swept
    }

    /// Sweep on a fixed interval until the store is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    debug!("Local lock table dropped, sweeper exiting");
                    break;
                };
                let swept = store.sweep_expired();
                if swept > 0 {
                    debug!(swept, remaining = store.len(), "Swept expired local locks");
                }
            }
        })
    }

    /// Entries currently stored, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for LocalLockStore {
    fn backend(&self) -> LockBackend {
        LockBackend::Local
    }

    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.try_acquire_now(resource, token, ttl))
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        Ok(self.release_now(resource, token))
    }

    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.extend_now(resource, token, ttl))
    }

    async fn holder(&self, resource: &str) -> Result<Option<String>, LockError> {
        Ok(self.holder_now(resource))
    }
}
