//! Lock manager: acquisition policy, fallback and scoped release.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::keys::validate_resource;
use super::memory::LocalLockStore;
use super::redis::RedisLockStore;
use super::store::LockStore;
use super::{Lock, LockBackend, LockError};
use crate::config::SyncCoreConfig;

/// Acquisition policy for [`LockManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Attempts made by `with_lock` / `lock` before timing out
    pub attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Upper bound of the random extra pause added to `retry_delay`
    pub retry_jitter: Duration,
    /// Local table sweep period (zero disables the sweeper)
    pub sweep_interval: Duration,
    /// TTL used by [`LockManager::with_default_lock`]
    pub default_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(60),
            default_ttl: Duration::from_secs(30),
        }
    }
}

impl From<&SyncCoreConfig> for LockConfig {
    fn from(config: &SyncCoreConfig) -> Self {
        Self {
            attempts: config.lock_attempts,
            retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
            retry_jitter: Duration::from_millis(config.lock_retry_jitter_ms),
            sweep_interval: Duration::from_secs(config.lock_sweep_interval_secs),
            default_ttl: config.lock_ttl(),
        }
    }
}

/// The two tables a lock can live in. Cheap to clone so release can
/// outlive the manager borrow (drop guards, spawned releases).
#[derive(Clone)]
struct Backends {
    shared: Option<Arc<dyn LockStore>>,
    local: Arc<LocalLockStore>,
}

impl Backends {
    /// Every lock owns a local gate entry under its token; shared locks
    /// additionally own the store key. The gate is released even when the
    /// store call fails, leaving the key to its TTL.
    async fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        let gate_released = self.local.release_now(lock.resource(), lock.holder_token());
        match lock.backend() {
            LockBackend::Local => {
                record_release(lock, gate_released);
                Ok(gate_released)
            }
            LockBackend::Shared => self.release_shared(lock).await,
        }
    }

    async fn release_shared(&self, lock: &Lock) -> Result<bool, LockError> {
        let released = match &self.shared {
            Some(shared) => shared.release(lock.resource(), lock.holder_token()).await?,
            None => false,
        };
        record_release(lock, released);
        Ok(released)
    }
}

fn record_release(lock: &Lock, released: bool) {
    let outcome = if released { "released" } else { "stale" };
    crate::metrics::record_lock_release(lock.backend().as_str(), outcome);
    if !released {
        debug!(resource = %lock.resource(), backend = %lock.backend(), "Stale release ignored");
    }
}

/// Grants named locks from the shared store, or the local table when the
/// shared store is missing or failing.
///
/// The local table also gates every acquisition, shared or not, so one
/// manager never hands out the same resource twice while the store flaps.
///
/// Managers built with [`connect`](Self::connect) sweep the local table in
/// the background. Managers built with [`local_only`](Self::local_only) or
/// [`with_shared`](Self::with_shared) call
/// [`start_sweeper`](Self::start_sweeper) themselves when they need it.
pub struct LockManager {
    backends: Backends,
    config: LockConfig,
    shared_healthy: AtomicBool,
    sweeper: Option<JoinHandle<()>>,
}

impl LockManager {
    /// Manager with only the process-local table.
    #[must_use]
    pub fn local_only(config: LockConfig) -> Self {
        Self {
            backends: Backends {
                shared: None,
                local: Arc::new(LocalLockStore::new()),
            },
            config,
            shared_healthy: AtomicBool::new(false),
            sweeper: None,
        }
    }

    /// Manager backed by a shared store, falling back to a local table.
    #[must_use]
    pub fn with_shared(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            backends: Backends {
                shared: Some(store),
                local: Arc::new(LocalLockStore::new()),
            },
            config,
            shared_healthy: AtomicBool::new(true),
            sweeper: None,
        }
    }

    /// Build from config: connect to Redis when `redis_url` is set.
    ///
    /// An unreachable Redis is not fatal. The manager starts in local-only
    /// mode with a warning. The local table sweeper is started either way
    /// and stops when the manager is dropped.
    pub async fn connect(config: &SyncCoreConfig) -> Self {
        let mut manager = Self::connect_backends(config).await;
        manager.sweeper = manager.start_sweeper();
        manager
    }

    async fn connect_backends(config: &SyncCoreConfig) -> Self {
        let lock_config = LockConfig::from(config);
        let Some(url) = config.redis_url.as_deref() else {
            info!("No Redis URL configured, using process-local locks only");
            return Self::local_only(lock_config);
        };

        match RedisLockStore::with_prefix(url, config.redis_prefix.as_deref()).await {
            Ok(store) => {
                info!("Shared lock store connected");
                crate::metrics::set_backend_healthy("redis", true);
                Self::with_shared(Arc::new(store), lock_config)
            }
            Err(e) => {
                warn!(error = %e, "Shared lock store unreachable, using process-local locks only");
                crate::metrics::set_backend_healthy("redis", false);
                crate::metrics::record_lock_fallback("connect");
                Self::local_only(lock_config)
            }
        }
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// The fallback table, for inspection and sweeping.
    #[must_use]
    pub fn local_store(&self) -> &Arc<LocalLockStore> {
        &self.backends.local
    }

    #[must_use]
    pub fn has_shared_store(&self) -> bool {
        self.backends.shared.is_some()
    }

    /// True when locks are currently coming from the local table although a
    /// shared store exists, or when no shared store exists at all.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.shared_healthy.load(Ordering::Acquire)
    }

    fn mark_shared_health(&self, healthy: bool) {
        let was = self.shared_healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            crate::metrics::set_backend_healthy("redis", healthy);
            if healthy {
                info!("Shared lock store healthy again");
            }
        }
    }

    /// Start the periodic sweep of the local table.
    /// Returns `None` when sweeping is disabled.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        if self.config.sweep_interval.is_zero() {
            return None;
        }
        Some(self.backends.local.spawn_sweeper(self.config.sweep_interval))
    }

    /// Single non-blocking attempt.
    ///
    /// `Ok(None)` means another live holder owns `resource`.
    #[instrument(skip(self), fields(ttl_ms = ttl.as_millis() as u64))]
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<Lock>, LockError> {
        validate_resource(resource)?;
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }

        let token = Uuid::new_v4().to_string();
        let granted_at = Instant::now();

        // Process-wide gate, whichever table ends up granting the lock
        if !self.backends.local.try_acquire_now(resource, &token, ttl) {
            crate::metrics::record_lock_acquire("local", "contended");
            debug!(resource, "Lock held inside this process");
            return Ok(None);
        }

        let Some(shared) = &self.backends.shared else {
            crate::metrics::record_lock_acquire("local", "acquired");
            debug!(resource, "Local lock acquired");
            return Ok(Some(Lock::new(resource, token, granted_at, ttl, LockBackend::Local)));
        };

        match shared.try_acquire(resource, &token, ttl).await {
            Ok(true) => {
                self.mark_shared_health(true);
                crate::metrics::record_lock_acquire("shared", "acquired");
                debug!(resource, "Lock acquired");
                Ok(Some(Lock::new(resource, token, granted_at, ttl, LockBackend::Shared)))
            }
            Ok(false) => {
                self.mark_shared_health(true);
                self.backends.local.release_now(resource, &token);
                crate::metrics::record_lock_acquire("shared", "contended");
                debug!(resource, "Lock held by another owner");
                Ok(None)
            }
            Err(e) => {
                self.mark_shared_health(false);
                crate::metrics::record_lock_fallback("acquire");
                crate::metrics::record_lock_acquire("local", "acquired");
                warn!(
                    resource,
                    error = %e,
                    "Shared lock store unavailable, falling back to process-local lock"
                );
                Ok(Some(Lock::new(resource, token, granted_at, ttl, LockBackend::Local)))
            }
        }
    }

    /// Release a lock if its token still owns the resource.
    ///
    /// Returns `Ok(false)` for a stale handle: the entry expired or was
    /// re-acquired by someone else, and is left untouched.
    pub async fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        self.backends.release(lock).await
    }

    /// Push a held lock's expiry to `now + ttl` (heartbeat).
    ///
    /// Returns `Ok(false)` if the lock is no longer owned.
    pub async fn extend(&self, lock: &mut Lock, ttl: Duration) -> Result<bool, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let extended_at = Instant::now();
        let (resource, token) = (lock.resource(), lock.holder_token());
        let extended = match lock.backend() {
            LockBackend::Local => self.backends.local.extend_now(resource, token, ttl),
            LockBackend::Shared => {
                let extended = match &self.backends.shared {
                    Some(shared) => shared.extend(resource, token, ttl).await?,
                    None => false,
                };
                // Keep the gate entry in step with the store key
                if extended && !self.backends.local.extend_now(resource, token, ttl) {
                    self.backends.local.try_acquire_now(resource, token, ttl);
                }
                extended
            }
        };
        if extended {
            *lock = Lock::new(lock.resource(), lock.holder_token().to_string(), extended_at, ttl, lock.backend());
        }
        Ok(extended)
    }

    /// Whether a live lock currently holds `resource` in either table.
    pub async fn is_locked(&self, resource: &str) -> Result<bool, LockError> {
        validate_resource(resource)?;
        if self.backends.local.holder_now(resource).is_some() {
            return Ok(true);
        }
        if let Some(shared) = &self.backends.shared {
            match shared.holder(resource).await {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(e) => debug!(resource, error = %e, "Shared holder lookup failed"),
            }
        }
        Ok(false)
    }

    fn retry_pause(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }

    /// Acquire with the configured attempts, pausing `retry_delay + jitter`
    /// between attempts so racing callers spread out.
    pub async fn acquire_with_retry(&self, resource: &str, ttl: Duration) -> Result<Lock, LockError> {
        let started = Instant::now();
        let attempts = self.config.attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(lock) = self.acquire(resource, ttl).await? {
                crate::metrics::record_lock_wait(started.elapsed());
                return Ok(lock);
            }
            if attempt < attempts {
                let pause = self.retry_pause();
                debug!(
                    resource,
                    attempt,
                    max_attempts = attempts,
                    pause_ms = pause.as_millis() as u64,
                    "Lock contended, retrying"
                );
                sleep(pause).await;
            }
        }

        warn!(resource, attempts, "Could not acquire lock, giving up");
        crate::metrics::record_lock_timeout();
        Err(LockError::Timeout {
            resource: resource.to_string(),
            attempts,
        })
    }

    /// Acquire with retries and return a guard that releases on drop.
    pub async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let lock = self.acquire_with_retry(resource, ttl).await?;
        Ok(LockGuard {
            backends: self.backends.clone(),
            lock: Some(lock),
            acquired_at: Instant::now(),
        })
    }

    /// Run `work` while holding `resource`.
    ///
    /// The lock is released on every exit path: normal completion, a panic
    /// inside `work`, or the returned future being dropped.
    pub async fn with_lock<F, Fut, T>(&self, resource: &str, ttl: Duration, work: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(resource, ttl).await?;
        let output = work().await;
        if guard.is_expired() {
            warn!(resource, "Work outlived the lock TTL, another holder may have entered");
        }
        guard.release().await;
        Ok(output)
    }

    /// [`with_lock`](Self::with_lock) with the configured default TTL.
    pub async fn with_default_lock<F, Fut, T>(&self, resource: &str, work: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock(resource, self.config.default_ttl, work).await
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Scoped ownership of a lock.
///
/// Call [`release`](Self::release) to release and observe the outcome. If the
/// guard is dropped instead, the local gate entry is freed immediately and a
/// shared key is released by a task on the current tokio runtime (or left to
/// expire when there is none).
pub struct LockGuard {
    backends: Backends,
    lock: Option<Lock>,
    acquired_at: Instant,
}

impl LockGuard {
    #[must_use]
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.lock.as_ref().map_or(true, Lock::is_expired)
    }

    /// Release now. Store errors are logged; the TTL cleans up after them.
    pub async fn release(mut self) -> bool {
        let Some(lock) = self.lock.take() else {
            return false;
        };
        crate::metrics::record_lock_held(self.acquired_at.elapsed());
        match self.backends.release(&lock).await {
            Ok(released) => released,
            Err(e) => {
                warn!(
                    resource = %lock.resource(),
                    error = %e,
                    "Failed to release lock, it will expire after its TTL"
                );
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        crate::metrics::record_lock_held(self.acquired_at.elapsed());
        let gate_released = self.backends.local.release_now(lock.resource(), lock.holder_token());
        match lock.backend() {
            LockBackend::Local => record_release(&lock, gate_released),
            LockBackend::Shared => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let backends = self.backends.clone();
                    handle.spawn(async move {
                        if let Err(e) = backends.release_shared(&lock).await {
                            warn!(resource = %lock.resource(), error = %e, "Deferred lock release failed");
                        }
                    });
                }
                Err(_) => {
                    warn!(resource = %lock.resource(), "No runtime to release lock, leaving it to expire");
                }
            },
        }
    }
}
