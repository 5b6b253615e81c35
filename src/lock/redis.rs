//! Redis-backed shared lock store.
//!
//! One string key per resource holding the holder token, with a PX expiry:
//! ```text
//! SET lock:google-sheets:1AbC <token> NX PX 60000
//! ```
//!
//! Release and extend are compare-then-act on the token, done server-side in
//! Lua so no other client can interleave between the check and the write.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::debug;

use super::store::LockStore;
use super::{LockBackend, LockError};
use crate::resilience::retry::{retry, RetryConfig};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:lock:escrow:42")
    prefix: String,
    release_script: Script,
    extend_script: Script,
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn store_error(e: redis::RedisError) -> LockError {
    LockError::Store(e.to_string())
}

impl RedisLockStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, LockError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix, prepended to every lock key.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use sync_core::lock::RedisLockStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be stored as "myapp:lock:escrow:42"
    /// let store = RedisLockStore::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, LockError> {
        let client = Client::open(connection_string).map_err(store_error)?;

        // Startup config: fail fast so the caller can fall back to local locks
        let connection = retry("redis_lock_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(store_error)?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Wrap an existing connection (e.g., one shared with other Redis users).
    #[must_use]
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    fn backend(&self) -> LockBackend {
        LockBackend::Shared
    }

    async fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        // No retry here: a lost OK reply would make a retried SET NX see our
        // own key and report contention. The manager falls back instead.
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(resource);
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        debug!(key = %key, acquired = reply.is_some(), "SET NX PX");
        Ok(reply.is_some())
    }

    async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(resource);

        let removed: i64 = retry("redis_lock_release", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let removed: i64 = self
                    .release_script
                    .key(&key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, redis::RedisError>(removed)
            }
        })
        .await
        .map_err(store_error)?;

        Ok(removed == 1)
    }

    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(resource);
        let extended: i64 = self
            .extend_script
            .key(&key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(extended == 1)
    }

    async fn holder(&self, resource: &str) -> Result<Option<String>, LockError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(resource);

        retry("redis_lock_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let token: Option<String> = conn.get(&key).await?;
                Ok::<_, redis::RedisError>(token)
            }
        })
        .await
        .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn test_scripts_compare_token_before_writing() {
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("GET", KEYS[1]) == ARGV[1]"#));
        assert!(EXTEND_SCRIPT.contains("PEXPIRE"));
    }
}
