//! Integration Tests for Sync Core
//!
//! Tests that need a real Redis behind the lock manager. Tests use
//! testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//!
//! # Run only happy-path tests
//! cargo test --test integration happy -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: exclusion, expiry, release, full syncs
//! - `failure_*` - Failure scenarios: unreachable Redis at startup

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use sync_core::lock::{LockStore, RedisLockStore};
use sync_core::{
    AppendRequest, AppendSink, BatchSyncEngine, LockBackend, LockConfig, LockManager, Row, SinkError,
    SyncCoreConfig, SyncError, SyncTarget,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Container Helpers
// =============================================================================

/// Create a Redis container with health check
fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_config(port: u16) -> SyncCoreConfig {
    SyncCoreConfig {
        redis_url: Some(format!("redis://127.0.0.1:{}", port)),
        redis_prefix: Some("it:".into()),
        ..Default::default()
    }
}

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<Row>>>,
}

#[async_trait]
impl AppendSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn append(&self, request: &AppendRequest<'_>) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.batches.lock().push(request.rows.to_vec());
        Ok(())
    }
}

fn rows(n: usize) -> Vec<Row> {
    (0..n).map(|i| vec![json!(i)]).collect()
}

// =============================================================================
// Happy Path Tests - Normal Operation
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_two_managers_exclude_each_other() {
    // Two managers on one Redis stand in for two service instances
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let config = redis_config(redis.get_host_port_ipv4(6379));

    let a = LockManager::connect(&config).await;
    let b = LockManager::connect(&config).await;
    assert!(a.has_shared_store() && b.has_shared_store());

    let held = a.acquire("lock:test", Duration::from_millis(5_000)).await.unwrap().unwrap();
    assert_eq!(held.backend(), LockBackend::Shared);
    assert!(b.acquire("lock:test", Duration::from_millis(5_000)).await.unwrap().is_none());
    assert!(b.is_locked("lock:test").await.unwrap());

    assert!(a.release(&held).await.unwrap());
    assert!(b.acquire("lock:test", Duration::from_millis(5_000)).await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_expired_lock_is_taken_over_and_stale_release_is_noop() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let config = redis_config(redis.get_host_port_ipv4(6379));
    let locks = LockManager::connect(&config).await;

    let old = locks.acquire("lock:escrow:17", Duration::from_millis(100)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let new = locks.acquire("lock:escrow:17", Duration::from_millis(5_000)).await.unwrap().unwrap();
    assert!(!locks.release(&old).await.unwrap(), "stale release must not delete the new holder");
    assert!(locks.is_locked("lock:escrow:17").await.unwrap());
    assert!(locks.release(&new).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_extend_and_prefix() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let port = redis.get_host_port_ipv4(6379);

    let store = RedisLockStore::with_prefix(&format!("redis://127.0.0.1:{}", port), Some("tenant-a:"))
        .await
        .unwrap();
    assert_eq!(store.prefix(), "tenant-a:");
    let store: Arc<dyn LockStore> = Arc::new(store);
    let locks = LockManager::with_shared(store.clone(), LockConfig::default());

    let mut lock = locks.acquire("lock:token-refresh:u1", Duration::from_millis(300)).await.unwrap().unwrap();
    assert!(locks.extend(&mut lock, Duration::from_millis(2_000)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.holder("lock:token-refresh:u1").await.unwrap().is_some());

    // Raw key carries the prefix
    let client = redis::Client::open(format!("redis://127.0.0.1:{}", port)).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let raw: Option<String> = redis::cmd("GET")
        .arg("tenant-a:lock:token-refresh:u1")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(raw.as_deref(), Some(lock.holder_token()));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn happy_concurrent_engines_serialize_on_destination() {
    // Two engines with separate managers share nothing but Redis
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let config = SyncCoreConfig {
        lock_attempts: 50,
        lock_retry_delay_ms: 50,
        lock_retry_jitter_ms: 50,
        ..redis_config(redis.get_host_port_ipv4(6379))
    };
    let sink = Arc::new(RecordingSink::default());

    let make_engine = |locks: LockManager| {
        let (_tx, rx) = watch::channel(config.clone());
        Arc::new(BatchSyncEngine::new(config.clone(), rx, Arc::new(locks), sink.clone()))
    };
    let first = make_engine(LockManager::connect(&config).await);
    let second = make_engine(LockManager::connect(&config).await);

    let target = SyncTarget::new("1AbC", "Sheet1!A1");
    let (a, b) = tokio::join!(
        first.sync_with_batch_size(&target, rows(50), 10),
        second.sync_with_batch_size(&target, rows(50), 10),
    );

    assert!(a.unwrap().success);
    assert!(b.unwrap().success);

    // Each sync's batches are contiguous: no interleaving between engines
    let batches = sink.batches.lock().clone();
    assert_eq!(batches.len(), 10);
    assert_eq!(batches[..5].concat(), rows(50));
    assert_eq!(batches[5..].concat(), rows(50));
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
#[ignore] // Slow: waits out the startup retry schedule
async fn failure_unreachable_redis_starts_local_only() {
    let config = SyncCoreConfig {
        redis_url: Some("redis://127.0.0.1:1".into()),
        ..Default::default()
    };

    let locks = LockManager::connect(&config).await;
    assert!(!locks.has_shared_store());
    assert!(locks.is_degraded());

    let lock = locks.acquire("lock:global", Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(lock.backend(), LockBackend::Local);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn failure_held_destination_reports_contention() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let config = redis_config(redis.get_host_port_ipv4(6379));

    let other_instance = LockManager::connect(&config).await;
    let _held = other_instance
        .acquire("lock:google-sheets:1AbC", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let (_tx, rx) = watch::channel(config.clone());
    let engine = BatchSyncEngine::new(
        config.clone(),
        rx,
        Arc::new(LockManager::connect(&config).await),
        Arc::new(RecordingSink::default()),
    );

    let err = engine.sync(&SyncTarget::new("1AbC", "A1"), rows(5)).await.unwrap_err();
    assert_eq!(err, SyncError::LockTimeout { resource: "lock:google-sheets:1AbC".into() });
}
