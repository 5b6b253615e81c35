//! # Sync Core
//!
//! Resilience primitives for pushing rows into rate-limited, append-only
//! external destinations from many service instances at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchSyncEngine                        │
//! │  • Splits rows into fixed-size batches                     │
//! │  • Retries each batch with exponential backoff             │
//! │  • Reports per-batch outcomes, never all-or-nothing        │
//! └─────────────────────────────────────────────────────────────┘
//!          │ one sync per destination          │ every append
//!          ▼                                   ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │         LockManager          │  │      CircuitBreaker      │
//! │  • Redis SET NX PX + Lua     │  │  • Closed/Open/HalfOpen  │
//! │  • Local fallback table      │  │  • Single trial probe    │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                                              │
//!                                              ▼
//!                                   ┌──────────────────────────┐
//!                                   │       AppendSink         │
//!                                   │  • HTTP bulk append      │
//!                                   └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sync_core::{BatchSyncEngine, HttpAppendSink, LockManager, SyncCoreConfig, SyncTarget};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncCoreConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     // Falls back to process-local locks if Redis is unreachable
//!     let locks = Arc::new(LockManager::connect(&config).await);
//!     let sink = Arc::new(HttpAppendSink::new("access-token").expect("client"));
//!     let engine = BatchSyncEngine::new(config, rx, locks, sink);
//!
//!     let rows = (0..250).map(|i| vec![json!(i), json!("paid")]).collect();
//!     let result = engine
//!         .sync(&SyncTarget::new("1AbC", "Ledger!A1"), rows)
//!         .await
//!         .expect("sync");
//!
//!     println!("{} batches ok, failed: {:?}", result.batches_processed, result.failed_indices());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`lock`]: Named, TTL-bounded locks with shared and local backends
//! - [`resilience`]: Circuit breakers and retry policies
//! - [`batching`]: Fixed-size row batching
//! - [`sink`]: Bulk-append destinations
//! - [`engine`]: The [`BatchSyncEngine`] tying it together
//! - [`metrics`]: Prometheus-style metrics via the `metrics` facade

pub mod batching;
pub mod config;
pub mod engine;
pub mod lock;
pub mod metrics;
pub mod resilience;
pub mod sink;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use batching::{split_into_batches, Batch, InvalidBatchSize};
pub use config::{ConfigError, SyncCoreConfig};
pub use engine::{BatchDispatchError, BatchFailure, BatchSyncEngine, SyncError, SyncResult};
pub use lock::{lock_key, Lock, LockBackend, LockConfig, LockError, LockGuard, LockManager};
pub use metrics::LatencyTimer;
pub use resilience::circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitMetrics, CircuitRegistry, CircuitState,
};
pub use resilience::retry::RetryConfig;
pub use sink::{AppendRequest, AppendSink, HttpAppendSink, Row, SinkError, SyncTarget, ValueInputMode};
