// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch sync engine.
//!
//! Pushes a list of rows to an append-only destination in fixed-size
//! batches, one sync per destination at a time.
//!
//! ```text
//! sync(target, rows)
//!   │
//!   ├─ empty? ───────────────────────────────► SyncResult::empty()
//!   ├─ breaker open? ────────────────────────► SyncError::CircuitOpen
//!   │
//!   └─ with_lock("lock:google-sheets:<id>", 60s)      (timeout ► SyncError::LockTimeout)
//!        for batch in split_into_batches(rows):        (strict index order)
//!          attempt 1..=max_retries:
//!            breaker.call(sink.append(batch))
//!            fail ► sleep(base * 2^(n-1)), unless breaker now open
//!          record success / failure, continue
//!        ► SyncResult { batches_processed, failed_batches, errors, success }
//! ```
//!
//! One failing batch never discards the batches that already committed.
//! Once the breaker opens, the remaining batches are reported as skipped
//! instead of being hammered against a dependency that is known to be down.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sync_core::{BatchSyncEngine, HttpAppendSink, LockManager, SyncCoreConfig, SyncTarget};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncCoreConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//!
//! let locks = Arc::new(LockManager::connect(&config).await);
//! let sink = Arc::new(HttpAppendSink::new("ya29.token")?);
//! let engine = BatchSyncEngine::new(config, rx, locks, sink);
//!
//! let rows = vec![vec![json!("alice"), json!(42)]];
//! let result = engine.sync(&SyncTarget::new("1AbC", "Sheet1!A1"), rows).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

mod types;

pub use types::{BatchDispatchError, BatchFailure, SyncError, SyncResult};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::batching::{split_into_batches, Batch};
use crate::config::SyncCoreConfig;
use crate::lock::{lock_key, LockManager, GOOGLE_SHEETS};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError, CircuitRegistry};
use crate::resilience::retry::RetryConfig;
use crate::sink::{AppendSink, Row, SyncTarget};

/// Dispatches row batches to an [`AppendSink`] under a per-destination lock,
/// with retries and a circuit breaker around the sink.
///
/// Safe to share across tasks: syncs to different destinations run
/// concurrently, syncs to the same destination are serialized by the lock.
pub struct BatchSyncEngine {
    /// Current config, replaced when the watch channel publishes a valid update
    config: RwLock<SyncCoreConfig>,
    config_rx: Mutex<watch::Receiver<SyncCoreConfig>>,
    locks: Arc<LockManager>,
    sink: Arc<dyn AppendSink>,
    breaker: Arc<CircuitBreaker>,
}

impl BatchSyncEngine {
    /// Engine with its own breaker, named after the sink.
    pub fn new(
        config: SyncCoreConfig,
        config_rx: watch::Receiver<SyncCoreConfig>,
        locks: Arc<LockManager>,
        sink: Arc<dyn AppendSink>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(sink.name(), config.breaker()));
        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            locks,
            sink,
            breaker,
        }
    }

    /// Share the sink's breaker through a registry, so every engine talking
    /// to the same dependency trips together.
    #[must_use]
    pub fn with_registry(mut self, registry: &CircuitRegistry) -> Self {
        let config = self.config.read().breaker();
        self.breaker = registry.get_or_create(self.sink.name(), config);
        self
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Snapshot of the config the next sync will use.
    #[must_use]
    pub fn config(&self) -> SyncCoreConfig {
        self.refresh_config();
        self.config.read().clone()
    }

    /// Pick up a pending config update. Invalid updates are logged and ignored.
    fn refresh_config(&self) {
        let mut rx = self.config_rx.lock();
        if !rx.has_changed().unwrap_or(false) {
            return;
        }
        let update = rx.borrow_and_update().clone();
        match update.validate() {
            Ok(()) => {
                info!(batch_size = update.batch_size, max_retries = update.max_retries, "Sync config updated");
                *self.config.write() = update;
            }
            Err(e) => warn!(error = %e, "Ignoring invalid config update"),
        }
    }

    /// Sync with the configured batch size.
    pub async fn sync(&self, target: &SyncTarget, rows: Vec<Row>) -> Result<SyncResult, SyncError> {
        self.refresh_config();
        let batch_size = self.config.read().batch_size;
        self.sync_with_batch_size(target, rows, batch_size).await
    }

    /// Append `rows` to `target` in batches of `batch_size`.
    ///
    /// Returns `Ok` with per-batch outcomes once the lock was held, even when
    /// some batches failed. Returns `Err` only when no batch was attempted.
    #[instrument(skip_all, fields(destination = %target.destination_id, rows = rows.len(), batch_size = batch_size))]
    pub async fn sync_with_batch_size(
        &self,
        target: &SyncTarget,
        rows: Vec<Row>,
        batch_size: usize,
    ) -> Result<SyncResult, SyncError> {
        let _timer = crate::time_operation!("engine", "sync");
        self.refresh_config();

        let total_rows = rows.len();
        let batches = match split_into_batches(rows, batch_size) {
            Ok(batches) => batches,
            Err(e) => {
                crate::metrics::record_sync("invalid");
                return Err(e.into());
            }
        };
        if batches.is_empty() {
            debug!("Nothing to sync");
            crate::metrics::record_sync("empty");
            return Ok(SyncResult::empty());
        }

        if !self.breaker.allows_calls() {
            warn!(circuit = %self.breaker.name(), "Circuit open, sync not started");
            crate::metrics::record_sync("circuit_open");
            return Err(SyncError::CircuitOpen {
                circuit: self.breaker.name().to_string(),
            });
        }

        let (lock_ttl, retry) = {
            let config = self.config.read();
            (config.sync_lock_ttl(), config.batch_retry())
        };
        let key = lock_key(GOOGLE_SHEETS, &target.destination_id);

        let outcome = self
            .locks
            .with_lock(&key, lock_ttl, || self.dispatch_all(target, batches, total_rows, &retry))
            .await;

        match outcome {
            Ok(result) => {
                crate::metrics::record_sync(if result.success { "success" } else { "partial" });
                if result.success {
                    info!(batches = result.batches_processed, "Sync complete");
                } else {
                    warn!(
                        batches = result.batches_processed,
                        failed = result.failed_batches,
                        failed_indices = ?result.failed_indices(),
                        "Sync finished with failed batches"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                let e = SyncError::from(e);
                match &e {
                    SyncError::LockTimeout { resource } => {
                        warn!(resource = %resource, "Destination busy, sync not started");
                        crate::metrics::record_sync("lock_timeout");
                    }
                    other => {
                        error!(error = %other, "Sync lock failed");
                        crate::metrics::record_sync("lock_error");
                    }
                }
                Err(e)
            }
        }
    }

    /// Dispatch every batch in order. Runs while holding the destination lock.
    async fn dispatch_all(
        &self,
        target: &SyncTarget,
        batches: Vec<Batch<Row>>,
        total_rows: usize,
        retry: &RetryConfig,
    ) -> SyncResult {
        let total_batches = batches.len();
        let mut result = SyncResult::new(total_rows);
        let mut circuit_open = false;

        for batch in batches {
            if circuit_open {
                crate::metrics::record_batch_outcome("skipped");
                result.record_failure(BatchDispatchError {
                    batch_index: batch.index,
                    attempts: 0,
                    cause: BatchFailure::Skipped,
                });
                continue;
            }

            crate::metrics::record_batch_size(batch.len());
            match self.dispatch_batch(target, &batch, total_batches, retry).await {
                Ok(attempts) => {
                    debug!(batch = batch.index, total_batches, attempts, "Batch appended");
                    crate::metrics::record_batch_outcome("success");
                    crate::metrics::record_rows_synced(batch.len());
                    result.record_success();
                }
                Err(failure) => {
                    error!(
                        batch = failure.batch_index,
                        total_batches,
                        attempts = failure.attempts,
                        error = %failure.cause,
                        "Batch failed"
                    );
                    crate::metrics::record_batch_outcome("failed");
                    // Also covers a batch whose last attempt tripped the breaker
                    circuit_open = matches!(failure.cause, BatchFailure::CircuitOpen { .. })
                        || !self.breaker.allows_calls();
                    result.record_failure(failure);
                }
            }
        }

        result
    }

    /// Try one batch until it lands, attempts run out, or the breaker opens.
    /// Returns the number of attempts used on success.
    async fn dispatch_batch(
        &self,
        target: &SyncTarget,
        batch: &Batch<Row>,
        total_batches: usize,
        retry: &RetryConfig,
    ) -> Result<u32, BatchDispatchError> {
        let max_attempts = retry
            .max_retries
            .map_or(u32::MAX, |n| u32::try_from(n).unwrap_or(u32::MAX))
            .max(1);
        let request = target.request(&batch.rows);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                if !self.breaker.allows_calls() {
                    return Err(BatchDispatchError {
                        batch_index: batch.index,
                        attempts: attempt - 1,
                        cause: BatchFailure::CircuitOpen { last_error },
                    });
                }
                let delay = retry.delay_for_attempt(attempt - 1);
                debug!(
                    batch = batch.index,
                    total_batches,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying batch"
                );
                crate::metrics::record_batch_retry();
                tokio::time::sleep(delay).await;
            }

            match self.breaker.call(|| self.sink.append(&request)).await {
                Ok(()) => return Ok(attempt),
                Err(CircuitError::Rejected) => {
                    return Err(BatchDispatchError {
                        batch_index: batch.index,
                        attempts: attempt - 1,
                        cause: BatchFailure::CircuitOpen { last_error },
                    });
                }
                Err(CircuitError::Inner(e)) => {
                    warn!(
                        batch = batch.index,
                        total_batches,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Batch append failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(BatchDispatchError {
            batch_index: batch.index,
            attempts: max_attempts,
            cause: match last_error {
                Some(e) => BatchFailure::Sink(e),
                None => BatchFailure::CircuitOpen { last_error: None },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::sink::{AppendRequest, SinkError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records every append; fails according to a script of outcomes.
    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<bool>>,
        appended: Mutex<Vec<Vec<Row>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSink {
        fn failing_first(n: usize) -> Self {
            let sink = Self::default();
            sink.script.lock().extend(std::iter::repeat(false).take(n));
            sink
        }

        fn always_failing() -> Self {
            Self::failing_first(10_000)
        }

        fn appended(&self) -> Vec<Vec<Row>> {
            self.appended.lock().clone()
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl AppendSink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn append(&self, request: &AppendRequest<'_>) -> Result<(), SinkError> {
            *self.calls.lock() += 1;
            let ok = self.script.lock().pop_front().unwrap_or(true);
            if ok {
                self.appended.lock().push(request.rows.to_vec());
                Ok(())
            } else {
                Err(SinkError::Status { status: 503, body: "unavailable".into() })
            }
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n).map(|i| vec![json!(i)]).collect()
    }

    fn engine_with(config: SyncCoreConfig, sink: Arc<ScriptedSink>) -> (BatchSyncEngine, watch::Sender<SyncCoreConfig>) {
        let (tx, rx) = watch::channel(config.clone());
        let locks = Arc::new(LockManager::local_only(LockConfig::from(&config)));
        (BatchSyncEngine::new(config, rx, locks, sink), tx)
    }

    fn target() -> SyncTarget {
        SyncTarget::new("1AbC", "Sheet1!A1")
    }

    #[tokio::test]
    async fn test_empty_rows_take_no_lock() {
        let sink = Arc::new(ScriptedSink::default());
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink.clone());

        let result = engine.sync(&target(), Vec::new()).await.unwrap();
        assert_eq!(result, SyncResult::empty());
        assert!(result.success);
        assert_eq!(sink.calls(), 0);
        assert!(!engine.locks().is_locked("lock:google-sheets:1AbC").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected_before_empty_shortcut() {
        let sink = Arc::new(ScriptedSink::default());
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink);

        let err = engine.sync_with_batch_size(&target(), Vec::new(), 0).await.unwrap_err();
        assert_eq!(err, SyncError::InvalidBatchSize);
    }

    #[tokio::test]
    async fn test_batches_appended_in_order() {
        let sink = Arc::new(ScriptedSink::default());
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink.clone());

        let result = engine.sync(&target(), rows(250)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.total_rows, 250);
        assert_eq!(result.batches_processed, 3);
        let appended = sink.appended();
        let sizes: Vec<usize> = appended.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(appended.concat(), rows(250));
        assert!(!engine.locks().is_locked("lock:google-sheets:1AbC").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_success() {
        let sink = Arc::new(ScriptedSink::failing_first(2));
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink.clone());

        let started = Instant::now();
        let result = engine.sync(&target(), rows(10)).await.unwrap();

        assert!(result.success);
        assert_eq!(sink.calls(), 3);
        // 1s before the 2nd attempt, 2s before the 3rd
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_millis(3_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_does_not_abort_others() {
        // Batch 0 burns all 3 attempts, batch 1 succeeds
        let sink = Arc::new(ScriptedSink::failing_first(3));
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink.clone());

        let result = engine.sync_with_batch_size(&target(), rows(150), 100).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.batches_processed, 1);
        assert_eq!(result.failed_batches, 1);
        assert_eq!(result.errors[0].batch_index, 0);
        assert_eq!(result.errors[0].attempts, 3);
        assert!(matches!(result.errors[0].cause, BatchFailure::Sink(SinkError::Status { status: 503, .. })));
        assert_eq!(sink.appended(), vec![rows(150)[100..].to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_mid_sync_skips_remaining_batches() {
        let config = SyncCoreConfig {
            breaker_failure_threshold: 4,
            ..Default::default()
        };
        let sink = Arc::new(ScriptedSink::always_failing());
        let (engine, _tx) = engine_with(config, sink.clone());

        let result = engine.sync_with_batch_size(&target(), rows(40), 10).await.unwrap();

        // Batch 0: 3 failures. Batch 1: 4th failure opens the breaker.
        assert_eq!(sink.calls(), 4);
        assert_eq!(engine.breaker().state(), CircuitState::Open);
        assert_eq!(result.failed_batches, 4);
        assert_eq!(result.batches_processed, 0);
        assert!(matches!(result.errors[0].cause, BatchFailure::Sink(_)));
        assert_eq!(result.errors[1].attempts, 1);
        assert!(matches!(
            result.errors[1].cause,
            BatchFailure::CircuitOpen { last_error: Some(_) }
        ));
        assert_eq!(result.errors[2].cause, BatchFailure::Skipped);
        assert_eq!(result.errors[3].cause, BatchFailure::Skipped);
        assert_eq!(result.failed_indices(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_aborts_before_lock() {
        let config = SyncCoreConfig {
            breaker_failure_threshold: 1,
            max_retries: 1,
            ..Default::default()
        };
        let sink = Arc::new(ScriptedSink::failing_first(1));
        let (engine, _tx) = engine_with(config, sink.clone());

        let first = engine.sync(&target(), rows(5)).await.unwrap();
        assert!(!first.success);

        let err = engine.sync(&target(), rows(5)).await.unwrap_err();
        assert_eq!(err, SyncError::CircuitOpen { circuit: "scripted".into() });
        assert!(err.is_retryable());
        assert_eq!(sink.calls(), 1);

        // After the cooldown the trial goes through and closes the circuit
        tokio::time::advance(Duration::from_millis(30_000)).await;
        let recovered = engine.sync(&target(), rows(5)).await.unwrap();
        assert!(recovered.success);
        assert_eq!(engine.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_destination_times_out() {
        let sink = Arc::new(ScriptedSink::default());
        let (engine, _tx) = engine_with(SyncCoreConfig::default(), sink.clone());
        let _held = engine
            .locks()
            .acquire("lock:google-sheets:1AbC", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let err = engine.sync(&target(), rows(5)).await.unwrap_err();
        assert_eq!(err, SyncError::LockTimeout { resource: "lock:google-sheets:1AbC".into() });
        assert_eq!(sink.calls(), 0);

        // Other destinations are unaffected
        let other = SyncTarget::new("2XyZ", "Sheet1!A1");
        assert!(engine.sync(&other, rows(5)).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_config_updates_apply_to_next_sync() {
        let sink = Arc::new(ScriptedSink::default());
        let (engine, tx) = engine_with(SyncCoreConfig::default(), sink.clone());

        tx.send(SyncCoreConfig { batch_size: 2, ..Default::default() }).unwrap();
        let result = engine.sync(&target(), rows(5)).await.unwrap();
        assert_eq!(result.batches_processed, 3);

        // Invalid updates are ignored
        tx.send(SyncCoreConfig { batch_size: 0, ..Default::default() }).unwrap();
        assert_eq!(engine.config().batch_size, 2);
    }

    #[tokio::test]
    async fn test_registry_shares_breaker_between_engines() {
        let registry = CircuitRegistry::new();
        let (a, _tx_a) = engine_with(SyncCoreConfig::default(), Arc::new(ScriptedSink::default()));
        let (b, _tx_b) = engine_with(SyncCoreConfig::default(), Arc::new(ScriptedSink::default()));
        let a = a.with_registry(&registry);
        let b = b.with_registry(&registry);

        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
    }
}
