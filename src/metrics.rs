// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for sync-core.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sync_core_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: shared, local
//! - `outcome`: acquired, contended, released, stale, success, failure, rejected
//! - `circuit`: breaker name

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// LOCKS - Acquisition, release and fallback
// ═══════════════════════════════════════════════════════════════════════════

/// Record a single acquisition attempt
pub fn record_lock_acquire(backend: &str, outcome: &str) {
    counter!(
        "sync_core_lock_acquire_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a release (released = entry deleted, stale = token no longer matched)
pub fn record_lock_release(backend: &str, outcome: &str) {
    counter!(
        "sync_core_lock_release_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a fall back from the shared store to the local table
pub fn record_lock_fallback(operation: &str) {
    counter!(
        "sync_core_lock_fallback_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record `with_lock` giving up after all attempts
pub fn record_lock_timeout() {
    counter!("sync_core_lock_timeouts_total").increment(1);
}

/// Record time spent waiting to acquire a lock
pub fn record_lock_wait(duration: Duration) {
    histogram!("sync_core_lock_wait_seconds").record(duration.as_secs_f64());
}

/// Record time a lock was held by `with_lock`
pub fn record_lock_held(duration: Duration) {
    histogram!("sync_core_lock_held_seconds").record(duration.as_secs_f64());
}

/// Set live entries in the local fallback table
pub fn set_local_lock_entries(count: usize) {
    gauge!("sync_core_local_lock_entries").set(count as f64);
}

/// Record expired local entries removed by the sweeper
pub fn record_locks_swept(count: usize) {
    counter!("sync_core_locks_swept_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH - Connection status
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "sync_core_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "sync_core_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "sync_core_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCH SYNC - Dispatch progress
// ═══════════════════════════════════════════════════════════════════════════

/// Record the final outcome of one batch
pub fn record_batch_outcome(outcome: &str) {
    counter!(
        "sync_core_batches_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retry of a batch dispatch
pub fn record_batch_retry() {
    counter!("sync_core_batch_retries_total").increment(1);
}

/// Record batch size in rows
pub fn record_batch_size(rows: usize) {
    histogram!("sync_core_batch_rows").record(rows as f64);
}

/// Record rows appended to the destination
pub fn record_rows_synced(count: usize) {
    counter!("sync_core_rows_synced_total").increment(count as u64);
}

/// Record the outcome of a whole sync call
pub fn record_sync(outcome: &str) {
    counter!(
        "sync_core_syncs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record latency of a timed operation
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "sync_core_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // These verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_record_lock_metrics() {
        record_lock_acquire("shared", "acquired");
        record_lock_acquire("local", "contended");
        record_lock_release("shared", "stale");
        record_lock_fallback("acquire");
        record_lock_wait(Duration::from_millis(250));
        set_local_lock_entries(3);
    }

    #[test]
    fn test_record_batch_metrics() {
        record_batch_outcome("success");
        record_batch_retry();
        record_batch_size(100);
        record_rows_synced(250);
        record_sync("partial");
    }

    #[test]
    fn test_latency_timer() {
        let _timer = LatencyTimer::new("sink", "append");
        std::thread::sleep(Duration::from_millis(1));
    }

    #[test]
    fn test_time_operation_records_histogram() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let _timer = crate::time_operation!("engine", "sync");
        });

        let recorded = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "sync_core_operation_seconds")
            .map(|(_, _, _, value)| value);

        assert!(matches!(recorded, Some(DebugValue::Histogram(samples)) if samples.len() == 1));
    }

    #[test]
    fn test_counter_visible_to_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_lock_fallback("acquire");
            record_lock_fallback("acquire");
        });

        let fallback = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "sync_core_lock_fallback_total")
            .map(|(_, _, _, value)| value);

        assert_eq!(fallback, Some(DebugValue::Counter(2)));
    }
}
