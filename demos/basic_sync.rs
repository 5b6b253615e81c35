// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic sync-core usage example.
//!
//! Demonstrates:
//! 1. Connecting the lock manager (Redis if `REDIS_URL` is set, local otherwise)
//! 2. Guarding a critical section with `with_lock`
//! 3. Syncing 250 rows in batches to a flaky destination
//! 4. Watching the circuit breaker trip and recover
//! 5. Displaying metrics (OTEL-compatible)
//!
//! Set `SHEETS_TOKEN` and `SHEETS_ID` to append to a real spreadsheet instead
//! of the in-process flaky destination.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_sync
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_sync
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use sync_core::lock::{lock_key, ESCROW};
use sync_core::{
    AppendRequest, AppendSink, BatchSyncEngine, HttpAppendSink, LockManager, Row, SinkError, SyncCoreConfig,
    SyncError, SyncTarget, ValueInputMode,
};
use tokio::sync::watch;

/// Destination that fails every `every`-th call.
struct FlakySheet {
    calls: AtomicU32,
    every: u32,
}

#[async_trait]
impl AppendSink for FlakySheet {
    fn name(&self) -> &str {
        "flaky_sheet"
    }

    async fn append(&self, request: &AppendRequest<'_>) -> Result<(), SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(15)).await;
        if self.every > 0 && call % self.every == 0 {
            println!("   │  ✗ call {call}: {} rows rejected (HTTP 503)", request.rows.len());
            return Err(SinkError::Status { status: 503, body: "backend unavailable".into() });
        }
        println!("   │  ✓ call {call}: {} rows appended to {}", request.rows.len(), request.range);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             sync-core: Basic Sync Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and connect the lock manager
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring sync-core...");

    let config = SyncCoreConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("demo:".into()),
        // Short backoff and cooldown so the demo finishes quickly
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        breaker_failure_threshold: 3,
        breaker_cooldown_ms: 500,
        ..Default::default()
    };
    config.validate()?;

    // Also starts the local table sweeper
    let locks = Arc::new(LockManager::connect(&config).await);
    println!(
        "   └─ Lock backend: {}",
        if locks.has_shared_store() { "Redis (shared)" } else { "process-local" }
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Guard a critical section
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔒 Settling escrow under a lock...");
    let key = lock_key(ESCROW, "escrow-17");
    let settled = locks
        .with_default_lock(&key, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "settled"
        })
        .await?;
    println!("   └─ {key}: {settled}, still locked: {}", locks.is_locked(&key).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Sync rows in batches
    // ─────────────────────────────────────────────────────────────────────────
    let (sink, target): (Arc<dyn AppendSink>, SyncTarget) =
        match (std::env::var("SHEETS_TOKEN"), std::env::var("SHEETS_ID")) {
            (Ok(token), Ok(id)) => (
                Arc::new(HttpAppendSink::new(token)?),
                SyncTarget::new(id, "Sheet1!A1").with_value_input(ValueInputMode::UserEntered),
            ),
            _ => (
                Arc::new(FlakySheet { calls: AtomicU32::new(0), every: 2 }),
                SyncTarget::new("demo-sheet", "Ledger!A1"),
            ),
        };

    let (config_tx, config_rx) = watch::channel(config.clone());
    let engine = BatchSyncEngine::new(config.clone(), config_rx, locks.clone(), sink);

    let rows: Vec<Row> = (0..250)
        .map(|i| vec![json!(format!("INV-{i:04}")), json!(i * 10), json!("paid")])
        .collect();

    println!("\n📝 Syncing {} rows (batch size {})...", rows.len(), config.batch_size);
    println!("   ┌─ Dispatch");
    let result = engine.sync(&target, rows.clone()).await?;
    println!("   └─ ok: {}, failed: {}", result.batches_processed, result.failed_batches);
    for error in &result.errors {
        println!("      └─ {error}");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Trip the breaker, then recover
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⚡ Smaller batches against the same flaky destination...");
    config_tx.send(SyncCoreConfig { batch_size: 25, ..config.clone() })?;
    println!("   ┌─ Dispatch");
    match engine.sync(&target, rows.clone()).await {
        Ok(result) => {
            println!("   └─ ok: {}, failed: {:?}", result.batches_processed, result.failed_indices());
        }
        Err(SyncError::CircuitOpen { circuit }) => println!("   └─ circuit '{circuit}' open, not started"),
        Err(e) => return Err(e.into()),
    }
    println!("   Breaker: {:?}", engine.breaker().metrics());

    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("\n🔁 After cooldown ({}): retrying one batch", engine.breaker().state());
    println!("   ┌─ Dispatch");
    let retry = engine.sync(&target, rows[..25].to_vec()).await;
    println!("   └─ {:?}, breaker now {}", retry.map(|r| r.success), engine.breaker().state());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump raw metrics (OTEL-compatible)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<(String, String)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("{v}"),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.4}", samples.len(), sum)
            }
        };
        lines.push((format!("{}{}", key.name(), label_str), rendered));
    }

    lines.sort();
    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for (name, value) in &lines {
        println!("   └─ {name} = {value}");
    }
}
