// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! The delay schedule is a pure function of the attempt number
//! ([`RetryConfig::delay_for_attempt`]) so it can be checked without sleeping.
//! Sleeping goes through `tokio::time`, which tests pause and advance.
//!
//! # Example
//!
//! ```
//! use sync_core::RetryConfig;
//! use std::time::Duration;
//!
//! // Batch dispatch: 3 attempts, 1s then 2s between them
//! let batch = RetryConfig::batch();
//! assert_eq!(batch.max_retries, Some(3));
//! assert_eq!(batch.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(batch.delay_for_attempt(2), Duration::from_secs(2));
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// `max_retries` counts total attempts, the first one included.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::batch()
    }
}

impl RetryConfig {
    /// Per-batch dispatch to the external append API.
    /// 3 attempts, 1s base delay doubling each time.
    #[must_use]
    pub fn batch() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual store commands (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// `initial_delay * factor^(retry - 1)`, capped at `max_delay`.
    /// Retry 0 means "first attempt" and never waits.
    #[must_use]
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Upper bound on total time spent sleeping across all retries.
    #[must_use]
    pub fn max_total_delay(&self) -> Option<Duration> {
        let attempts = self.max_retries?;
        let retries = u32::try_from(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        Some((1..=retries).map(|r| self.delay_for_attempt(r)).sum())
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts as usize >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for_attempt(attempts);
                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
