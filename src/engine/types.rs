// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Result and error types for sync runs.

use thiserror::Error;

use crate::batching::InvalidBatchSize;
use crate::lock::LockError;
use crate::sink::SinkError;

/// Why one batch did not reach the destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchFailure {
    /// Every attempt was rejected by the destination
    #[error(transparent)]
    Sink(SinkError),
    /// The breaker stopped further attempts for this batch
    #[error("circuit open{}", last_error_suffix(.last_error))]
    CircuitOpen { last_error: Option<SinkError> },
    /// Never dispatched because the circuit opened earlier in the same sync
    #[error("skipped: circuit open")]
    Skipped,
}

fn last_error_suffix(last_error: &Option<SinkError>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// A failed batch as reported in [`SyncResult::errors`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("batch {batch_index} failed after {attempts} attempt(s): {cause}")]
pub struct BatchDispatchError {
    pub batch_index: usize,
    /// Dispatch attempts actually made (0 for skipped batches)
    pub attempts: u32,
    pub cause: BatchFailure,
}

/// Aggregate outcome of one `sync` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub total_rows: usize,
    /// Batches that reached the destination
    pub batches_processed: usize,
    pub failed_batches: usize,
    /// One entry per failed batch, in batch order
    pub errors: Vec<BatchDispatchError>,
    /// `failed_batches == 0`
    pub success: bool,
}

impl SyncResult {
    /// Result for an empty input: nothing to do, nothing failed.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub(crate) fn new(total_rows: usize) -> Self {
        Self {
            total_rows,
            ..Self::empty()
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.batches_processed += 1;
    }

    pub(crate) fn record_failure(&mut self, error: BatchDispatchError) {
        self.failed_batches += 1;
        self.success = false;
        self.errors.push(error);
    }

    /// Indices of the batches that need re-submission.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.errors.iter().map(|e| e.batch_index).collect()
    }
}

/// Why a sync call did not run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,
    /// Another sync holds the destination. Retry later.
    #[error("destination lock '{resource}' is held by another sync")]
    LockTimeout { resource: String },
    /// The destination's breaker is open. Retry after its cooldown.
    #[error("circuit '{circuit}' is open, sync not started")]
    CircuitOpen { circuit: String },
    #[error(transparent)]
    Lock(LockError),
}

impl SyncError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidBatchSize => false,
            Self::LockTimeout { .. } | Self::CircuitOpen { .. } => true,
            Self::Lock(e) => e.is_retryable(),
        }
    }

    /// Suggested HTTP status code for this error
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidBatchSize => 400,
            Self::LockTimeout { .. } | Self::CircuitOpen { .. } => 503,
            Self::Lock(e) => e.http_status_code(),
        }
    }
}

impl From<InvalidBatchSize> for SyncError {
    fn from(_: InvalidBatchSize) -> Self {
        Self::InvalidBatchSize
    }
}

impl From<LockError> for SyncError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { resource, .. } => Self::LockTimeout { resource },
            other => Self::Lock(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_tracks_failures_in_order() {
        let mut result = SyncResult::new(250);
        result.record_success();
        result.record_failure(BatchDispatchError {
            batch_index: 1,
            attempts: 3,
            cause: BatchFailure::Sink(SinkError::Transport("reset".into())),
        });
        result.record_failure(BatchDispatchError {
            batch_index: 2,
            attempts: 0,
            cause: BatchFailure::Skipped,
        });

        assert!(!result.success);
        assert_eq!(result.batches_processed, 1);
        assert_eq!(result.failed_batches, 2);
        assert_eq!(result.failed_indices(), vec![1, 2]);
    }

    #[test]
    fn test_error_messages() {
        let err = BatchDispatchError {
            batch_index: 7,
            attempts: 2,
            cause: BatchFailure::CircuitOpen {
                last_error: Some(SinkError::Status { status: 500, body: "boom".into() }),
            },
        };
        assert_eq!(
            err.to_string(),
            "batch 7 failed after 2 attempt(s): circuit open (last error: append rejected with HTTP 500: boom)"
        );
        assert_eq!(BatchFailure::CircuitOpen { last_error: None }.to_string(), "circuit open");
    }

    #[test]
    fn test_lock_timeout_maps_to_contention() {
        let err = SyncError::from(LockError::Timeout { resource: "lock:google-sheets:1AbC".into(), attempts: 3 });
        assert_eq!(err, SyncError::LockTimeout { resource: "lock:google-sheets:1AbC".into() });
        assert!(err.is_retryable());
        assert_eq!(err.http_status_code(), 503);

        let err = SyncError::from(LockError::InvalidTtl);
        assert!(matches!(err, SyncError::Lock(LockError::InvalidTtl)));
        assert!(!err.is_retryable());
    }
}
