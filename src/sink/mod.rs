// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destinations that accept bulk row appends.
//!
//! The engine only needs one operation from a destination: append these rows
//! to this range. [`AppendSink`] is that seam. [`HttpAppendSink`] talks to a
//! spreadsheet-style REST API; tests substitute in-memory sinks.

mod http;

pub use http::HttpAppendSink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of cells.
pub type Row = Vec<serde_json::Value>;

/// How the destination interprets submitted cell values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueInputMode {
    /// Stored as-is
    #[default]
    Raw,
    /// Parsed as if typed by a user (formulas, dates, numbers)
    UserEntered,
}

impl ValueInputMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::UserEntered => "USER_ENTERED",
        }
    }
}

/// Where a sync writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// Opaque destination handle (spreadsheet id); also the lock identifier
    pub destination_id: String,
    /// Range selector, e.g. `Sheet1!A1`
    pub range: String,
    #[serde(default)]
    pub value_input: ValueInputMode,
}

impl SyncTarget {
    pub fn new(destination_id: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            destination_id: destination_id.into(),
            range: range.into(),
            value_input: ValueInputMode::default(),
        }
    }

    #[must_use]
    pub fn with_value_input(mut self, mode: ValueInputMode) -> Self {
        self.value_input = mode;
        self
    }

    /// Borrow this target as an append of `rows`.
    #[must_use]
    pub fn request<'a>(&'a self, rows: &'a [Row]) -> AppendRequest<'a> {
        AppendRequest {
            destination: &self.destination_id,
            range: &self.range,
            value_input: self.value_input,
            rows,
        }
    }
}

/// A single append call.
#[derive(Debug, Clone, Copy)]
pub struct AppendRequest<'a> {
    pub destination: &'a str,
    pub range: &'a str,
    pub value_input: ValueInputMode,
    pub rows: &'a [Row],
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Destination answered with a non-success status
    #[error("append rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Request never got a response (DNS, connect, timeout, TLS)
    #[error("append transport error: {0}")]
    Transport(String),
    #[error("append failed: {0}")]
    Other(String),
}

impl SinkError {
    /// The engine retries every sink failure; the breaker decides when to stop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// A destination that appends rows.
#[async_trait]
pub trait AppendSink: Send + Sync {
    /// Short name used for logs, metrics and the breaker (e.g. "google_sheets").
    fn name(&self) -> &str;

    async fn append(&self, request: &AppendRequest<'_>) -> Result<(), SinkError>;
}
