// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-size batching of rows for bulk appends.
//!
//! The external append API caps request size, so a sync of `N` rows is cut
//! into `ceil(N / B)` consecutive slices. Every slice but the last holds
//! exactly `B` rows and concatenating the slices gives back the input.
//!
//! # Example
//!
//! ```
//! use sync_core::batching::split_into_batches;
//!
//! let rows: Vec<u32> = (0..150).collect();
//! let batches = split_into_batches(rows, 100).unwrap();
//!
//! assert_eq!(batches.len(), 2);
//! assert_eq!(batches[0].len(), 100);
//! assert_eq!(batches[1].len(), 50);
//! assert_eq!(batches[1].index, 1);
//! ```

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("batch size must be greater than zero")]
pub struct InvalidBatchSize;

/// A consecutive slice of the input, tagged with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<R> {
    /// 0-based position in the batch sequence
    pub index: usize,
    pub rows: Vec<R>,
}

impl<R> Batch<R> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Number of batches `split_into_batches` produces for `rows` rows.
#[must_use]
pub fn batch_count(rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        rows.div_ceil(batch_size)
    }
}

/// Cut `rows` into consecutive batches of `batch_size`, preserving order.
///
/// An empty input yields no batches. A zero `batch_size` is rejected.
pub fn split_into_batches<R>(rows: Vec<R>, batch_size: usize) -> Result<Vec<Batch<R>>, InvalidBatchSize> {
    if batch_size == 0 {
        return Err(InvalidBatchSize);
    }

    let total = rows.len();
    let mut batches = Vec::with_capacity(batch_count(total, batch_size));
    let mut remaining = rows.into_iter().peekable();
    while remaining.peek().is_some() {
        let index = batches.len();
        let rows: Vec<R> = remaining.by_ref().take(batch_size).collect();
        batches.push(Batch { index, rows });
    }

    debug!(rows = total, batch_size, batches = batches.len(), "Rows split into batches");
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes<R>(batches: &[Batch<R>]) -> Vec<usize> {
        batches.iter().map(Batch::len).collect()
    }

    #[test]
    fn test_empty_input_yields_no_batches() {
        let batches = split_into_batches(Vec::<u32>::new(), 100).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_uneven_split() {
        let batches = split_into_batches((0..150).collect::<Vec<u32>>(), 100).unwrap();
        assert_eq!(sizes(&batches), vec![100, 50]);
    }

    #[test]
    fn test_exact_multiple() {
        let batches = split_into_batches((0..100).collect::<Vec<u32>>(), 100).unwrap();
        assert_eq!(sizes(&batches), vec![100]);
    }

    #[test]
    fn test_one_over() {
        let batches = split_into_batches((0..101).collect::<Vec<u32>>(), 100).unwrap();
        assert_eq!(sizes(&batches), vec![100, 1]);
        assert_eq!(batches[1].rows, vec![100]);
    }

    #[test]
    fn test_indices_are_sequential() {
        let batches = split_into_batches((0..25).collect::<Vec<u32>>(), 10).unwrap();
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert_eq!(split_into_batches(vec![1, 2, 3], 0), Err(InvalidBatchSize));
        assert_eq!(batch_count(3, 0), 0);
    }

    #[test]
    fn test_batch_count_matches_split() {
        for (rows, size) in [(0, 5), (1, 5), (5, 5), (6, 5), (99, 7)] {
            let batches = split_into_batches(vec![(); rows], size).unwrap();
            assert_eq!(batches.len(), batch_count(rows, size));
        }
    }
}
