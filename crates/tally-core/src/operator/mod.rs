//! # Operator Module
//!
//! Per-column operators that maintain derived values per destination slot
//! as a table is appended to.
//!
//! ## Operator Families
//!
//! - **Selection**: [`SortedFirstOrLastOperator`] keeps, per slot, the row
//!   with the smallest or largest sort value, exposed through a
//!   [`GroupRedirectionTable`](crate::redirection::GroupRedirectionTable).
//! - **Cumulative**: [`EmOperator`] folds every row of a slot into an
//!   exponentially decayed value, per tick or per elapsed time.
//! - **Rolling**: [`RollingWAvgOperator`] keeps a weighted average over a
//!   trailing window of rows.
//!
//! All operators share the [`ChunkedOperator`] capacity contract, take their
//! scratch space from a caller-owned [`BatchContext`](crate::batch::BatchContext),
//! and report failures through [`OperatorError`].
//!
//! ## Failure Semantics
//!
//! State is updated row by row and never rolled back. When a batch fails
//! with [`OperatorError::BadData`], every row before the offending one is
//! already committed; the caller re-delivers the batch after fixing it.

use std::fmt;

pub mod em;
pub mod rolling_wavg;
pub mod sorted_first_last;
pub mod update_by;

pub use em::{DecayFn, EmOperator, EmState};
pub use rolling_wavg::RollingWAvgOperator;
pub use sorted_first_last::{SelectionMode, SortedFirstOrLastOperator};
pub use update_by::{UpdateByInput, UpdateByOperator, UpdateBySpec};

use crate::batch::Slot;

/// Why a row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadDataKind {
    /// The value was null.
    NullValue,
    /// The value was NaN.
    NaNValue,
}

impl fmt::Display for BadDataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullValue => write!(f, "null value"),
            Self::NaNValue => write!(f, "NaN value"),
        }
    }
}

/// Errors that can occur in operators.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// A row carried invalid data under the throw policy.
    #[error("Bad data in slot {slot} at row {position}: {kind}")]
    BadData {
        /// Destination slot of the row.
        slot: Slot,
        /// Position of the row in the batch.
        position: usize,
        /// What was wrong with it.
        kind: BadDataKind,
    },

    /// A slot beyond the ensured capacity was addressed.
    #[error("Slot {slot} exceeds ensured capacity {capacity}")]
    Capacity {
        /// Offending slot.
        slot: Slot,
        /// Capacity at the time of the call.
        capacity: usize,
    },

    /// A batch is longer than the context can hold.
    #[error("Batch of {len} rows exceeds context capacity {capacity}")]
    BatchTooLarge {
        /// Batch length.
        len: usize,
        /// Context capacity.
        capacity: usize,
    },

    /// A run reaches past the end of the batch.
    #[error("Run [{start}, {start}+{len}) exceeds batch of {batch_len} rows")]
    RunOutOfBounds {
        /// Run start.
        start: usize,
        /// Run length.
        len: usize,
        /// Batch length.
        batch_len: usize,
    },

    /// Parallel column views disagree in length.
    #[error("Column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        /// Column name.
        column: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A time-windowed operator was called without timestamps.
    #[error("Time-windowed operator requires a timestamp column")]
    MissingTimestamps,

    /// A weighted operator was called without weights.
    #[error("Weighted operator requires a weight column")]
    MissingWeights,

    /// A row-key column contained a null.
    #[error("Row key column contains nulls")]
    NullRowKey,

    /// A decimal scale outside the supported range.
    #[error("Unsupported decimal scale {0}")]
    DecimalScale(i64),

    /// Decimal conversion failed.
    #[error("Decimal conversion failed: {0}")]
    Decimal(#[from] rust_decimal::Error),

    /// Building an output array failed.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

/// Counters kept by every operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorMetrics {
    /// Rows folded or scanned.
    pub rows_processed: u64,
    /// Runs (slot partitions) processed.
    pub runs_processed: u64,
    /// Runs whose visible result changed.
    pub slots_modified: u64,
    /// Rows rejected as null or NaN.
    pub bad_rows: u64,
    /// Slots cleared by the reset policy.
    pub resets: u64,
    /// Time-decay factor recomputations.
    pub alpha_recomputations: u64,
}

impl OperatorMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one processed run.
    pub(crate) fn record_run(&mut self, rows: usize, modified: bool) {
        self.rows_processed += rows as u64;
        self.runs_processed += 1;
        if modified {
            self.slots_modified += 1;
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Capacity contract shared by every operator.
///
/// The coordinating thread calls [`ensure_capacity`](Self::ensure_capacity)
/// for the largest slot index of a batch before any operator processes it;
/// operators reject slots beyond that with [`OperatorError::Capacity`].
pub trait ChunkedOperator: Send {
    /// Short operator name, for logs.
    fn name(&self) -> &'static str;

    /// Grows per-slot state to address `slot_count` slots. Never shrinks.
    fn ensure_capacity(&mut self, slot_count: usize);

    /// Number of addressable slots.
    fn slot_capacity(&self) -> usize;

    /// Operator counters.
    fn metrics(&self) -> &OperatorMetrics;
}

/// Grows every operator in `operators` to `slot_count` slots.
pub fn ensure_capacity_all(operators: &mut [&mut dyn ChunkedOperator], slot_count: usize) {
    for operator in operators.iter_mut() {
        operator.ensure_capacity(slot_count);
    }
}

/// Fails with [`OperatorError::Capacity`] unless `slot < capacity`.
#[inline]
pub(crate) fn check_slot(slot: Slot, capacity: usize) -> Result<(), OperatorError> {
    if slot < capacity {
        Ok(())
    } else {
        Err(OperatorError::Capacity { slot, capacity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = OperatorError::BadData {
            slot: 3,
            position: 7,
            kind: BadDataKind::NullValue,
        };
        assert_eq!(err.to_string(), "Bad data in slot 3 at row 7: null value");

        let err = OperatorError::Capacity {
            slot: 9,
            capacity: 4,
        };
        assert_eq!(err.to_string(), "Slot 9 exceeds ensured capacity 4");
    }

    #[test]
    fn test_metrics_record_run() {
        let mut metrics = OperatorMetrics::new();
        metrics.record_run(5, true);
        metrics.record_run(2, false);
        assert_eq!(metrics.rows_processed, 7);
        assert_eq!(metrics.runs_processed, 2);
        assert_eq!(metrics.slots_modified, 1);
        metrics.reset();
        assert_eq!(metrics, OperatorMetrics::default());
    }

    #[test]
    fn test_check_slot() {
        assert!(check_slot(0, 1).is_ok());
        assert!(matches!(
            check_slot(1, 1),
            Err(OperatorError::Capacity {
                slot: 1,
                capacity: 1
            })
        ));
    }
}
