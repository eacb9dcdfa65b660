//! # Sorted First/Last Operator
//!
//! Per-slot single-winner selection by a sort column, for append-only input.
//!
//! For every destination slot the operator keeps the row key of the row with
//! the smallest (`First`) or largest (`Last`) sort value seen so far, plus a
//! shadow copy of that sort value. Equal sort values are broken by row key
//! (smallest key for `First`, largest for `Last`), so the winner does not
//! depend on the order rows arrive in.
//!
//! The winning row key is written to a
//! [`GroupRedirectionTable`]; result columns read the winner's values through
//! it.
//!
//! Rows are never removed or modified. This is not a general first/last-by
//! maintainer: a removed winner would leave the slot pointing at a dead row.
//!
//! ## Example
//!
//! ```rust
//! use tally_core::batch::Run;
//! use tally_core::operator::{ChunkedOperator, SortedFirstOrLastOperator};
//!
//! let mut op = SortedFirstOrLastOperator::<i32>::first();
//! op.ensure_capacity(2);
//!
//! let mut ctx = op.make_context(4);
//! let values = [30, 10, 20, 5];
//! let row_keys = [0, 1, 2, 3];
//! let runs = [Run::new(0, 0, 3), Run::new(1, 3, 1)];
//! op.add_chunk(&mut ctx, &values, &row_keys, &runs).unwrap();
//!
//! assert_eq!(op.winner(0), Some(1));
//! assert_eq!(op.winner(1), Some(3));
//! assert_eq!(ctx.modified(), &[true, true]);
//! ```

use serde::{Deserialize, Serialize};

use super::{check_slot, ChunkedOperator, OperatorError, OperatorMetrics};
use crate::batch::{check_len, check_runs, BatchContext, RowKey, Run, Slot, NULL_ROW_KEY};
use crate::redirection::GroupRedirectionTable;
use crate::values::SortKey;

/// Which extreme the operator selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Smallest sort value; ties go to the smallest row key.
    First,
    /// Largest sort value; ties go to the largest row key.
    Last,
}

/// The empty-slot sentinel cannot name a winner.
fn check_row_keys(row_keys: &[RowKey]) -> Result<(), OperatorError> {
    if row_keys.contains(&NULL_ROW_KEY) {
        return Err(OperatorError::NullRowKey);
    }
    Ok(())
}

/// Current best candidate while scanning a run.
#[derive(Debug, Clone, Copy)]
enum Best {
    /// The slot's prior winner.
    Prior,
    /// A row of the current batch, by position.
    Row(usize),
}

/// Sorted first/last-by operator over sort values of type `T`.
pub struct SortedFirstOrLastOperator<T: SortKey> {
    /// Selection direction
    mode: SelectionMode,
    /// Slot → winning row key
    redirections: GroupRedirectionTable,
    /// Slot → sort value of the winning row, kept in step with `redirections`
    sort_values: Vec<T>,
    /// Operator metrics
    metrics: OperatorMetrics,
}

impl<T: SortKey> SortedFirstOrLastOperator<T> {
    /// Creates an operator with no slots.
    #[must_use]
    pub fn new(mode: SelectionMode) -> Self {
        Self {
            mode,
            redirections: GroupRedirectionTable::new(),
            sort_values: Vec::new(),
            metrics: OperatorMetrics::new(),
        }
    }

    /// Creates a first-by operator.
    #[must_use]
    pub fn first() -> Self {
        Self::new(SelectionMode::First)
    }

    /// Creates a last-by operator.
    #[must_use]
    pub fn last() -> Self {
        Self::new(SelectionMode::Last)
    }

    /// Returns the selection mode.
    #[must_use]
    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Creates scratch state for batches of up to `chunk_capacity` rows.
    ///
    /// Selection produces one modified flag per run and no per-row output.
    #[must_use]
    pub fn make_context(&self, chunk_capacity: usize) -> BatchContext<()> {
        BatchContext::new(chunk_capacity)
    }

    /// Processes a bucketed batch.
    ///
    /// `values` and `row_keys` are parallel views over the batch; `runs`
    /// partitions it by destination slot. Writes one modified flag per run
    /// into `ctx`.
    ///
    /// # Errors
    ///
    /// - [`OperatorError::BatchTooLarge`] if the batch exceeds the context
    /// - [`OperatorError::LengthMismatch`] if the views differ in length
    /// - [`OperatorError::NullRowKey`] if a row key is [`NULL_ROW_KEY`]
    /// - [`OperatorError::RunOutOfBounds`] if a run leaves the batch
    /// - [`OperatorError::Capacity`] if a run targets an unensured slot;
    ///   runs before it are already applied
    pub fn add_chunk(
        &mut self,
        ctx: &mut BatchContext<()>,
        values: &[T],
        row_keys: &[RowKey],
        runs: &[Run],
    ) -> Result<(), OperatorError> {
        check_len("row_keys", row_keys.len(), values.len())?;
        check_row_keys(row_keys)?;
        check_runs(runs, values.len())?;
        ctx.begin(values.len())?;

        for run in runs {
            check_slot(run.destination, self.redirections.capacity())?;
            let modified = self.add_run(values, row_keys, run);
            self.metrics.record_run(run.len, modified);
            ctx.push_modified(modified);
        }
        Ok(())
    }

    /// Processes a batch whose rows all target `destination`.
    ///
    /// Returns true if the slot's winner changed.
    ///
    /// # Errors
    ///
    /// [`OperatorError::LengthMismatch`], [`OperatorError::NullRowKey`] or
    /// [`OperatorError::Capacity`].
    pub fn add_chunk_singleton(
        &mut self,
        values: &[T],
        row_keys: &[RowKey],
        destination: Slot,
    ) -> Result<bool, OperatorError> {
        check_len("row_keys", row_keys.len(), values.len())?;
        check_row_keys(row_keys)?;
        check_slot(destination, self.redirections.capacity())?;
        let run = Run::new(destination, 0, values.len());
        let modified = self.add_run(values, row_keys, &run);
        self.metrics.record_run(run.len, modified);
        Ok(modified)
    }

    fn add_run(&mut self, values: &[T], row_keys: &[RowKey], run: &Run) -> bool {
        if run.is_empty() {
            return false;
        }
        let destination = run.destination;
        let initial = self.redirections.get(destination);

        let (mut best, mut best_key, scan_from) = match initial {
            Some(key) => (Best::Prior, key, run.start),
            None => (Best::Row(run.start), row_keys[run.start], run.start + 1),
        };

        for position in scan_from..run.start + run.len {
            let key = row_keys[position];
            let best_value = match best {
                Best::Prior => &self.sort_values[destination],
                Best::Row(row) => &values[row],
            };
            let comparison = values[position].compare(best_value);
            let better = match self.mode {
                SelectionMode::First => comparison.is_lt() || (comparison.is_eq() && key < best_key),
                SelectionMode::Last => comparison.is_gt() || (comparison.is_eq() && key > best_key),
            };
            if better {
                best = Best::Row(position);
                best_key = key;
            }
        }

        match best {
            Best::Row(row) if initial != Some(best_key) => {
                self.redirections.set(destination, best_key);
                self.sort_values[destination] = values[row].clone();
                true
            }
            _ => false,
        }
    }

    /// Returns the winning row key of `slot`, or `None` if it has none.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is beyond the ensured capacity.
    #[must_use]
    pub fn winner(&self, slot: Slot) -> Option<RowKey> {
        self.redirections.get(slot)
    }

    /// Returns the sort value of the winning row of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is beyond the ensured capacity.
    #[must_use]
    pub fn sort_value(&self, slot: Slot) -> Option<&T> {
        self.redirections
            .get(slot)
            .map(|_| &self.sort_values[slot])
    }

    /// Returns the redirection table.
    #[must_use]
    pub fn redirections(&self) -> &GroupRedirectionTable {
        &self.redirections
    }
}

impl<T: SortKey> ChunkedOperator for SortedFirstOrLastOperator<T> {
    fn name(&self) -> &'static str {
        match self.mode {
            SelectionMode::First => "sorted_first",
            SelectionMode::Last => "sorted_last",
        }
    }

    fn ensure_capacity(&mut self, slot_count: usize) {
        self.redirections.ensure_capacity(slot_count);
        if slot_count > self.sort_values.len() {
            self.sort_values.resize(slot_count, T::null());
        }
    }

    fn slot_capacity(&self) -> usize {
        self.redirections.capacity()
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{NULL_CHAR, NULL_DOUBLE, NULL_INT};

    fn ch(c: char) -> u16 {
        u16::try_from(u32::from(c)).unwrap()
    }

    fn operator<T: SortKey>(mode: SelectionMode, slots: usize) -> SortedFirstOrLastOperator<T> {
        let mut op = SortedFirstOrLastOperator::new(mode);
        op.ensure_capacity(slots);
        op
    }

    #[test]
    fn test_first_picks_minimum() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        let modified = op
            .add_chunk_singleton(&[5, 3, 8, 3], &[10, 11, 12, 13], 0)
            .unwrap();
        assert!(modified);
        assert_eq!(op.winner(0), Some(11));
        assert_eq!(op.sort_value(0), Some(&3));
    }

    #[test]
    fn test_last_picks_maximum_with_largest_key() {
        let mut op = operator::<i32>(SelectionMode::Last, 1);
        op.add_chunk_singleton(&[5, 8, 3, 8], &[10, 11, 12, 13], 0)
            .unwrap();
        assert_eq!(op.winner(0), Some(13));
        assert_eq!(op.sort_value(0), Some(&8));
    }

    #[test]
    fn test_prior_winner_replaced_by_smaller_value_and_key() {
        let mut op = operator::<u16>(SelectionMode::First, 1);
        op.add_chunk_singleton(&[ch('b')], &[5], 0).unwrap();
        assert_eq!(op.winner(0), Some(5));

        let modified = op
            .add_chunk_singleton(&[ch('a'), ch('a')], &[2, 9], 0)
            .unwrap();
        assert!(modified);
        assert_eq!(op.winner(0), Some(2));
        assert_eq!(op.sort_value(0), Some(&ch('a')));
    }

    #[test]
    fn test_run_ordered_after_tie_keeps_prior_winner() {
        let mut op = operator::<u16>(SelectionMode::First, 1);
        op.add_chunk_singleton(&[ch('a')], &[2], 0).unwrap();
        let modified = op.add_chunk_singleton(&[ch('a')], &[9], 0).unwrap();
        assert!(!modified);
        assert_eq!(op.winner(0), Some(2));
    }

    #[test]
    fn test_worse_values_report_unmodified() {
        let mut op = operator::<i64>(SelectionMode::Last, 1);
        op.add_chunk_singleton(&[100], &[1], 0).unwrap();
        let modified = op.add_chunk_singleton(&[50, 99], &[2, 3], 0).unwrap();
        assert!(!modified);
        assert_eq!(op.winner(0), Some(1));
    }

    #[test]
    fn test_empty_run_is_unmodified() {
        let mut op = operator::<i32>(SelectionMode::First, 2);
        let mut ctx = op.make_context(4);
        op.add_chunk(&mut ctx, &[1], &[0], &[Run::new(1, 0, 0), Run::new(0, 0, 1)])
            .unwrap();
        assert_eq!(ctx.modified(), &[false, true]);
        assert_eq!(op.winner(1), None);
        assert_eq!(op.sort_value(1), None);
    }

    #[test]
    fn test_bucketed_runs() {
        let mut op = operator::<f64>(SelectionMode::First, 3);
        let mut ctx = op.make_context(8);
        let values = [2.0, 1.0, 7.0, 6.0, 9.0];
        let keys = [0, 1, 2, 3, 4];
        let runs = [Run::new(2, 0, 2), Run::new(0, 2, 2), Run::new(1, 4, 1)];
        op.add_chunk(&mut ctx, &values, &keys, &runs).unwrap();
        assert_eq!(ctx.modified(), &[true, true, true]);
        assert_eq!(op.winner(2), Some(1));
        assert_eq!(op.winner(0), Some(3));
        assert_eq!(op.winner(1), Some(4));

        let runs = [Run::new(0, 0, 1), Run::new(1, 1, 1)];
        op.add_chunk(&mut ctx, &[10.0, 8.0], &[5, 6], &runs).unwrap();
        assert_eq!(ctx.modified(), &[false, true]);
        assert_eq!(op.winner(1), Some(6));
        assert_eq!(op.metrics().runs_processed, 5);
        assert_eq!(op.metrics().slots_modified, 4);
    }

    #[test]
    fn test_nulls_sort_first() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        op.add_chunk_singleton(&[4, NULL_INT, 2], &[0, 1, 2], 0)
            .unwrap();
        assert_eq!(op.winner(0), Some(1));

        let mut op = operator::<u16>(SelectionMode::Last, 1);
        op.add_chunk_singleton(&[NULL_CHAR, ch('c')], &[0, 1], 0)
            .unwrap();
        assert_eq!(op.winner(0), Some(1));

        let mut op = operator::<f64>(SelectionMode::Last, 1);
        op.add_chunk_singleton(&[1.0, f64::NAN, NULL_DOUBLE], &[0, 1, 2], 0)
            .unwrap();
        assert_eq!(op.winner(0), Some(1));
    }

    #[test]
    fn test_string_sort_values() {
        let mut op = operator::<Option<String>>(SelectionMode::First, 1);
        let values = vec![Some("pear".to_string()), Some("apple".to_string()), None];
        op.add_chunk_singleton(&values[..2], &[0, 1], 0).unwrap();
        assert_eq!(op.sort_value(0), Some(&Some("apple".to_string())));
        op.add_chunk_singleton(&values[2..], &[2], 0).unwrap();
        assert_eq!(op.winner(0), Some(2));
    }

    #[test]
    fn test_capacity_violation_fails_fast() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        let mut ctx = op.make_context(4);
        let err = op
            .add_chunk(&mut ctx, &[1, 2], &[0, 1], &[Run::new(0, 0, 1), Run::new(5, 1, 1)])
            .unwrap_err();
        assert!(matches!(err, OperatorError::Capacity { slot: 5, capacity: 1 }));
        // Runs before the violation stay applied.
        assert_eq!(op.winner(0), Some(0));
        assert!(matches!(
            op.add_chunk_singleton(&[1], &[0], 1),
            Err(OperatorError::Capacity { .. })
        ));
    }

    #[test]
    fn test_mismatched_views_rejected() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        assert!(matches!(
            op.add_chunk_singleton(&[1, 2], &[0], 0),
            Err(OperatorError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_sentinel_row_key_rejected() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        op.add_chunk_singleton(&[5], &[4], 0).unwrap();

        assert!(matches!(
            op.add_chunk_singleton(&[1], &[NULL_ROW_KEY], 0),
            Err(OperatorError::NullRowKey)
        ));
        let mut ctx = op.make_context(2);
        assert!(matches!(
            op.add_chunk(&mut ctx, &[1, 2], &[NULL_ROW_KEY, 9], &[Run::new(0, 0, 2)]),
            Err(OperatorError::NullRowKey)
        ));
        assert_eq!(op.winner(0), Some(4));
        assert_eq!(op.sort_value(0), Some(&5));
    }

    #[test]
    fn test_ensure_capacity_keeps_winners() {
        let mut op = operator::<i32>(SelectionMode::First, 1);
        op.add_chunk_singleton(&[3], &[7], 0).unwrap();
        op.ensure_capacity(1);
        op.ensure_capacity(16);
        assert_eq!(op.slot_capacity(), 16);
        assert_eq!(op.winner(0), Some(7));
        assert_eq!(op.redirections().occupied(), 1);
        assert_eq!(op.name(), "sorted_first");
    }
}
