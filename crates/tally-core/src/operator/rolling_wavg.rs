//! # Rolling Weighted Average
//!
//! Weighted arithmetic mean over a trailing window of rows per slot.
//!
//! Each row enters its slot's window as a `(value * weight, weight)` pair.
//! Rows whose value or weight is null enter as a null marker instead: they
//! occupy a place in the window, so expiry stays aligned with the rows that
//! were pushed, but never touch the running sums.
//!
//! NaN and infinite rows are valid: they make the average NaN or infinite
//! while they are in the window, and stop affecting it once they leave.
//!
//! The window can be driven two ways:
//!
//! - [`push`](RollingWAvgOperator::push) / [`pop`](RollingWAvgOperator::pop),
//!   when an outer windowing layer decides which rows enter and leave.
//! - [`accumulate`](RollingWAvgOperator::accumulate), which maintains a
//!   trailing window itself from the operator's [`RollingWindow`].

use std::collections::VecDeque;
use std::marker::PhantomData;

use super::{check_slot, ChunkedOperator, OperatorError, OperatorMetrics};
use crate::batch::{check_len, check_runs, BatchContext, Run, Slot};
use crate::config::{ConfigError, RollingWAvgSpec, RollingWindow};
use crate::values::{Classified, NullValue, NumericInput, NULL_DOUBLE, NULL_LONG};

/// One row inside a window.
#[derive(Debug, Clone, Copy)]
struct Entry {
    /// `value * weight`, or [`NULL_DOUBLE`] for a null marker
    weighted_value: f64,
    /// Row weight, or [`NULL_DOUBLE`] for a null marker
    weight: f64,
    /// Row timestamp, [`NULL_LONG`] when pushed without one
    timestamp: i64,
}

impl Entry {
    #[inline]
    fn is_null(&self) -> bool {
        self.weighted_value.is_null()
    }

    #[inline]
    fn is_finite(&self) -> bool {
        self.weighted_value.is_finite() && self.weight.is_finite()
    }
}

/// Neumaier-compensated running sum, so values that enter and later leave
/// the window cancel without leaving rounding residue.
#[derive(Debug, Clone, Copy, Default)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    #[inline]
    fn add(&mut self, value: f64) {
        let total = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - total) + value;
        } else {
            self.compensation += (value - total) + self.sum;
        }
        self.sum = total;
    }

    #[inline]
    fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Per-slot window contents and running sums.
///
/// The running sums cover finite entries only. NaN and infinite entries are
/// counted instead, and while any is in the window the average is computed
/// from the entries directly; once the last one leaves, the running sums are
/// exact again.
#[derive(Debug, Clone, Default)]
struct WAvgWindow {
    entries: VecDeque<Entry>,
    null_count: usize,
    /// Entries with a NaN or infinite weighted value or weight
    non_finite: usize,
    /// Finite entries with a non-zero weight
    weighted: usize,
    weighted_sum: CompensatedSum,
    weight_sum: CompensatedSum,
}

impl WAvgWindow {
    /// Appends a row, returning false if it entered as a null marker.
    fn push(&mut self, value: Classified<f64>, weight: f64, timestamp: i64) -> bool {
        let value = match value {
            Classified::Value(value) => value,
            Classified::NaN => f64::NAN,
            Classified::Null => NULL_DOUBLE,
        };
        if value.is_null() || weight.is_null() {
            self.entries.push_back(Entry {
                weighted_value: NULL_DOUBLE,
                weight: NULL_DOUBLE,
                timestamp,
            });
            self.null_count += 1;
            return false;
        }
        let entry = Entry {
            weighted_value: value * weight,
            weight,
            timestamp,
        };
        if !entry.is_finite() {
            self.non_finite += 1;
        } else {
            if entry.weight != 0.0 {
                self.weighted += 1;
            }
            self.weighted_sum.add(entry.weighted_value);
            self.weight_sum.add(entry.weight);
        }
        self.entries.push_back(entry);
        true
    }

    fn pop_front(&mut self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        if entry.is_null() {
            self.null_count -= 1;
        } else if !entry.is_finite() {
            self.non_finite -= 1;
        } else {
            if entry.weight != 0.0 {
                self.weighted -= 1;
            }
            self.weighted_sum.add(-entry.weighted_value);
            self.weight_sum.add(-entry.weight);
        }
        if self.weighted == 0 {
            self.weighted_sum = CompensatedSum::default();
            self.weight_sum = CompensatedSum::default();
        }
        Some(entry)
    }

    /// Removes entries with `timestamp <= cutoff` from the front.
    fn evict_through(&mut self, cutoff: i64) {
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.timestamp <= cutoff)
        {
            self.pop_front();
        }
    }

    fn average(&self) -> Option<f64> {
        if self.null_count == self.entries.len() {
            return None;
        }
        let (weighted_sum, weight_sum) = if self.non_finite > 0 {
            self.entries
                .iter()
                .filter(|entry| !entry.is_null())
                .fold((0.0, 0.0), |(values, weights), entry| {
                    (values + entry.weighted_value, weights + entry.weight)
                })
        } else if self.weighted == 0 {
            return None;
        } else {
            (self.weighted_sum.value(), self.weight_sum.value())
        };
        if weight_sum == 0.0 {
            return None;
        }
        Some(weighted_sum / weight_sum)
    }
}

fn same_average(lhs: Option<f64>, rhs: Option<f64>) -> bool {
    match (lhs, rhs) {
        (None, None) => true,
        (Some(lhs), Some(rhs)) => lhs.to_bits() == rhs.to_bits(),
        _ => false,
    }
}

/// Rolling weighted average over values of type `V` and `f64` weights.
///
/// # Example
///
/// ```rust
/// use tally_core::config::RollingWAvgSpec;
/// use tally_core::operator::{ChunkedOperator, RollingWAvgOperator};
///
/// let mut op = RollingWAvgOperator::<f64>::new(RollingWAvgSpec::ticks(2)).unwrap();
/// op.ensure_capacity(1);
/// let mut ctx = op.make_context(8);
/// op.accumulate(&mut ctx, 0, &[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0], None).unwrap();
/// assert_eq!(ctx.outputs(), &[Some(1.0), Some(1.5), Some(2.5)]);
/// ```
pub struct RollingWAvgOperator<V: NumericInput<Acc = f64>> {
    spec: RollingWAvgSpec,
    windows: Vec<WAvgWindow>,
    metrics: OperatorMetrics,
    _input: PhantomData<fn(V)>,
}

impl<V: NumericInput<Acc = f64>> RollingWAvgOperator<V> {
    /// Creates an operator from a spec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the window is empty.
    pub fn new(spec: RollingWAvgSpec) -> Result<Self, ConfigError> {
        spec.validate()?;
        Ok(Self {
            spec,
            windows: Vec::new(),
            metrics: OperatorMetrics::new(),
            _input: PhantomData,
        })
    }

    /// Returns the operator spec.
    #[must_use]
    pub fn spec(&self) -> &RollingWAvgSpec {
        &self.spec
    }

    /// Creates scratch state for batches of up to `chunk_capacity` rows.
    #[must_use]
    pub fn make_context(&self, chunk_capacity: usize) -> BatchContext<Option<f64>> {
        BatchContext::new(chunk_capacity)
    }

    /// Appends rows `position..position + count` to `slot`'s window.
    ///
    /// A row with a null value or a null weight enters as a null marker and
    /// increments the slot's null count.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Capacity`], [`OperatorError::LengthMismatch`]
    /// or [`OperatorError::RunOutOfBounds`]; nothing is pushed on error.
    pub fn push(
        &mut self,
        slot: Slot,
        values: &[V],
        weights: &[f64],
        position: usize,
        count: usize,
    ) -> Result<(), OperatorError> {
        check_slot(slot, self.windows.len())?;
        check_len("weights", weights.len(), values.len())?;
        check_runs(&[Run::new(slot, position, count)], values.len())?;

        let window = &mut self.windows[slot];
        for row in position..position + count {
            if !window.push(values[row].classify(), weights[row], NULL_LONG) {
                self.metrics.bad_rows += 1;
            }
        }
        self.metrics.rows_processed += count as u64;
        Ok(())
    }

    /// Removes the `count` oldest entries of `slot`'s window.
    ///
    /// Returns how many entries were removed, which is less than `count` if
    /// the window held fewer.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Capacity`] if the slot is not addressable.
    pub fn pop(&mut self, slot: Slot, count: usize) -> Result<usize, OperatorError> {
        check_slot(slot, self.windows.len())?;
        let window = &mut self.windows[slot];
        let mut removed = 0;
        while removed < count && window.pop_front().is_some() {
            removed += 1;
        }
        Ok(removed)
    }

    /// Weighted average of the non-null entries in `slot`'s window.
    ///
    /// `None` when the window holds no non-null entry, the weights sum to
    /// zero, or the slot is not addressable.
    #[must_use]
    pub fn average(&self, slot: Slot) -> Option<f64> {
        self.windows.get(slot).and_then(WAvgWindow::average)
    }

    /// Number of entries in `slot`'s window, null markers included.
    #[must_use]
    pub fn window_len(&self, slot: Slot) -> usize {
        self.windows.get(slot).map_or(0, |window| window.entries.len())
    }

    /// Number of null markers in `slot`'s window.
    #[must_use]
    pub fn null_count(&self, slot: Slot) -> usize {
        self.windows.get(slot).map_or(0, |window| window.null_count)
    }

    /// Runs rows that all belong to `slot` through the trailing window.
    ///
    /// Each row is pushed, rows that fell out of the window are expired, and
    /// the resulting average is written as that row's output. Returns true if
    /// the slot's average changed.
    ///
    /// Tick windows keep the last `rev` rows. Time windows keep rows with
    /// `timestamp > t - rev_nanos`, where `t` is the current row's timestamp;
    /// a row with a null timestamp is not pushed.
    ///
    /// # Errors
    ///
    /// - [`OperatorError::MissingTimestamps`] for a time window without
    ///   timestamps
    /// - [`OperatorError::LengthMismatch`], [`OperatorError::Capacity`],
    ///   [`OperatorError::BatchTooLarge`]
    pub fn accumulate(
        &mut self,
        ctx: &mut BatchContext<Option<f64>>,
        slot: Slot,
        values: &[V],
        weights: &[f64],
        timestamps: Option<&[i64]>,
    ) -> Result<bool, OperatorError> {
        self.check_columns(values.len(), weights, timestamps)?;
        check_slot(slot, self.windows.len())?;
        ctx.begin(values.len())?;
        let modified = self.fold_run(
            &Run::new(slot, 0, values.len()),
            values,
            weights,
            timestamps,
            ctx.outputs_mut(),
        );
        Ok(modified)
    }

    /// Runs a bucketed batch through the trailing windows, one run per slot.
    ///
    /// # Errors
    ///
    /// As [`accumulate`](Self::accumulate), plus
    /// [`OperatorError::RunOutOfBounds`].
    pub fn accumulate_runs(
        &mut self,
        ctx: &mut BatchContext<Option<f64>>,
        values: &[V],
        weights: &[f64],
        timestamps: Option<&[i64]>,
        runs: &[Run],
    ) -> Result<(), OperatorError> {
        self.check_columns(values.len(), weights, timestamps)?;
        check_runs(runs, values.len())?;
        for run in runs {
            check_slot(run.destination, self.windows.len())?;
        }
        ctx.begin(values.len())?;
        for run in runs {
            let modified = self.fold_run(run, values, weights, timestamps, ctx.outputs_mut());
            ctx.push_modified(modified);
        }
        Ok(())
    }

    fn check_columns(
        &self,
        len: usize,
        weights: &[f64],
        timestamps: Option<&[i64]>,
    ) -> Result<(), OperatorError> {
        check_len("weights", weights.len(), len)?;
        match (self.spec.window, timestamps) {
            (RollingWindow::Time { .. }, None) => Err(OperatorError::MissingTimestamps),
            (RollingWindow::Time { .. }, Some(timestamps)) => {
                check_len("timestamps", timestamps.len(), len)
            }
            (RollingWindow::Ticks { .. }, _) => Ok(()),
        }
    }

    fn fold_run(
        &mut self,
        run: &Run,
        values: &[V],
        weights: &[f64],
        timestamps: Option<&[i64]>,
        outputs: &mut [Option<f64>],
    ) -> bool {
        let window = &mut self.windows[run.destination];
        let before = window.average();

        for position in run.range() {
            let value = values[position].classify();
            match self.spec.window {
                RollingWindow::Ticks { rev } => {
                    if !window.push(value, weights[position], NULL_LONG) {
                        self.metrics.bad_rows += 1;
                    }
                    while window.entries.len() > rev {
                        window.pop_front();
                    }
                }
                RollingWindow::Time { rev_nanos } => {
                    let timestamp = timestamps.map_or(NULL_LONG, |t| t[position]);
                    if !timestamp.is_null() {
                        if !window.push(value, weights[position], timestamp) {
                            self.metrics.bad_rows += 1;
                        }
                        window.evict_through(timestamp.saturating_sub(rev_nanos));
                    }
                }
            }
            outputs[position] = window.average();
        }

        let modified = !same_average(before, window.average());
        self.metrics.record_run(run.len, modified);
        modified
    }
}

impl<V: NumericInput<Acc = f64>> ChunkedOperator for RollingWAvgOperator<V> {
    fn name(&self) -> &'static str {
        "rolling_wavg"
    }

    fn ensure_capacity(&mut self, slot_count: usize) {
        if slot_count > self.windows.len() {
            self.windows.resize_with(slot_count, WAvgWindow::default);
        }
    }

    fn slot_capacity(&self) -> usize {
        self.windows.len()
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::NULL_INT;

    fn operator<V: NumericInput<Acc = f64>>(spec: RollingWAvgSpec) -> RollingWAvgOperator<V> {
        let mut op = RollingWAvgOperator::new(spec).unwrap();
        op.ensure_capacity(2);
        op
    }

    #[test]
    fn test_push_null_accounting() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(16));
        let values = [1.0, NULL_DOUBLE, 3.0, 4.0];
        let weights = [1.0, 2.0, NULL_DOUBLE, 2.0];

        op.push(0, &values, &weights, 0, 4).unwrap();
        assert_eq!(op.window_len(0), 4);
        assert_eq!(op.null_count(0), 2);
        assert_eq!(op.average(0), Some(3.0));
        assert_eq!(op.metrics().bad_rows, 2);
        assert_eq!(op.window_len(1), 0);
    }

    #[test]
    fn test_push_subrange() {
        let mut op = operator::<i32>(RollingWAvgSpec::ticks(16));
        let values = [100, 2, NULL_INT, 200];
        let weights = [1.0; 4];

        op.push(1, &values, &weights, 1, 2).unwrap();
        assert_eq!(op.window_len(1), 2);
        assert_eq!(op.null_count(1), 1);
        assert_eq!(op.average(1), Some(2.0));
    }

    #[test]
    fn test_pop_undoes_push() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(16));
        let values = [1.0, NULL_DOUBLE, 4.0];
        let weights = [1.0, 1.0, 2.0];
        op.push(0, &values, &weights, 0, 3).unwrap();

        assert_eq!(op.pop(0, 2).unwrap(), 2);
        assert_eq!(op.window_len(0), 1);
        assert_eq!(op.null_count(0), 0);
        assert_eq!(op.average(0), Some(4.0));

        assert_eq!(op.pop(0, 5).unwrap(), 1);
        assert_eq!(op.window_len(0), 0);
        assert_eq!(op.average(0), None);
    }

    #[test]
    fn test_average_none_cases() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(16));
        op.push(0, &[5.0], &[0.0], 0, 1).unwrap();
        assert_eq!(op.average(0), None);

        op.push(1, &[NULL_DOUBLE, 2.0], &[1.0, NULL_DOUBLE], 0, 2)
            .unwrap();
        assert_eq!(op.null_count(1), 2);
        assert_eq!(op.average(1), None);
        assert_eq!(op.average(7), None);
    }

    #[test]
    fn test_push_errors() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(4));
        assert!(matches!(
            op.push(2, &[1.0], &[1.0], 0, 1),
            Err(OperatorError::Capacity { slot: 2, .. })
        ));
        assert!(matches!(
            op.push(0, &[1.0, 2.0], &[1.0], 0, 1),
            Err(OperatorError::LengthMismatch {
                column: "weights",
                ..
            })
        ));
        assert!(matches!(
            op.push(0, &[1.0, 2.0], &[1.0, 1.0], 1, 2),
            Err(OperatorError::RunOutOfBounds { .. })
        ));
        assert_eq!(op.window_len(0), 0);
    }

    #[test]
    fn test_tick_window() {
        let mut op = operator::<i32>(RollingWAvgSpec::ticks(2));
        let mut ctx = op.make_context(8);

        let modified = op
            .accumulate(&mut ctx, 0, &[1, 2, 3, NULL_INT], &[1.0; 4], None)
            .unwrap();
        assert!(modified);
        assert_eq!(ctx.outputs(), &[Some(1.0), Some(1.5), Some(2.5), Some(3.0)]);
        assert_eq!(op.window_len(0), 2);
        assert_eq!(op.null_count(0), 1);
    }

    #[test]
    fn test_time_window() {
        let mut op = operator::<f64>(RollingWAvgSpec::time(10));
        let mut ctx = op.make_context(8);

        op.accumulate(
            &mut ctx,
            0,
            &[1.0, 2.0, 3.0, 4.0],
            &[1.0; 4],
            Some(&[0, 5, 10, 20]),
        )
        .unwrap();
        assert_eq!(ctx.outputs(), &[Some(1.0), Some(1.5), Some(2.5), Some(4.0)]);
        assert_eq!(op.window_len(0), 1);
    }

    #[test]
    fn test_null_timestamp_not_pushed() {
        let mut op = operator::<f64>(RollingWAvgSpec::time(10));
        let mut ctx = op.make_context(8);

        op.accumulate(
            &mut ctx,
            0,
            &[2.0, 8.0],
            &[1.0, 1.0],
            Some(&[0, NULL_LONG]),
        )
        .unwrap();
        assert_eq!(ctx.outputs(), &[Some(2.0), Some(2.0)]);
        assert_eq!(op.window_len(0), 1);
    }

    #[test]
    fn test_missing_timestamps() {
        let mut op = operator::<f64>(RollingWAvgSpec::time(10));
        let mut ctx = op.make_context(8);
        assert!(matches!(
            op.accumulate(&mut ctx, 0, &[1.0], &[1.0], None),
            Err(OperatorError::MissingTimestamps)
        ));
    }

    #[test]
    fn test_runs() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(3));
        let mut ctx = op.make_context(8);

        let runs = [Run::new(0, 0, 2), Run::new(1, 2, 1)];
        op.accumulate_runs(&mut ctx, &[1.0, 3.0, 10.0], &[1.0, 3.0, 1.0], None, &runs)
            .unwrap();
        assert_eq!(ctx.modified(), &[true, true]);
        assert_eq!(ctx.outputs(), &[Some(1.0), Some(2.5), Some(10.0)]);

        // A zero-weight row leaves the average where it was.
        let runs = [Run::new(1, 0, 1)];
        op.accumulate_runs(&mut ctx, &[50.0], &[0.0], None, &runs)
            .unwrap();
        assert_eq!(ctx.modified(), &[false]);
        assert_eq!(op.metrics().slots_modified, 2);
    }

    #[test]
    fn test_nan_leaves_window() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(2));
        let mut ctx = op.make_context(8);

        op.accumulate(&mut ctx, 0, &[f64::NAN, 1.0, 2.0, 3.0], &[1.0; 4], None)
            .unwrap();
        let outputs = ctx.outputs();
        assert!(outputs[0].unwrap().is_nan());
        assert!(outputs[1].unwrap().is_nan());
        assert_eq!(outputs[2], Some(1.5));
        assert_eq!(outputs[3], Some(2.5));
    }

    #[test]
    fn test_infinity_leaves_window() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(2));
        let mut ctx = op.make_context(8);

        op.accumulate(&mut ctx, 0, &[f64::INFINITY, 1.0, 2.0, 3.0], &[1.0; 4], None)
            .unwrap();
        assert_eq!(
            ctx.outputs(),
            &[Some(f64::INFINITY), Some(f64::INFINITY), Some(1.5), Some(2.5)]
        );

        // Large magnitudes passing through leave no residue behind.
        op.accumulate(&mut ctx, 0, &[1e17, 1.0, 2.0], &[1.0; 3], None)
            .unwrap();
        let outputs = ctx.outputs();
        assert!(outputs.iter().all(|output| output.is_some_and(f64::is_finite)));
        assert_eq!(outputs[2], Some(1.5));
    }

    #[test]
    fn test_popped_non_finite_weight() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(16));
        op.push(0, &[1.0, 4.0], &[f64::NAN, 2.0], 0, 2).unwrap();
        assert!(op.average(0).unwrap().is_nan());

        op.pop(0, 1).unwrap();
        assert_eq!(op.average(0), Some(4.0));
    }

    #[test]
    fn test_cancelled_weights_read_as_zero() {
        let mut op = operator::<f64>(RollingWAvgSpec::ticks(2));
        let mut ctx = op.make_context(8);

        op.accumulate(&mut ctx, 0, &[1.0; 4], &[0.1, 0.2, 0.0, 0.0], None)
            .unwrap();
        assert_eq!(ctx.outputs()[3], None);
    }

    #[test]
    fn test_invalid_spec() {
        assert!(RollingWAvgOperator::<f64>::new(RollingWAvgSpec::ticks(0)).is_err());
        assert!(RollingWAvgOperator::<f64>::new(RollingWAvgSpec::time(0)).is_err());
    }
}
