//! # Batch Processing
//!
//! The columnar contract between the grouping layer and the operators.
//!
//! An append batch arrives as parallel, read-only column views (row keys,
//! values, optional timestamps and weights) plus a partition of its rows into
//! contiguous [`Run`]s that share a destination slot. Operators write one
//! output per input row and one modified flag per run into a caller-owned
//! [`BatchContext`].
//!
//! ## Hot Path
//!
//! A context is sized once to the largest batch the engine will hand an
//! operator. Every call reuses its buffers, so processing a batch performs
//! no allocation. Batches longer than the context capacity are rejected.
//!
//! ## Arrow Boundary
//!
//! Columns are stored as `arrow_array` arrays with validity bitmaps. The
//! operators work on sentinel-encoded slices instead, so [`load_primitive`]
//! and [`load_decimal`] convert an array into a reusable view, and
//! [`BatchContext::publish_f64`] / [`BatchContext::publish_decimal`] turn the
//! outputs back into arrays for result-column publication.

use std::ops::Range;

use arrow_array::types::ArrowPrimitiveType;
use arrow_array::{
    Array, Decimal128Array, Float64Array, Int64Array, PrimitiveArray, StringArray,
};
use arrow_schema::DECIMAL128_MAX_PRECISION;
use rust_decimal::Decimal;

use crate::config::MAX_DECIMAL_SCALE;
use crate::operator::OperatorError;
use crate::values::NullValue;

/// Dense group identifier assigned by the grouping layer.
pub type Slot = usize;

/// Opaque, ordered identifier of a source row.
pub type RowKey = i64;

/// Sentinel for "no row": never a valid row key.
pub const NULL_ROW_KEY: RowKey = i64::MIN;

/// A contiguous run of batch rows sharing one destination slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Slot the rows aggregate into.
    pub destination: Slot,
    /// Position of the first row in the batch.
    pub start: usize,
    /// Number of rows.
    pub len: usize,
}

impl Run {
    /// Creates a run.
    #[must_use]
    pub fn new(destination: Slot, start: usize, len: usize) -> Self {
        Self {
            destination,
            start,
            len,
        }
    }

    /// Row positions covered by this run.
    #[inline]
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }

    /// Returns true if the run has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Splits a per-row destination column into contiguous runs.
///
/// Adjacent rows with the same destination form one run. The caller's vector
/// is cleared and reused.
pub fn partition_runs(destinations: &[Slot], runs: &mut Vec<Run>) {
    runs.clear();
    let mut start = 0;
    for (position, window) in destinations.windows(2).enumerate() {
        if window[0] != window[1] {
            runs.push(Run::new(window[0], start, position + 1 - start));
            start = position + 1;
        }
    }
    if let Some(&last) = destinations.last() {
        runs.push(Run::new(last, start, destinations.len() - start));
    }
}

/// Checks that every run lies within a batch of `len` rows.
pub(crate) fn check_runs(runs: &[Run], len: usize) -> Result<(), OperatorError> {
    let out_of_bounds = runs
        .iter()
        .find(|run| run.start.checked_add(run.len).map_or(true, |end| end > len));
    match out_of_bounds {
        Some(run) => Err(OperatorError::RunOutOfBounds {
            start: run.start,
            len: run.len,
            batch_len: len,
        }),
        None => Ok(()),
    }
}

/// Checks a parallel column view has the batch length.
pub(crate) fn check_len(column: &'static str, actual: usize, expected: usize) -> Result<(), OperatorError> {
    if actual == expected {
        Ok(())
    } else {
        Err(OperatorError::LengthMismatch {
            column,
            expected,
            actual,
        })
    }
}

/// Reusable per-call scratch state.
///
/// Holds one output per input row and one modified flag per run. Created by
/// an operator's `make_context` and owned by the caller; never shared across
/// threads while in use.
#[derive(Debug, Clone)]
pub struct BatchContext<O> {
    /// Per-row outputs (only the first `len` are meaningful)
    outputs: Vec<O>,
    /// Per-run modified flags for the last call
    modified: Vec<bool>,
    /// Rows in the last call
    len: usize,
}

impl<O: Clone + Default> BatchContext<O> {
    /// Creates a context able to hold batches of up to `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            outputs: vec![O::default(); capacity],
            modified: Vec::with_capacity(capacity),
            len: 0,
        }
    }
}

impl<O> BatchContext<O> {
    /// Largest batch this context accepts.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.outputs.len()
    }

    /// Outputs written by the last call, aligned with its input rows.
    #[must_use]
    pub fn outputs(&self) -> &[O] {
        &self.outputs[..self.len]
    }

    /// Modified flags written by the last bucketed call, one per run.
    #[must_use]
    pub fn modified(&self) -> &[bool] {
        &self.modified
    }

    /// Prepares the context for a batch of `len` rows.
    pub(crate) fn begin(&mut self, len: usize) -> Result<(), OperatorError> {
        if len > self.capacity() {
            return Err(OperatorError::BatchTooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        self.len = len;
        self.modified.clear();
        Ok(())
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut [O] {
        &mut self.outputs[..self.len]
    }

    pub(crate) fn push_modified(&mut self, modified: bool) {
        self.modified.push(modified);
    }
}

impl BatchContext<Option<f64>> {
    /// Publishes the outputs as a nullable `Float64Array`.
    #[must_use]
    pub fn publish_f64(&self) -> Float64Array {
        self.outputs().iter().collect()
    }
}

impl BatchContext<Option<Decimal>> {
    /// Publishes the outputs as a nullable `Decimal128Array` at `scale`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::DecimalScale`] if `scale` exceeds
    /// [`MAX_DECIMAL_SCALE`], the most digits a `Decimal` can carry.
    pub fn publish_decimal(&self, scale: u32) -> Result<Decimal128Array, OperatorError> {
        if scale > MAX_DECIMAL_SCALE {
            return Err(OperatorError::DecimalScale(i64::from(scale)));
        }
        let arrow_scale = i8::try_from(scale).map_err(|_| OperatorError::DecimalScale(i64::from(scale)))?;
        let array: Decimal128Array = self
            .outputs()
            .iter()
            .map(|value| {
                value.map(|mut value| {
                    value.rescale(scale);
                    value.mantissa()
                })
            })
            .collect();
        Ok(array.with_precision_and_scale(DECIMAL128_MAX_PRECISION, arrow_scale)?)
    }
}

/// Loads a primitive arrow array into a sentinel-encoded view.
///
/// Nulls become the type's [`NullValue::NULL`]. The view is cleared first
/// and keeps its allocation across calls.
pub fn load_primitive<P>(array: &PrimitiveArray<P>, view: &mut Vec<P::Native>)
where
    P: ArrowPrimitiveType,
    P::Native: NullValue,
{
    view.clear();
    view.extend(
        array
            .iter()
            .map(|value| value.unwrap_or(<P::Native as NullValue>::NULL)),
    );
}

/// Loads a `Decimal128Array` into a view of optional decimals.
///
/// # Errors
///
/// Returns [`OperatorError::DecimalScale`] for a negative arrow scale, or
/// [`OperatorError::Decimal`] if a value does not fit a `Decimal`.
pub fn load_decimal(
    array: &Decimal128Array,
    view: &mut Vec<Option<Decimal>>,
) -> Result<(), OperatorError> {
    let scale = u32::try_from(array.scale())
        .map_err(|_| OperatorError::DecimalScale(i64::from(array.scale())))?;
    view.clear();
    view.reserve(array.len());
    for value in array.iter() {
        let value = value
            .map(|mantissa| Decimal::try_from_i128_with_scale(mantissa, scale))
            .transpose()?;
        view.push(value);
    }
    Ok(())
}

/// Loads a `StringArray` sort column into a view of optional strings.
pub fn load_utf8(array: &StringArray, view: &mut Vec<Option<String>>) {
    view.clear();
    view.extend(array.iter().map(|value| value.map(str::to_owned)));
}

/// Loads a row-key column.
///
/// # Errors
///
/// Returns [`OperatorError::NullRowKey`] if any row key is null or equals
/// [`NULL_ROW_KEY`].
pub fn load_row_keys(array: &Int64Array, view: &mut Vec<RowKey>) -> Result<(), OperatorError> {
    if array.null_count() > 0 || array.values().contains(&NULL_ROW_KEY) {
        return Err(OperatorError::NullRowKey);
    }
    view.clear();
    view.extend_from_slice(array.values());
    Ok(())
}
