//! # Group Redirection
//!
//! Dense mapping from destination slot to the row key that currently
//! represents the slot's aggregate. Selection operators read the winner's
//! other columns through this table instead of copying them.
//!
//! The table only grows: slots are never removed because the operators that
//! own it see appended rows only.

use arrow_array::Int64Array;

use crate::batch::{RowKey, Slot, NULL_ROW_KEY};
use crate::operator::OperatorError;

/// Slot → winning row key, with [`NULL_ROW_KEY`] marking empty slots.
///
/// # Invariants
///
/// - An entry is either empty or holds the row key its owning operator last
///   chose for that slot.
/// - Capacity never shrinks; new slots start empty.
/// - Mutated only by the owning operator, one writer per slot.
#[derive(Debug, Clone, Default)]
pub struct GroupRedirectionTable {
    rows: Vec<RowKey>,
}

impl GroupRedirectionTable {
    /// Creates an empty table with no slots.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addressable slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    /// Grows the table to address at least `slot_count` slots.
    ///
    /// Idempotent; a smaller or equal `slot_count` is a no-op.
    pub fn ensure_capacity(&mut self, slot_count: usize) {
        if slot_count > self.rows.len() {
            tracing::trace!(
                from = self.rows.len(),
                to = slot_count,
                "growing redirection table"
            );
            self.rows.resize(slot_count, NULL_ROW_KEY);
        }
    }

    /// Returns the winning row key for `slot`, or `None` if the slot is empty.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is beyond [`capacity`](Self::capacity).
    #[inline]
    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<RowKey> {
        let row = self.rows[slot];
        (row != NULL_ROW_KEY).then_some(row)
    }

    /// Records `row_key` as the winner for `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is beyond [`capacity`](Self::capacity).
    #[inline]
    pub fn set(&mut self, slot: Slot, row_key: RowKey) {
        debug_assert_ne!(row_key, NULL_ROW_KEY, "cannot redirect to the null row key");
        self.rows[slot] = row_key;
    }

    /// Fails with [`OperatorError::Capacity`] if `slot` is not addressable.
    ///
    /// # Errors
    ///
    /// Returns an error when `slot >= capacity()`.
    #[inline]
    pub fn check_slot(&self, slot: Slot) -> Result<(), OperatorError> {
        crate::operator::check_slot(slot, self.rows.len())
    }

    /// Number of slots that have a winner.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.rows.iter().filter(|&&row| row != NULL_ROW_KEY).count()
    }

    /// Iterates `(slot, row_key)` for every occupied slot.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, RowKey)> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| **row != NULL_ROW_KEY)
            .map(|(slot, row)| (slot, *row))
    }

    /// Exposes the table as a nullable row-key column, one entry per slot.
    #[must_use]
    pub fn to_arrow(&self) -> Int64Array {
        self.rows
            .iter()
            .map(|&row| (row != NULL_ROW_KEY).then_some(row))
            .collect()
    }
}
