//! # Exponential Operators
//!
//! Cumulative, exponentially decayed per-slot values: moving average, sum,
//! minimum, and maximum.
//!
//! ## Decay Modes
//!
//! - **Ticks**: every valid row decays the previous value by a fixed
//!   `alpha = exp(-1 / ticks)`.
//! - **Time**: a row decays the previous value by `alpha = exp(-dt / nanos)`,
//!   where `dt` is the time since the slot's last folded row. The factor is
//!   cached per slot and recomputed only when `dt` changes, which is the
//!   common case for regularly sampled input.
//!
//! ## Row Semantics
//!
//! | Input                 | Effect                                         |
//! |-----------------------|------------------------------------------------|
//! | null / NaN value      | bad-data policy (skip, reset, throw, poison)   |
//! | null timestamp        | nothing (time mode)                            |
//! | first valid row       | seeds the slot                                 |
//! | `dt == 0`             | nothing (time mode)                            |
//! | any other valid row   | `current = f(current, input, alpha, 1-alpha)`  |
//!
//! Every row outputs the slot's current value, carried forward across rows
//! that did not change it.
//!
//! Rows of a slot must arrive in non-decreasing timestamp order. A negative
//! `dt` is folded like any other delta.
//!
//! ## Numeric Paths
//!
//! Primitive inputs accumulate in `f64`. `Option<Decimal>` inputs run the same
//! algorithm in decimal arithmetic, including the decay factor, rounding each
//! step to the operator's [`DecimalContext`].

use std::marker::PhantomData;

use super::{check_slot, BadDataKind, ChunkedOperator, OperatorError, OperatorMetrics};
use crate::batch::{check_len, check_runs, BatchContext, Run, Slot};
use crate::config::{BadDataPolicy, ConfigError, DecimalContext, EmFunction, EmSpec, WindowScale};
use crate::values::{Classified, DecayNumber, NullValue, NumericInput};

/// Binary decay function: `f(previous, input, alpha, 1 - alpha, ctx)`.
pub type DecayFn<A> = fn(A, A, A, A, &DecimalContext) -> A;

fn average<A: DecayNumber>(previous: A, input: A, alpha: A, one_minus_alpha: A, ctx: &DecimalContext) -> A {
    previous.mul(alpha, ctx).add(input.mul(one_minus_alpha, ctx), ctx)
}

fn sum<A: DecayNumber>(previous: A, input: A, alpha: A, _one_minus_alpha: A, ctx: &DecimalContext) -> A {
    previous.mul(alpha, ctx).add(input, ctx)
}

fn min<A: DecayNumber>(previous: A, input: A, alpha: A, _one_minus_alpha: A, ctx: &DecimalContext) -> A {
    previous.mul(alpha, ctx).min_of(input)
}

fn max<A: DecayNumber>(previous: A, input: A, alpha: A, _one_minus_alpha: A, ctx: &DecimalContext) -> A {
    previous.mul(alpha, ctx).max_of(input)
}

fn decay_fn<A: DecayNumber>(function: EmFunction) -> DecayFn<A> {
    match function {
        EmFunction::Average => average::<A>,
        EmFunction::Sum => sum::<A>,
        EmFunction::Min => min::<A>,
        EmFunction::Max => max::<A>,
    }
}

/// Lifecycle of a slot's cumulative state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmState {
    /// No valid row folded yet, or cleared by the reset policy.
    Empty,
    /// Holds the first valid row.
    Seeded,
    /// At least one row has been folded with decay.
    Steady,
}

#[derive(Debug, Clone, Copy)]
enum DecayMode<A> {
    Ticks { alpha: A, one_minus_alpha: A },
    Time { window_nanos: f64 },
}

/// Decay factors for the last seen time delta.
#[derive(Debug, Clone, Copy)]
struct DecayCache<A> {
    dt: i64,
    alpha: A,
    one_minus_alpha: A,
}

/// Per-slot cumulative state.
#[derive(Debug, Clone, Copy)]
struct EmSlot<A> {
    current: Option<A>,
    last_timestamp: Option<i64>,
    cache: Option<DecayCache<A>>,
    steady: bool,
}

impl<A: DecayNumber> EmSlot<A> {
    const EMPTY: Self = Self {
        current: None,
        last_timestamp: None,
        cache: None,
        steady: false,
    };

    fn state(&self) -> EmState {
        match (self.current, self.steady) {
            (None, _) => EmState::Empty,
            (Some(_), false) => EmState::Seeded,
            (Some(_), true) => EmState::Steady,
        }
    }

    #[inline]
    fn fold_tick(&mut self, input: A, alpha: A, one_minus_alpha: A, f: DecayFn<A>, ctx: &DecimalContext) {
        self.current = Some(match self.current {
            None => input,
            Some(previous) => {
                self.steady = true;
                f(previous, input, alpha, one_minus_alpha, ctx)
            }
        });
    }

    #[inline]
    fn fold_timed(
        &mut self,
        input: A,
        timestamp: i64,
        window_nanos: f64,
        f: DecayFn<A>,
        ctx: &DecimalContext,
        metrics: &mut OperatorMetrics,
    ) {
        if timestamp.is_null() {
            return;
        }
        match (self.current, self.last_timestamp) {
            (None, _) => {
                self.current = Some(input);
                self.last_timestamp = Some(timestamp);
            }
            (Some(previous), Some(last)) => {
                let dt = timestamp.saturating_sub(last);
                if dt == 0 {
                    return;
                }
                let cache = match self.cache {
                    Some(cache) if cache.dt == dt => cache,
                    _ => {
                        let alpha = A::decay(dt, window_nanos, ctx);
                        let cache = DecayCache {
                            dt,
                            alpha,
                            one_minus_alpha: A::one().sub(alpha, ctx),
                        };
                        metrics.alpha_recomputations += 1;
                        tracing::trace!(dt, "recomputed time decay factor");
                        self.cache = Some(cache);
                        cache
                    }
                };
                self.current = Some(f(previous, input, cache.alpha, cache.one_minus_alpha, ctx));
                self.last_timestamp = Some(timestamp);
                self.steady = true;
            }
            // Poisoned before any timestamp was recorded.
            (Some(_), None) => self.last_timestamp = Some(timestamp),
        }
    }
}

fn same_value<A: DecayNumber>(lhs: Option<A>, rhs: Option<A>) -> bool {
    match (lhs, rhs) {
        (None, None) => true,
        (Some(lhs), Some(rhs)) => lhs.same(&rhs),
        _ => false,
    }
}

fn handle_bad_data<A: DecayNumber>(
    policy: BadDataPolicy,
    kind: BadDataKind,
    state: &mut EmSlot<A>,
    slot: Slot,
    position: usize,
    metrics: &mut OperatorMetrics,
) -> Result<(), OperatorError> {
    metrics.bad_rows += 1;
    match policy {
        BadDataPolicy::Skip => {}
        BadDataPolicy::Reset => {
            *state = EmSlot::EMPTY;
            metrics.resets += 1;
            tracing::debug!(slot, position, %kind, "reset exponential state on bad input");
        }
        BadDataPolicy::Throw => {
            tracing::warn!(slot, position, %kind, "aborting batch on bad input");
            return Err(OperatorError::BadData {
                slot,
                position,
                kind,
            });
        }
        BadDataPolicy::Poison => {
            if kind == BadDataKind::NaNValue {
                if let Some(nan) = A::nan() {
                    state.current = Some(nan);
                }
            }
        }
    }
    Ok(())
}

/// Cumulative exponential operator over inputs of type `I`.
///
/// # Example
///
/// ```rust
/// use tally_core::config::{EmSpec, WindowScale};
/// use tally_core::operator::{ChunkedOperator, EmOperator};
///
/// let mut op = EmOperator::<i32>::new(EmSpec::ema(WindowScale::ticks(10.0))).unwrap();
/// op.ensure_capacity(1);
/// let mut ctx = op.make_context(16);
/// op.accumulate(&mut ctx, 0, &[10, 20, 30], None).unwrap();
/// assert_eq!(ctx.outputs()[0], Some(10.0));
/// ```
pub struct EmOperator<I: NumericInput> {
    /// Operator configuration
    spec: EmSpec,
    /// Tick factors or time window, resolved from `spec.window`
    mode: DecayMode<I::Acc>,
    /// Fold function
    decay_fn: DecayFn<I::Acc>,
    /// Per-slot state
    slots: Vec<EmSlot<I::Acc>>,
    /// Operator metrics
    metrics: OperatorMetrics,
    _input: PhantomData<fn(I)>,
}

impl<I: NumericInput> EmOperator<I> {
    /// Creates an operator from a spec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the spec is invalid.
    pub fn new(spec: EmSpec) -> Result<Self, ConfigError> {
        spec.validate()?;
        let ctx = spec.control.big_value_context;
        let mode = match spec.window {
            WindowScale::Ticks(ticks) => {
                let alpha = I::Acc::decay(1, ticks, &ctx);
                DecayMode::Ticks {
                    alpha,
                    one_minus_alpha: I::Acc::one().sub(alpha, &ctx),
                }
            }
            #[allow(clippy::cast_precision_loss)]
            WindowScale::Time { nanos } => DecayMode::Time {
                window_nanos: nanos as f64,
            },
        };
        Ok(Self {
            spec,
            mode,
            decay_fn: decay_fn(spec.function),
            slots: Vec::new(),
            metrics: OperatorMetrics::new(),
            _input: PhantomData,
        })
    }

    /// Replaces the configured decay function with a custom one.
    #[must_use]
    pub fn with_decay_fn(mut self, decay_fn: DecayFn<I::Acc>) -> Self {
        self.decay_fn = decay_fn;
        self
    }

    /// Returns the operator spec.
    #[must_use]
    pub fn spec(&self) -> &EmSpec {
        &self.spec
    }

    /// Returns true if this operator decays by elapsed time.
    #[must_use]
    pub fn is_time(&self) -> bool {
        matches!(self.mode, DecayMode::Time { .. })
    }

    /// Creates scratch state for batches of up to `chunk_capacity` rows.
    #[must_use]
    pub fn make_context(&self, chunk_capacity: usize) -> BatchContext<Option<I::Acc>> {
        BatchContext::new(chunk_capacity)
    }

    /// Folds rows that all belong to `slot`, in order.
    ///
    /// Writes one output per row into `ctx` and returns true if the slot's
    /// value changed. `timestamps` is required in time mode and ignored in
    /// tick mode.
    ///
    /// # Errors
    ///
    /// - [`OperatorError::BadData`] under the throw policy; rows before the
    ///   offending one stay folded
    /// - [`OperatorError::MissingTimestamps`], [`OperatorError::LengthMismatch`],
    ///   [`OperatorError::Capacity`], [`OperatorError::BatchTooLarge`]
    pub fn accumulate(
        &mut self,
        ctx: &mut BatchContext<Option<I::Acc>>,
        slot: Slot,
        values: &[I],
        timestamps: Option<&[i64]>,
    ) -> Result<bool, OperatorError> {
        self.check_timestamps(timestamps, values.len())?;
        check_slot(slot, self.slots.len())?;
        ctx.begin(values.len())?;
        self.fold_run(&Run::new(slot, 0, values.len()), values, timestamps, ctx.outputs_mut())
    }

    /// Folds a bucketed batch, one run per destination slot.
    ///
    /// Outputs are aligned with the batch rows; one modified flag is written
    /// per run. Rows not covered by any run keep stale outputs.
    ///
    /// # Errors
    ///
    /// As [`accumulate`](Self::accumulate), plus
    /// [`OperatorError::RunOutOfBounds`]. Runs before a failing one stay
    /// applied.
    pub fn accumulate_runs(
        &mut self,
        ctx: &mut BatchContext<Option<I::Acc>>,
        values: &[I],
        timestamps: Option<&[i64]>,
        runs: &[Run],
    ) -> Result<(), OperatorError> {
        self.check_timestamps(timestamps, values.len())?;
        check_runs(runs, values.len())?;
        ctx.begin(values.len())?;
        for run in runs {
            check_slot(run.destination, self.slots.len())?;
            let modified = self.fold_run(run, values, timestamps, ctx.outputs_mut())?;
            ctx.push_modified(modified);
        }
        Ok(())
    }

    fn check_timestamps(&self, timestamps: Option<&[i64]>, len: usize) -> Result<(), OperatorError> {
        match (self.mode, timestamps) {
            (DecayMode::Time { .. }, None) => Err(OperatorError::MissingTimestamps),
            (DecayMode::Time { .. }, Some(timestamps)) => check_len("timestamps", timestamps.len(), len),
            (DecayMode::Ticks { .. }, _) => Ok(()),
        }
    }

    fn fold_run(
        &mut self,
        run: &Run,
        values: &[I],
        timestamps: Option<&[i64]>,
        outputs: &mut [Option<I::Acc>],
    ) -> Result<bool, OperatorError> {
        let control = self.spec.control;
        let ctx = control.big_value_context;
        let f = self.decay_fn;
        let mode = self.mode;
        let metrics = &mut self.metrics;
        let state = &mut self.slots[run.destination];
        let before = state.current;

        for position in run.range() {
            match values[position].classify() {
                Classified::Value(input) => match mode {
                    DecayMode::Ticks {
                        alpha,
                        one_minus_alpha,
                    } => state.fold_tick(input, alpha, one_minus_alpha, f, &ctx),
                    DecayMode::Time { window_nanos } => {
                        let timestamp = timestamps.map_or(i64::NULL, |t| t[position]);
                        state.fold_timed(input, timestamp, window_nanos, f, &ctx, metrics);
                    }
                },
                Classified::Null => handle_bad_data(
                    control.on_null_value,
                    BadDataKind::NullValue,
                    state,
                    run.destination,
                    position,
                    metrics,
                )?,
                Classified::NaN => handle_bad_data(
                    control.on_nan_value,
                    BadDataKind::NaNValue,
                    state,
                    run.destination,
                    position,
                    metrics,
                )?,
            }
            outputs[position] = state.current;
        }

        let modified = !same_value(before, state.current);
        metrics.record_run(run.len, modified);
        Ok(modified)
    }

    /// Returns the current value of `slot`, if any.
    #[must_use]
    pub fn current(&self, slot: Slot) -> Option<I::Acc> {
        self.slots.get(slot).and_then(|state| state.current)
    }

    /// Returns the lifecycle state of `slot`.
    ///
    /// Slots beyond the ensured capacity report [`EmState::Empty`].
    #[must_use]
    pub fn state(&self, slot: Slot) -> EmState {
        self.slots.get(slot).map_or(EmState::Empty, EmSlot::state)
    }

    /// Clears `slot` as if no rows had been seen.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Capacity`] if the slot is not addressable.
    pub fn reset(&mut self, slot: Slot) -> Result<(), OperatorError> {
        check_slot(slot, self.slots.len())?;
        self.slots[slot] = EmSlot::EMPTY;
        Ok(())
    }
}

impl<I: NumericInput> ChunkedOperator for EmOperator<I> {
    fn name(&self) -> &'static str {
        match self.spec.function {
            EmFunction::Average => "ema",
            EmFunction::Sum => "ems",
            EmFunction::Min => "em_min",
            EmFunction::Max => "em_max",
        }
    }

    fn ensure_capacity(&mut self, slot_count: usize) {
        if slot_count > self.slots.len() {
            self.slots.resize(slot_count, EmSlot::EMPTY);
        }
    }

    fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }
}
