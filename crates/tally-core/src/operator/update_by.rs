//! # Update-By Dispatch
//!
//! A closed set of windowed numeric operators behind one entry point, so a
//! table-update pipeline can hold a list of configured operators and feed
//! each the same bucketed batch.

use serde::{Deserialize, Serialize};

use super::{ChunkedOperator, EmOperator, OperatorError, OperatorMetrics, RollingWAvgOperator};
use crate::batch::{BatchContext, Run};
use crate::config::{ConfigError, EmSpec, RollingWAvgSpec};
use crate::values::NumericInput;

/// Configuration of one windowed numeric operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateBySpec {
    /// Cumulative exponential average, sum, minimum or maximum.
    Em(EmSpec),
    /// Trailing weighted average.
    RollingWAvg(RollingWAvgSpec),
}

/// Column views for one batch.
#[derive(Debug, Clone, Copy)]
pub struct UpdateByInput<'a, I> {
    /// Input values.
    pub values: &'a [I],
    /// Row weights, required by weighted operators.
    pub weights: Option<&'a [f64]>,
    /// Row timestamps in nanoseconds, required by time windows.
    pub timestamps: Option<&'a [i64]>,
}

impl<'a, I> UpdateByInput<'a, I> {
    /// Creates an input with values only.
    #[must_use]
    pub fn new(values: &'a [I]) -> Self {
        Self {
            values,
            weights: None,
            timestamps: None,
        }
    }

    /// Attaches a weight column.
    #[must_use]
    pub fn with_weights(mut self, weights: &'a [f64]) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Attaches a timestamp column.
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: &'a [i64]) -> Self {
        self.timestamps = Some(timestamps);
        self
    }
}

/// A configured windowed numeric operator over `f64`-accumulated inputs.
pub enum UpdateByOperator<I: NumericInput<Acc = f64>> {
    /// Exponential operator.
    Cumulative(EmOperator<I>),
    /// Rolling weighted average.
    Rolling(RollingWAvgOperator<I>),
}

impl<I: NumericInput<Acc = f64>> UpdateByOperator<I> {
    /// Builds the operator a spec describes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the spec is invalid.
    pub fn from_spec(spec: UpdateBySpec) -> Result<Self, ConfigError> {
        let operator = match spec {
            UpdateBySpec::Em(spec) => Self::Cumulative(EmOperator::new(spec)?),
            UpdateBySpec::RollingWAvg(spec) => Self::Rolling(RollingWAvgOperator::new(spec)?),
        };
        tracing::debug!(operator = operator.name(), "created update-by operator");
        Ok(operator)
    }

    /// Creates scratch state for batches of up to `chunk_capacity` rows.
    #[must_use]
    pub fn make_context(&self, chunk_capacity: usize) -> BatchContext<Option<f64>> {
        BatchContext::new(chunk_capacity)
    }

    /// Applies a bucketed batch, writing per-row outputs and per-run
    /// modified flags into `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::MissingWeights`] if a weighted operator gets
    /// no weights, and otherwise whatever the underlying operator returns.
    pub fn apply(
        &mut self,
        ctx: &mut BatchContext<Option<f64>>,
        input: UpdateByInput<'_, I>,
        runs: &[Run],
    ) -> Result<(), OperatorError> {
        match self {
            Self::Cumulative(op) => op.accumulate_runs(ctx, input.values, input.timestamps, runs),
            Self::Rolling(op) => {
                let weights = input.weights.ok_or(OperatorError::MissingWeights)?;
                op.accumulate_runs(ctx, input.values, weights, input.timestamps, runs)
            }
        }
    }

    /// Returns the operator's current result for `slot`.
    #[must_use]
    pub fn current(&self, slot: usize) -> Option<f64> {
        match self {
            Self::Cumulative(op) => op.current(slot),
            Self::Rolling(op) => op.average(slot),
        }
    }
}

impl<I: NumericInput<Acc = f64>> ChunkedOperator for UpdateByOperator<I> {
    fn name(&self) -> &'static str {
        match self {
            Self::Cumulative(op) => op.name(),
            Self::Rolling(op) => op.name(),
        }
    }

    fn ensure_capacity(&mut self, slot_count: usize) {
        match self {
            Self::Cumulative(op) => op.ensure_capacity(slot_count),
            Self::Rolling(op) => op.ensure_capacity(slot_count),
        }
    }

    fn slot_capacity(&self) -> usize {
        match self {
            Self::Cumulative(op) => op.slot_capacity(),
            Self::Rolling(op) => op.slot_capacity(),
        }
    }

    fn metrics(&self) -> &OperatorMetrics {
        match self {
            Self::Cumulative(op) => op.metrics(),
            Self::Rolling(op) => op.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmFunction, WindowScale};
    use crate::operator::ensure_capacity_all;

    #[test]
    fn test_spec_from_json() {
        let spec: UpdateBySpec = serde_json::from_str(
            r#"{"type": "em", "window": {"ticks": 4.0}, "function": "sum"}"#,
        )
        .unwrap();
        assert_eq!(
            spec,
            UpdateBySpec::Em(EmSpec::ema(WindowScale::ticks(4.0)).with_function(EmFunction::Sum))
        );

        let spec: UpdateBySpec = serde_json::from_str(
            r#"{"type": "rolling_w_avg", "window": {"time": {"rev_nanos": 1000}}}"#,
        )
        .unwrap();
        assert_eq!(spec, UpdateBySpec::RollingWAvg(RollingWAvgSpec::time(1000)));
    }

    #[test]
    fn test_dispatch() {
        let mut ema = UpdateByOperator::<f64>::from_spec(UpdateBySpec::Em(EmSpec::ema(
            WindowScale::ticks(1.0 / std::f64::consts::LN_2),
        )))
        .unwrap();
        let mut wavg =
            UpdateByOperator::<f64>::from_spec(UpdateBySpec::RollingWAvg(RollingWAvgSpec::ticks(2)))
                .unwrap();
        ensure_capacity_all(&mut [&mut ema, &mut wavg], 1);
        assert_eq!(ema.name(), "ema");
        assert_eq!(wavg.name(), "rolling_wavg");
        assert_eq!(wavg.slot_capacity(), 1);

        let values = [2.0, 4.0, 6.0];
        let weights = [1.0, 1.0, 2.0];
        let runs = [Run::new(0, 0, 3)];
        let mut ctx = ema.make_context(4);

        ema.apply(&mut ctx, UpdateByInput::new(&values), &runs)
            .unwrap();
        let ema_result = ema.current(0).unwrap();
        assert!((ema_result - 4.5).abs() < 1e-9);

        let input = UpdateByInput::new(&values).with_weights(&weights);
        wavg.apply(&mut ctx, input, &runs).unwrap();
        assert_eq!(ctx.outputs()[2], Some(16.0 / 3.0));
        assert_eq!(wavg.metrics().rows_processed, 3);
    }

    #[test]
    fn test_missing_weights() {
        let mut wavg =
            UpdateByOperator::<i64>::from_spec(UpdateBySpec::RollingWAvg(RollingWAvgSpec::ticks(2)))
                .unwrap();
        wavg.ensure_capacity(1);
        let mut ctx = wavg.make_context(4);
        assert!(matches!(
            wavg.apply(&mut ctx, UpdateByInput::new(&[1]), &[Run::new(0, 0, 1)]),
            Err(OperatorError::MissingWeights)
        ));
    }

    #[test]
    fn test_invalid_spec() {
        assert!(UpdateByOperator::<f64>::from_spec(UpdateBySpec::RollingWAvg(
            RollingWAvgSpec::ticks(0)
        ))
        .is_err());
    }
}
