//! # Operator Configuration
//!
//! Per-operator settings chosen by the caller at construction time:
//! bad-data handling ([`OperationControl`]), decay window scale
//! ([`WindowScale`]), rolling window bounds ([`RollingWindow`]), and the
//! specs that bundle them ([`EmSpec`], [`RollingWAvgSpec`]).
//!
//! All types are plain data with `serde` support so they can be embedded in
//! the engine's own configuration files.
//!
//! ```rust
//! use tally_core::config::{BadDataPolicy, EmSpec, OperationControl, WindowScale};
//! use std::time::Duration;
//!
//! let spec = EmSpec::ema(WindowScale::from_duration(Duration::from_secs(5)).unwrap())
//!     .with_control(OperationControl::default().with_on_null_value(BadDataPolicy::Reset));
//! assert!(spec.validate().is_ok());
//! ```

use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Largest scale a decimal value can carry.
pub const MAX_DECIMAL_SCALE: u32 = 28;

/// Errors from invalid operator configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Decay or rolling window scale is not strictly positive and finite.
    #[error("Invalid window scale: {0}")]
    InvalidWindowScale(String),

    /// Decimal scale outside the representable range.
    #[error("Invalid decimal scale {0}, maximum is {MAX_DECIMAL_SCALE}")]
    InvalidDecimalScale(u32),
}

/// What an operator does with a row whose value is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadDataPolicy {
    /// Ignore the row; state and output are unchanged.
    #[default]
    Skip,
    /// Clear the slot's state as if no rows had been seen.
    Reset,
    /// Abort the batch with [`OperatorError::BadData`](crate::operator::OperatorError::BadData).
    Throw,
    /// Set the slot's value to NaN. Acts as [`Skip`](Self::Skip) for nulls
    /// and for types that cannot represent NaN.
    Poison,
}

/// Rounding mode for the decimal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimalRounding {
    /// Round half to even (banker's rounding).
    #[default]
    HalfEven,
    /// Round half away from zero.
    HalfUp,
    /// Round half toward zero.
    HalfDown,
    /// Truncate toward zero.
    Down,
    /// Round away from zero.
    Up,
    /// Round toward negative infinity.
    Floor,
    /// Round toward positive infinity.
    Ceiling,
}

impl DecimalRounding {
    /// Returns the equivalent `rust_decimal` strategy.
    #[must_use]
    pub fn strategy(self) -> RoundingStrategy {
        match self {
            Self::HalfEven => RoundingStrategy::MidpointNearestEven,
            Self::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Self::HalfDown => RoundingStrategy::MidpointTowardZero,
            Self::Down => RoundingStrategy::ToZero,
            Self::Up => RoundingStrategy::AwayFromZero,
            Self::Floor => RoundingStrategy::ToNegativeInfinity,
            Self::Ceiling => RoundingStrategy::ToPositiveInfinity,
        }
    }
}

/// Scale and rounding applied to every decimal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecimalContext {
    /// Digits kept after the decimal point.
    pub scale: u32,
    /// Rounding mode applied when digits are dropped.
    pub rounding: DecimalRounding,
}

impl Default for DecimalContext {
    fn default() -> Self {
        Self {
            scale: 16,
            rounding: DecimalRounding::HalfEven,
        }
    }
}

impl DecimalContext {
    /// Creates a context with the given scale and rounding.
    #[must_use]
    pub fn new(scale: u32, rounding: DecimalRounding) -> Self {
        Self { scale, rounding }
    }

    /// Rounds `value` to this context.
    #[inline]
    #[must_use]
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.scale, self.rounding.strategy())
    }

    /// Checks the scale is representable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDecimalScale`] if the scale exceeds
    /// [`MAX_DECIMAL_SCALE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scale > MAX_DECIMAL_SCALE {
            return Err(ConfigError::InvalidDecimalScale(self.scale));
        }
        Ok(())
    }
}

/// Bad-data handling for one operator instance.
///
/// Defaults: nulls are skipped, NaNs poison the slot, and decimals keep 16
/// digits with half-even rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationControl {
    /// Policy for null values.
    pub on_null_value: BadDataPolicy,
    /// Policy for NaN values (floating-point inputs only).
    pub on_nan_value: BadDataPolicy,
    /// Scale and rounding for decimal inputs.
    pub big_value_context: DecimalContext,
}

impl Default for OperationControl {
    fn default() -> Self {
        Self {
            on_null_value: BadDataPolicy::Skip,
            on_nan_value: BadDataPolicy::Poison,
            big_value_context: DecimalContext::default(),
        }
    }
}

impl OperationControl {
    /// Sets the policy for null values.
    #[must_use]
    pub fn with_on_null_value(mut self, policy: BadDataPolicy) -> Self {
        self.on_null_value = policy;
        self
    }

    /// Sets the policy for NaN values.
    #[must_use]
    pub fn with_on_nan_value(mut self, policy: BadDataPolicy) -> Self {
        self.on_nan_value = policy;
        self
    }

    /// Sets the decimal context.
    #[must_use]
    pub fn with_big_value_context(mut self, context: DecimalContext) -> Self {
        self.big_value_context = context;
        self
    }
}

/// Decay window of an exponential operator.
///
/// Tick windows decay once per row; time windows decay by the elapsed time
/// between consecutive rows of a slot, which requires a timestamp column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScale {
    /// Window measured in rows. Decay factor is `exp(-1 / ticks)`.
    Ticks(f64),
    /// Window measured in nanoseconds. Decay factor is `exp(-dt / nanos)`.
    Time {
        /// Window length in nanoseconds.
        nanos: i64,
    },
}

impl WindowScale {
    /// Creates a tick-based window.
    #[must_use]
    pub fn ticks(ticks: f64) -> Self {
        Self::Ticks(ticks)
    }

    /// Creates a time-based window from nanoseconds.
    #[must_use]
    pub fn nanos(nanos: i64) -> Self {
        Self::Time { nanos }
    }

    /// Creates a time-based window from a duration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowScale`] if the duration does not
    /// fit in `i64` nanoseconds.
    pub fn from_duration(window: Duration) -> Result<Self, ConfigError> {
        let nanos = i64::try_from(window.as_nanos()).map_err(|_| {
            ConfigError::InvalidWindowScale(format!("{window:?} overflows i64 nanoseconds"))
        })?;
        Ok(Self::Time { nanos })
    }

    /// Returns true if this window needs a timestamp column.
    #[must_use]
    pub fn is_time(&self) -> bool {
        matches!(self, Self::Time { .. })
    }

    /// Checks the scale is strictly positive and finite.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowScale`] otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Ticks(ticks) if !(ticks.is_finite() && ticks > 0.0) => Err(
                ConfigError::InvalidWindowScale(format!("tick window must be positive, got {ticks}")),
            ),
            Self::Time { nanos } if nanos <= 0 => Err(ConfigError::InvalidWindowScale(format!(
                "time window must be positive, got {nanos}ns"
            ))),
            _ => Ok(()),
        }
    }
}

/// The binary decay function an exponential operator folds with.
///
/// Each is applied as `f(previous, input, alpha, 1 - alpha)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmFunction {
    /// Exponential moving average: `previous * alpha + input * (1 - alpha)`.
    #[default]
    Average,
    /// Exponential moving sum: `previous * alpha + input`.
    Sum,
    /// Exponential moving minimum: `min(previous * alpha, input)`.
    Min,
    /// Exponential moving maximum: `max(previous * alpha, input)`.
    Max,
}

/// Configuration for a cumulative exponential operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmSpec {
    /// Decay window.
    pub window: WindowScale,
    /// Bad-data handling.
    #[serde(default)]
    pub control: OperationControl,
    /// Decay function.
    #[serde(default)]
    pub function: EmFunction,
}

impl EmSpec {
    /// Creates an exponential moving average spec with default control.
    #[must_use]
    pub fn ema(window: WindowScale) -> Self {
        Self {
            window,
            control: OperationControl::default(),
            function: EmFunction::Average,
        }
    }

    /// Sets the bad-data handling.
    #[must_use]
    pub fn with_control(mut self, control: OperationControl) -> Self {
        self.control = control;
        self
    }

    /// Sets the decay function.
    #[must_use]
    pub fn with_function(mut self, function: EmFunction) -> Self {
        self.function = function;
        self
    }

    /// Validates the window and decimal context.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()?;
        self.control.big_value_context.validate()
    }
}

/// Trailing window bounds of a rolling operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingWindow {
    /// The last `rev` rows, including the current one.
    Ticks {
        /// Number of rows in the window.
        rev: usize,
    },
    /// Rows with `t - rev_nanos < timestamp <= t`.
    Time {
        /// Look-back length in nanoseconds.
        rev_nanos: i64,
    },
}

impl RollingWindow {
    /// Returns true if this window needs a timestamp column.
    #[must_use]
    pub fn is_time(&self) -> bool {
        matches!(self, Self::Time { .. })
    }

    /// Checks the window is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWindowScale`] for a zero or negative window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Ticks { rev: 0 } => Err(ConfigError::InvalidWindowScale(
                "rolling tick window must hold at least one row".to_string(),
            )),
            Self::Time { rev_nanos } if rev_nanos <= 0 => Err(ConfigError::InvalidWindowScale(
                format!("rolling time window must be positive, got {rev_nanos}ns"),
            )),
            _ => Ok(()),
        }
    }
}

/// Configuration for a rolling weighted-average operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWAvgSpec {
    /// Window bounds.
    pub window: RollingWindow,
}

impl RollingWAvgSpec {
    /// Creates a tick-window spec.
    #[must_use]
    pub fn ticks(rev: usize) -> Self {
        Self {
            window: RollingWindow::Ticks { rev },
        }
    }

    /// Creates a time-window spec.
    #[must_use]
    pub fn time(rev_nanos: i64) -> Self {
        Self {
            window: RollingWindow::Time { rev_nanos },
        }
    }

    /// Validates the window.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the window is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()
    }
}
