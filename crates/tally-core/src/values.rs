//! # Value Semantics
//!
//! Per-type behaviour shared by every operator, written once and
//! instantiated per column type:
//!
//! - [`NullValue`]: the in-band null sentinel carried by primitive columns
//! - [`SortKey`]: the total order used by first/last selection
//! - [`NumericInput`]: classification of raw inputs into value / null / NaN
//! - [`DecayNumber`]: accumulator arithmetic for exponential and weighted operators
//!
//! ## Null Sentinels
//!
//! | Type  | Sentinel      | Position in sort order |
//! |-------|---------------|------------------------|
//! | `i8`  | `i8::MIN`     | smallest               |
//! | `i16` | `i16::MIN`    | smallest               |
//! | `i32` | `i32::MIN`    | smallest               |
//! | `i64` | `i64::MIN`    | smallest               |
//! | `u16` | `u16::MAX`    | smallest               |
//! | `f32` | `-f32::MAX`   | smallest (NaN largest) |
//! | `f64` | `-f64::MAX`   | smallest (NaN largest) |
//!
//! Object columns use `Option<T>` with `None` as null.

use std::cmp::Ordering;
use std::fmt::Debug;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, MathematicalOps};

use crate::config::DecimalContext;

/// Null sentinel for `i8` columns.
pub const NULL_BYTE: i8 = i8::MIN;
/// Null sentinel for `i16` columns.
pub const NULL_SHORT: i16 = i16::MIN;
/// Null sentinel for `i32` columns.
pub const NULL_INT: i32 = i32::MIN;
/// Null sentinel for `i64` columns, including timestamps.
pub const NULL_LONG: i64 = i64::MIN;
/// Null sentinel for `u16` (character) columns.
pub const NULL_CHAR: u16 = u16::MAX;
/// Null sentinel for `f32` columns.
pub const NULL_FLOAT: f32 = -f32::MAX;
/// Null sentinel for `f64` columns.
pub const NULL_DOUBLE: f64 = -f64::MAX;

/// A primitive type with a reserved in-band null value.
pub trait NullValue: Copy {
    /// The reserved null bit pattern.
    const NULL: Self;

    /// Returns true if this value is the null sentinel.
    fn is_null(&self) -> bool;
}

macro_rules! impl_null_value {
    ($($ty:ty => $null:expr),* $(,)?) => {
        $(
            impl NullValue for $ty {
                const NULL: Self = $null;

                #[inline]
                #[allow(clippy::float_cmp)]
                fn is_null(&self) -> bool {
                    *self == $null
                }
            }
        )*
    };
}

impl_null_value!(
    i8 => NULL_BYTE,
    i16 => NULL_SHORT,
    i32 => NULL_INT,
    i64 => NULL_LONG,
    u16 => NULL_CHAR,
    f32 => NULL_FLOAT,
    f64 => NULL_DOUBLE,
);

/// A sort-column value with a total order that places null first.
///
/// Used by the sorted first/last operator, which keeps one shadow value per
/// destination slot. Implementations must be a total order: ties are broken
/// by row key, so `Equal` has to be consistent across calls.
pub trait SortKey: Clone + Send + 'static {
    /// The value stored in slots that have no winner yet.
    fn null() -> Self;

    /// Compares two values in the column's natural order.
    fn compare(&self, other: &Self) -> Ordering;
}

macro_rules! impl_sort_key_integral {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SortKey for $ty {
                #[inline]
                fn null() -> Self {
                    <$ty as NullValue>::NULL
                }

                // MIN sentinels already order below every valid value.
                #[inline]
                fn compare(&self, other: &Self) -> Ordering {
                    self.cmp(other)
                }
            }
        )*
    };
}

impl_sort_key_integral!(i8, i16, i32, i64);

impl SortKey for u16 {
    fn null() -> Self {
        NULL_CHAR
    }

    #[inline]
    fn compare(&self, other: &Self) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.cmp(other),
        }
    }
}

macro_rules! impl_sort_key_floating {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SortKey for $ty {
                fn null() -> Self {
                    <$ty as NullValue>::NULL
                }

                #[inline]
                #[allow(clippy::float_cmp)]
                fn compare(&self, other: &Self) -> Ordering {
                    let (lhs, rhs) = (*self, *other);
                    // -0.0 == 0.0, and null == null
                    if lhs == rhs {
                        return Ordering::Equal;
                    }
                    if lhs.is_null() {
                        return Ordering::Less;
                    }
                    if rhs.is_null() {
                        return Ordering::Greater;
                    }
                    match (lhs.is_nan(), rhs.is_nan()) {
                        (true, true) => Ordering::Equal,
                        (true, false) => Ordering::Greater,
                        (false, true) => Ordering::Less,
                        (false, false) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
                    }
                }
            }
        )*
    };
}

impl_sort_key_floating!(f32, f64);

impl<T> SortKey for Option<T>
where
    T: Ord + Clone + Send + 'static,
{
    fn null() -> Self {
        None
    }

    #[inline]
    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// Result of classifying one raw input value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classified<A> {
    /// A valid value, converted to the accumulator type.
    Value(A),
    /// The null sentinel (or `None`).
    Null,
    /// A floating-point NaN.
    NaN,
}

/// A column type that can feed a numeric windowed operator.
pub trait NumericInput: Copy + Send + 'static {
    /// Accumulator type the operator computes in.
    type Acc: DecayNumber;

    /// Classifies the raw value.
    fn classify(self) -> Classified<Self::Acc>;
}

macro_rules! impl_numeric_input_integral {
    ($($ty:ty),* $(,)?) => {
        $(
            impl NumericInput for $ty {
                type Acc = f64;

                #[inline]
                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn classify(self) -> Classified<f64> {
                    if self.is_null() {
                        Classified::Null
                    } else {
                        Classified::Value(self as f64)
                    }
                }
            }
        )*
    };
}

impl_numeric_input_integral!(i8, i16, i32, i64, u16);

macro_rules! impl_numeric_input_floating {
    ($($ty:ty),* $(,)?) => {
        $(
            impl NumericInput for $ty {
                type Acc = f64;

                #[inline]
                fn classify(self) -> Classified<f64> {
                    if self.is_null() {
                        Classified::Null
                    } else if self.is_nan() {
                        Classified::NaN
                    } else {
                        Classified::Value(f64::from(self))
                    }
                }
            }
        )*
    };
}

impl_numeric_input_floating!(f32, f64);

impl NumericInput for Option<Decimal> {
    type Acc = Decimal;

    #[inline]
    fn classify(self) -> Classified<Decimal> {
        match self {
            Some(value) => Classified::Value(value),
            None => Classified::Null,
        }
    }
}

/// Accumulator arithmetic for decaying and weighted operators.
///
/// `f64` is the fixed-precision path used by every primitive input. `Decimal`
/// runs the same algorithms with exact decimal arithmetic, rounding each
/// operation to the operator's [`DecimalContext`].
pub trait DecayNumber: Copy + PartialEq + Debug + Send + 'static {
    /// The multiplicative identity.
    fn one() -> Self;

    /// `self * rhs`.
    #[must_use]
    fn mul(self, rhs: Self, ctx: &DecimalContext) -> Self;

    /// `self + rhs`.
    #[must_use]
    fn add(self, rhs: Self, ctx: &DecimalContext) -> Self;

    /// `self - rhs`.
    #[must_use]
    fn sub(self, rhs: Self, ctx: &DecimalContext) -> Self;

    /// The smaller of the two, propagating NaN.
    #[must_use]
    fn min_of(self, rhs: Self) -> Self;

    /// The larger of the two, propagating NaN.
    #[must_use]
    fn max_of(self, rhs: Self) -> Self;

    /// The poison value, if this type can represent one.
    fn nan() -> Option<Self>;

    /// Returns `exp(-elapsed / window)`.
    ///
    /// `elapsed` is one tick for tick windows, or the timestamp delta in
    /// nanoseconds for time windows.
    fn decay(elapsed: i64, window: f64, ctx: &DecimalContext) -> Self;

    /// Bitwise identity, so a NaN compares equal to itself.
    fn same(&self, other: &Self) -> bool;
}

impl DecayNumber for f64 {
    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn mul(self, rhs: Self, _ctx: &DecimalContext) -> Self {
        self * rhs
    }

    #[inline]
    fn add(self, rhs: Self, _ctx: &DecimalContext) -> Self {
        self + rhs
    }

    #[inline]
    fn sub(self, rhs: Self, _ctx: &DecimalContext) -> Self {
        self - rhs
    }

    #[inline]
    fn min_of(self, rhs: Self) -> Self {
        if self.is_nan() || rhs.is_nan() {
            f64::NAN
        } else {
            self.min(rhs)
        }
    }

    #[inline]
    fn max_of(self, rhs: Self) -> Self {
        if self.is_nan() || rhs.is_nan() {
            f64::NAN
        } else {
            self.max(rhs)
        }
    }

    fn nan() -> Option<Self> {
        Some(f64::NAN)
    }

    #[inline]
    #[allow(clippy::cast_precision_loss)]
    fn decay(elapsed: i64, window: f64, _ctx: &DecimalContext) -> Self {
        (-(elapsed as f64) / window).exp()
    }

    #[inline]
    fn same(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl DecayNumber for Decimal {
    fn one() -> Self {
        Decimal::ONE
    }

    fn mul(self, rhs: Self, ctx: &DecimalContext) -> Self {
        ctx.round(self.saturating_mul(rhs))
    }

    fn add(self, rhs: Self, ctx: &DecimalContext) -> Self {
        ctx.round(self.saturating_add(rhs))
    }

    fn sub(self, rhs: Self, ctx: &DecimalContext) -> Self {
        ctx.round(self.saturating_sub(rhs))
    }

    fn min_of(self, rhs: Self) -> Self {
        self.min(rhs)
    }

    fn max_of(self, rhs: Self) -> Self {
        self.max(rhs)
    }

    fn nan() -> Option<Self> {
        None
    }

    fn decay(elapsed: i64, window: f64, ctx: &DecimalContext) -> Self {
        let Some(window) = Decimal::from_f64(window) else {
            return Decimal::ZERO;
        };
        let Some(ratio) = Decimal::from(elapsed).checked_div(window) else {
            return Decimal::ZERO;
        };
        // exp(-x) underflows to zero for very large elapsed times
        (-ratio)
            .checked_exp()
            .map_or(Decimal::ZERO, |alpha| ctx.round(alpha))
    }

    fn same(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_null_sorts_first() {
        let a = u16::from(b'a');
        assert_eq!(NULL_CHAR.compare(&a), Ordering::Less);
        assert_eq!(a.compare(&NULL_CHAR), Ordering::Greater);
        assert_eq!(NULL_CHAR.compare(&NULL_CHAR), Ordering::Equal);
        assert_eq!(a.compare(&u16::from(b'b')), Ordering::Less);
    }

    #[test]
    fn test_integral_null_sorts_first() {
        assert_eq!(NULL_INT.compare(&-5), Ordering::Less);
        assert_eq!(NULL_LONG.compare(&i64::from(NULL_INT)), Ordering::Less);
        assert_eq!(7i16.compare(&7), Ordering::Equal);
    }

    #[test]
    fn test_float_ordering() {
        assert_eq!(NULL_DOUBLE.compare(&f64::NEG_INFINITY), Ordering::Less);
        assert_eq!(f64::NAN.compare(&f64::INFINITY), Ordering::Greater);
        assert_eq!(f64::NAN.compare(&f64::NAN), Ordering::Equal);
        assert_eq!((-0.0f64).compare(&0.0), Ordering::Equal);
        assert_eq!(1.5f32.compare(&2.5), Ordering::Less);
        assert_eq!(NULL_FLOAT.compare(&f32::NAN), Ordering::Less);
    }

    #[test]
    fn test_option_sort_key() {
        let none: Option<String> = None;
        let apple = Some("apple".to_string());
        assert_eq!(none.compare(&apple), Ordering::Less);
        assert_eq!(apple.compare(&Some("banana".to_string())), Ordering::Less);
    }

    #[test]
    fn test_classify() {
        assert_eq!(NULL_INT.classify(), Classified::Null);
        assert_eq!(42i32.classify(), Classified::Value(42.0));
        assert_eq!(NumericInput::classify(NULL_DOUBLE), Classified::Null);
        assert_eq!(NumericInput::classify(f32::NAN), Classified::NaN);
        assert_eq!(None::<Decimal>.classify(), Classified::Null);
        assert_eq!(
            Some(Decimal::new(15, 1)).classify(),
            Classified::Value(Decimal::new(15, 1))
        );
    }

    #[test]
    fn test_f64_decay() {
        let ctx = DecimalContext::default();
        let alpha = f64::decay(1, 1.0 / std::f64::consts::LN_2, &ctx);
        assert!((alpha - 0.5).abs() < 1e-12);
        assert!((f64::decay(0, 10.0, &ctx) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decimal_decay_matches_float() {
        let ctx = DecimalContext::default();
        let alpha = Decimal::decay(1_000, 2_000.0, &ctx);
        let expected = Decimal::from_f64((-0.5f64).exp()).unwrap();
        assert!((alpha - expected).abs() < Decimal::new(1, 12));
    }

    #[test]
    fn test_nan_propagates_through_min_max() {
        assert!(f64::NAN.min_of(1.0).is_nan());
        assert!(1.0f64.max_of(f64::NAN).is_nan());
        assert!(f64::NAN.same(&f64::NAN));
    }
}
