//! # Tally Core
//!
//! Incremental per-group operators for an append-only columnar table engine.
//!
//! As rows are appended, a grouping layer partitions each batch into runs of
//! rows that share a destination slot (one slot per group). This crate
//! provides the operators that fold those runs into per-slot derived values:
//!
//! - **Selection**: sorted first/last-by, tracked through a
//!   [`GroupRedirectionTable`](redirection::GroupRedirectionTable)
//! - **Cumulative**: exponential moving average, sum, minimum and maximum,
//!   decayed per tick or per elapsed time
//! - **Rolling**: weighted average over a trailing window
//!
//! ## Design Principles
//!
//! 1. **No per-row allocation** - scratch lives in a caller-owned
//!    [`BatchContext`](batch::BatchContext) reused across batches
//! 2. **Sentinel nulls** - primitive columns are plain slices with a null
//!    value per type, converted from arrow once at the boundary
//! 3. **Explicit capacity** - slots are addressable only after
//!    `ensure_capacity`
//! 4. **Row-level commit** - a failed batch keeps every row before the
//!    failure
//!
//! ## Example
//!
//! ```rust
//! use tally_core::batch::partition_runs;
//! use tally_core::config::{EmSpec, WindowScale};
//! use tally_core::operator::{ChunkedOperator, EmOperator};
//!
//! let mut ema = EmOperator::<f64>::new(EmSpec::ema(WindowScale::ticks(2.0)))?;
//! ema.ensure_capacity(2);
//!
//! let destinations = [0, 0, 1];
//! let mut runs = Vec::new();
//! partition_runs(&destinations, &mut runs);
//!
//! let mut ctx = ema.make_context(1024);
//! ema.accumulate_runs(&mut ctx, &[1.0, 2.0, 10.0], None, &runs)?;
//! assert_eq!(ctx.modified(), &[true, true]);
//! assert_eq!(ema.current(1), Some(10.0));
//! # Ok::<(), tally_core::Error>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod config;
pub mod operator;
pub mod redirection;
pub mod values;

// Re-export key types
pub use batch::{BatchContext, Run};
pub use config::ConfigError;
pub use operator::{ChunkedOperator, OperatorError};
pub use redirection::GroupRedirectionTable;

/// Result type for tally-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tally-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}
