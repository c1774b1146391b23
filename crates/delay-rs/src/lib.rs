//! # Delay-RS: Delay Buffers and the Shared Simulation Context
//!
//! A delay buffer keeps a bounded history of one state variable so that other
//! components can read it some number of steps in the past:
//!
//! ```text
//!      lag = 0             [ data      <- most recent value
//!      lag = 1               data
//!      ...                   ....
//!      lag = length          data ]    <- oldest value
//! ```
//!
//! Two storage schemes are supported:
//! - **rotate**: fixed ring, addressed through the shared step counter
//! - **concat**: newest row first, every update shifts the history down
//!
//! Reads go through named *entries*, each with its own lag: none (the live
//! value), one homogeneous step count, or one step count per row.
//!
//! The [`SharedContext`] holds the per-step shared arguments (`t`, `i`, `dt`)
//! and every registered delay; it is passed explicitly to every delay
//! operation, so independent simulations never share state.

mod buffer;
mod context;

pub use buffer::{
    BeforeT0, DelayBuffer, DelayStep, DelayTime, Lag, ShapeFn, StepArray, UpdateMethod,
};
pub use context::{Loaded, Shared, SharedArgs, SharedContext};

use dyna_core::DynaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DelayError {
    #[error("Entry {0} has been registered")]
    DuplicateEntry(String),

    #[error("Does not find delay entry \"{0}\"")]
    UnknownEntry(String),

    #[error("Delay name {0} has been used, please assign another name")]
    DuplicateDelay(String),

    #[error("Does not find delay \"{0}\"")]
    UnknownDelay(String),

    #[error("Entry {entry}: provide either \"delay_time\" or \"delay_step\", not both")]
    ConflictingDelaySpec { entry: String },

    #[error("Entry {entry}: only integer delay steps are supported, got {dtype}; divide delay times by dt to get steps")]
    UnsupportedDtype { entry: String, dtype: &'static str },

    #[error("Entry {entry}: delay steps must be non-negative, got {step}")]
    NegativeStep { entry: String, step: i64 },

    #[error("Entry {entry}: heterogeneous delay steps must be one-dimensional, got {ndim} dimensions")]
    UnsupportedShape { entry: String, ndim: usize },

    #[error("Entry {entry}: shape is mismatched, target leading dimension {expected:?} != {got}")]
    LeadingDimMismatch {
        entry: String,
        expected: Option<usize>,
        got: usize,
    },

    #[error("Entry {entry}: {steps} per-row delay steps cannot address {rows} rows")]
    RowsMismatch {
        entry: String,
        steps: usize,
        rows: usize,
    },

    #[error("Delay of {target}: value shape {got:?} does not match {expected:?}")]
    ShapeMismatch {
        target: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("The batch sizes of delay variable and target variable {target} differ ({found:?} != {requested}); reset the target variable first")]
    BatchSizeMismatch {
        target: String,
        found: Option<usize>,
        requested: usize,
    },

    #[error("Delay of {target}: the requested delay length should be less than the maximum delay {length}, but we got {requested}")]
    DelayLengthExceeded {
        target: String,
        requested: usize,
        length: usize,
    },

    #[error("Invalid before_t0 data for {target}: {reason}")]
    InvalidFill { target: String, reason: String },

    #[error("Unknown updating method \"{0}\"")]
    UnknownMethod(String),

    #[error("Cannot find shared data of {0}")]
    MissingShared(String),

    #[error("Shared data {key} must be {expected}, got {got}")]
    SharedType {
        key: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Shared time step must be positive and finite, got {0}")]
    InvalidTimeStep(f64),

    #[error("Entry {entry}: delay time {time} with dt {dt} is not a finite number of steps")]
    NonFiniteDelay { entry: String, time: f64, dt: f64 },

    #[error("Delay target {0} has been dropped")]
    TargetDropped(String),

    #[error(transparent)]
    Core(#[from] DynaError),
}

pub type Result<T> = std::result::Result<T, DelayError>;
