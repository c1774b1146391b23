//! # Dyna Core
//!
//! Shared types and utilities for delayed dynamical simulation.
//!
//! ## Contents
//!
//! | Item | Role |
//! |------|------|
//! | [`Value`] | Plain data exchanged through the shared context and inlined constants |
//! | [`Variable`] | Array state container, shared by reference between components |
//! | [`get_dt`] / [`set_dt`] | Process-wide default time step |
//! | [`is_checking`] | Process-wide strict-checking flag for runtime-guarded errors |
//! | [`SimulationParams`] | Run configuration |
//!
//! ## Design Philosophy
//!
//! 1. Single-threaded cooperative simulation: state is shared with `Rc`
//! 2. Fail loudly on shape and configuration errors
//! 3. Every array is `f64`; integer data lives in dedicated step types

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum DynaError {
    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Index {index} out of bounds for axis of length {len} in {name}")]
    IndexOutOfBounds { name: String, index: usize, len: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, DynaError>;

/// Time point
pub type Time = f64;

/// Shared storage cell behind a [`Variable`]
pub type ArrayCell = Rc<RefCell<ArrayD<f64>>>;

// ============================================================================
// ENVIRONMENT
// ============================================================================

const DEFAULT_DT: f64 = 0.1;

static DT_BITS: AtomicU64 = AtomicU64::new(0x3FB9_9999_9999_999A); // 0.1
static CHECKING: AtomicBool = AtomicBool::new(true);

/// Process-wide default simulation time step
pub fn get_dt() -> Time {
    f64::from_bits(DT_BITS.load(Ordering::Relaxed))
}

/// Set the process-wide default time step
pub fn set_dt(dt: Time) -> Result<()> {
    if !(dt.is_finite() && dt > 0.0) {
        return Err(DynaError::InvalidArgument(format!(
            "time step must be positive and finite, got {dt}"
        )));
    }
    DT_BITS.store(dt.to_bits(), Ordering::Relaxed);
    Ok(())
}

/// Restore the default time step
pub fn reset_dt() {
    DT_BITS.store(DEFAULT_DT.to_bits(), Ordering::Relaxed);
}

/// Whether runtime-guarded errors (e.g. delay length exceeded) are raised
pub fn is_checking() -> bool {
    CHECKING.load(Ordering::Relaxed)
}

pub fn enable_checking() {
    CHECKING.store(true, Ordering::Relaxed);
}

pub fn disable_checking() {
    CHECKING.store(false, Ordering::Relaxed);
}

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Time step
    pub dt: Time,
    /// Total simulated time
    pub duration: Time,
    /// Batch size used when resetting state (None = unbatched)
    pub batch_size: Option<usize>,
    /// Strict checking of runtime-guarded errors
    pub checking: bool,
    /// Seed for the process-wide random stream
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            dt: DEFAULT_DT,
            duration: 10.0,
            batch_size: None,
            checking: true,
            seed: 0,
        }
    }
}

impl SimulationParams {
    /// Number of whole steps covering `duration`
    pub fn n_steps(&self) -> usize {
        if self.dt <= 0.0 || self.duration <= 0.0 {
            return 0;
        }
        (self.duration / self.dt).round() as usize
    }

    /// Install `dt` and the checking flag as process-wide defaults
    pub fn apply(&self) -> Result<()> {
        set_dt(self.dt)?;
        if self.checking {
            enable_checking();
        } else {
            disable_checking();
        }
        Ok(())
    }
}

// ============================================================================
// VALUES
// ============================================================================

/// Plain data value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(ArrayD<f64>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Array(a) if a.len() == 1 => a.iter().next().copied(),
            Value::Array(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<ArrayD<f64>> for Value {
    fn from(v: ArrayD<f64>) -> Self {
        Value::Array(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Array(a) => write!(f, "{a}"),
        }
    }
}

// ============================================================================
// ARRAY STATE CONTAINER
// ============================================================================

#[derive(Debug)]
struct VariableInner {
    name: String,
    storage: ArrayCell,
    batch_axis: Option<usize>,
}

/// Mutable array state shared by reference.
///
/// Cloning a `Variable` clones the handle, not the data: every clone observes
/// the same storage. Delay buffers hold a [`WeakVariable`] instead so they
/// never keep a target alive.
#[derive(Debug, Clone)]
pub struct Variable {
    inner: Rc<VariableInner>,
}

impl Variable {
    pub fn new(name: &str, value: ArrayD<f64>) -> Self {
        Self {
            inner: Rc::new(VariableInner {
                name: name.to_string(),
                storage: Rc::new(RefCell::new(value)),
                batch_axis: None,
            }),
        }
    }

    /// Variable whose `axis` is the batch dimension
    pub fn batched(name: &str, value: ArrayD<f64>, axis: usize) -> Result<Self> {
        if axis >= value.ndim() {
            return Err(DynaError::InvalidArgument(format!(
                "batch axis {axis} out of range for {name} with {} dimensions",
                value.ndim()
            )));
        }
        Ok(Self {
            inner: Rc::new(VariableInner {
                name: name.to_string(),
                storage: Rc::new(RefCell::new(value)),
                batch_axis: Some(axis),
            }),
        })
    }

    /// 1-D variable
    pub fn from_vec(name: &str, values: Vec<f64>) -> Self {
        let n = values.len();
        let value = ArrayD::from_shape_vec(IxDyn(&[n]), values)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        Self::new(name, value)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.storage.borrow().shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.inner.storage.borrow().ndim()
    }

    pub fn batch_axis(&self) -> Option<usize> {
        self.inner.batch_axis
    }

    pub fn batch_size(&self) -> Option<usize> {
        let axis = self.inner.batch_axis?;
        self.inner.storage.borrow().shape().get(axis).copied()
    }

    pub fn value(&self) -> Ref<'_, ArrayD<f64>> {
        self.inner.storage.borrow()
    }

    /// Owned copy of the current value
    pub fn snapshot(&self) -> ArrayD<f64> {
        self.inner.storage.borrow().clone()
    }

    /// Whole-value replacement
    pub fn set_value(&self, value: ArrayD<f64>) {
        *self.inner.storage.borrow_mut() = value;
    }

    /// Overwrite with a value of the same shape
    pub fn assign(&self, value: &ArrayD<f64>) -> Result<()> {
        let mut storage = self.inner.storage.borrow_mut();
        if storage.shape() != value.shape() {
            return Err(DynaError::ShapeMismatch {
                name: self.inner.name.clone(),
                expected: storage.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        storage.assign(value);
        Ok(())
    }

    /// Indexed in-place write along the leading axis
    pub fn assign_row(&self, index: usize, row: &ArrayD<f64>) -> Result<()> {
        let mut storage = self.inner.storage.borrow_mut();
        let len = storage.shape().first().copied().unwrap_or(0);
        if index >= len {
            return Err(DynaError::IndexOutOfBounds {
                name: self.inner.name.clone(),
                index,
                len,
            });
        }
        let mut slot = storage.index_axis_mut(Axis(0), index);
        if slot.shape() != row.shape() {
            return Err(DynaError::ShapeMismatch {
                name: self.inner.name.clone(),
                expected: slot.shape().to_vec(),
                got: row.shape().to_vec(),
            });
        }
        slot.assign(row);
        Ok(())
    }

    /// The shared storage cell, for by-reference passing
    pub fn storage(&self) -> ArrayCell {
        Rc::clone(&self.inner.storage)
    }

    pub fn downgrade(&self) -> WeakVariable {
        WeakVariable {
            inner: Rc::downgrade(&self.inner),
            name: self.inner.name.clone(),
        }
    }

    /// Whether two handles point at the same state
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning reference to a [`Variable`]
#[derive(Debug, Clone)]
pub struct WeakVariable {
    inner: Weak<VariableInner>,
    name: String,
}

impl WeakVariable {
    pub fn upgrade(&self) -> Option<Variable> {
        self.inner.upgrade().map(|inner| Variable { inner })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
