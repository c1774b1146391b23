//! Fixed-capacity history of one state variable.

use crate::context::{checked_dt, SharedArgs};
use crate::{DelayError, Result};
use dyna_core::{is_checking, DynaError, Variable, WeakVariable};
use ndarray::{concatenate, Array1, ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

/// Generator invoked with a requested shape
pub type ShapeFn<T> = Box<dyn Fn(&[usize]) -> T>;

// ============================================================================
// SPECIFIERS
// ============================================================================

/// How the history is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMethod {
    /// Ring buffer addressed by the shared step counter
    #[default]
    Rotate,
    /// Newest row first, shifted on every update
    Concat,
}

impl FromStr for UpdateMethod {
    type Err = DelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rotate" => Ok(UpdateMethod::Rotate),
            "concat" => Ok(UpdateMethod::Concat),
            other => Err(DelayError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMethod::Rotate => write!(f, "rotate"),
            UpdateMethod::Concat => write!(f, "concat"),
        }
    }
}

/// Data representing the time before the simulation started
#[derive(Default)]
pub enum BeforeT0 {
    #[default]
    Zero,
    Scalar(f64),
    /// Broadcast against the target shape
    Array(ArrayD<f64>),
    /// Called with `(rows,) + target_shape`
    Generator(ShapeFn<ArrayD<f64>>),
}

impl fmt::Debug for BeforeT0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeforeT0::Zero => write!(f, "Zero"),
            BeforeT0::Scalar(x) => write!(f, "Scalar({x})"),
            BeforeT0::Array(a) => write!(f, "Array({:?})", a.shape()),
            BeforeT0::Generator(_) => write!(f, "Generator"),
        }
    }
}

/// Step array with its element type preserved, so non-integer steps can be rejected
#[derive(Debug, Clone, PartialEq)]
pub enum StepArray {
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
}

/// Delay expressed in steps
pub enum DelayStep {
    Scalar(i64),
    Array(StepArray),
    /// Called with the target shape
    Generator(ShapeFn<StepArray>),
}

impl From<i64> for DelayStep {
    fn from(step: i64) -> Self {
        DelayStep::Scalar(step)
    }
}

impl From<Vec<i64>> for DelayStep {
    fn from(steps: Vec<i64>) -> Self {
        DelayStep::Array(StepArray::Int(Array1::from(steps).into_dyn()))
    }
}

impl From<ArrayD<i64>> for DelayStep {
    fn from(steps: ArrayD<i64>) -> Self {
        DelayStep::Array(StepArray::Int(steps))
    }
}

/// Delay expressed in time units, converted with the shared `dt`
pub enum DelayTime {
    Scalar(f64),
    Array(ArrayD<f64>),
    /// Called with the target shape
    Generator(ShapeFn<ArrayD<f64>>),
}

impl From<f64> for DelayTime {
    fn from(time: f64) -> Self {
        DelayTime::Scalar(time)
    }
}

impl From<ArrayD<f64>> for DelayTime {
    fn from(time: ArrayD<f64>) -> Self {
        DelayTime::Array(time)
    }
}

/// Resolved read configuration of one entry
#[derive(Debug, Clone, PartialEq)]
pub enum Lag {
    /// Live target value
    Current,
    /// Same lag for every element
    Uniform(usize),
    /// One lag per row of the target
    PerRow(Array1<usize>),
}

impl Lag {
    pub fn max_step(&self) -> Option<usize> {
        match self {
            Lag::Current => None,
            Lag::Uniform(d) => Some(*d),
            Lag::PerRow(steps) => Some(steps.iter().copied().max().unwrap_or(0)),
        }
    }
}

/// `time / dt` as a step count, tolerant to floating-point noise
/// (`2.0 / 0.1` is 19.999999999999996 and must give 20)
fn round_or_floor(x: f64) -> i64 {
    let nearest = x.round();
    if (x - nearest).abs() <= 1e-9 * x.abs().max(1.0) {
        nearest as i64
    } else {
        x.floor() as i64
    }
}

// ============================================================================
// DELAY BUFFER
// ============================================================================

/// Bounded history of a state variable, read at configurable lags.
///
/// Storage has shape `(length + 1,) + target_shape`. The target is held
/// weakly: the buffer never keeps it alive.
pub struct DelayBuffer {
    target: WeakVariable,
    length: usize,
    before_t0: BeforeT0,
    method: UpdateMethod,
    entries: BTreeMap<String, Lag>,
    data: Option<ArrayD<f64>>,
    data_batch_axis: Option<usize>,
}

impl fmt::Debug for DelayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayBuffer")
            .field("target", &self.target.name())
            .field("length", &self.length)
            .field("method", &self.method)
            .field("before_t0", &self.before_t0)
            .field("entries", &self.entries)
            .finish()
    }
}

impl fmt::Display for DelayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self.target_shape().unwrap_or_default();
        write!(
            f,
            "DelayBuffer(num_delay_step={}, delay_target_shape={:?}, update_method={})",
            self.length, shape, self.method
        )
    }
}

impl DelayBuffer {
    /// Create a delay for `target` holding `length` past steps.
    ///
    /// The storage is laid out as at step 0; call [`reset_state`](Self::reset_state)
    /// to re-lay it out once a simulation is under way.
    pub fn new(
        target: &Variable,
        length: usize,
        before_t0: BeforeT0,
        method: UpdateMethod,
    ) -> Result<Self> {
        let mut delay = Self {
            target: target.downgrade(),
            length,
            before_t0,
            method,
            entries: BTreeMap::new(),
            data: None,
            data_batch_axis: target.batch_axis().map(|axis| axis + 1),
        };
        if length > 0 {
            delay.data = Some(delay.allocate(target, length, 0)?);
        }
        debug!(var = %target.name(), length, %method, "delay created");
        Ok(delay)
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn method(&self) -> UpdateMethod {
        self.method
    }

    pub fn entries(&self) -> &BTreeMap<String, Lag> {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&Lag> {
        self.entries.get(name)
    }

    /// Raw storage (row order depends on the update method)
    pub fn data(&self) -> Option<&ArrayD<f64>> {
        self.data.as_ref()
    }

    /// Batch axis of the storage (the target's batch axis shifted by one)
    pub fn data_batch_axis(&self) -> Option<usize> {
        self.data_batch_axis
    }

    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    pub fn target(&self) -> Result<Variable> {
        self.target
            .upgrade()
            .ok_or_else(|| DelayError::TargetDropped(self.target.name().to_string()))
    }

    pub fn target_shape(&self) -> Result<Vec<usize>> {
        Ok(self.target()?.shape())
    }

    /// Register a named read access.
    ///
    /// At most one of `delay_time` and `delay_step` may be given; with
    /// neither, the entry reads the live target value. Capacity grows to
    /// cover the new lag.
    pub fn register_entry(
        &mut self,
        shared: &SharedArgs,
        entry: &str,
        delay_time: Option<DelayTime>,
        delay_step: Option<DelayStep>,
    ) -> Result<&mut Self> {
        if self.entries.contains_key(entry) {
            return Err(DelayError::DuplicateEntry(entry.to_string()));
        }
        let shape = self.target_shape()?;

        let delay_step = match (delay_time, delay_step) {
            (Some(_), Some(_)) => {
                return Err(DelayError::ConflictingDelaySpec {
                    entry: entry.to_string(),
                })
            }
            (Some(time), None) => Some(Self::time_to_step(entry, time, shared.dt(), &shape)?),
            (None, step) => step,
        };
        let lag = Self::classify(entry, delay_step, &shape)?;

        if let Some(max_step) = lag.max_step() {
            if max_step > self.length {
                self.grow(shared, max_step)?;
            }
        }
        debug!(var = %self.target.name(), entry, ?lag, length = self.length, "delay entry registered");
        self.entries.insert(entry.to_string(), lag);
        Ok(self)
    }

    fn time_to_step(entry: &str, time: DelayTime, dt: f64, shape: &[usize]) -> Result<DelayStep> {
        let dt = checked_dt(dt)?;
        let to_step = |t: f64| -> Result<i64> {
            let steps = t / dt;
            if !steps.is_finite() || steps.abs() >= i64::MAX as f64 {
                return Err(DelayError::NonFiniteDelay {
                    entry: entry.to_string(),
                    time: t,
                    dt,
                });
            }
            Ok(round_or_floor(steps))
        };
        let times = match time {
            DelayTime::Scalar(t) => return Ok(DelayStep::Scalar(to_step(t)?)),
            DelayTime::Array(a) => a,
            DelayTime::Generator(generate) => generate(shape),
        };
        let steps = times.iter().map(|&t| to_step(t)).collect::<Result<Vec<_>>>()?;
        let steps = ArrayD::from_shape_vec(times.raw_dim(), steps)
            .map_err(|e| DelayError::Core(DynaError::InvalidArgument(e.to_string())))?;
        Ok(DelayStep::Array(StepArray::Int(steps)))
    }

    fn classify(entry: &str, step: Option<DelayStep>, shape: &[usize]) -> Result<Lag> {
        let checked = |step: i64| -> Result<usize> {
            usize::try_from(step).map_err(|_| DelayError::NegativeStep {
                entry: entry.to_string(),
                step,
            })
        };

        let steps = match step {
            None => return Ok(Lag::Current),
            Some(DelayStep::Scalar(step)) => return Ok(Lag::Uniform(checked(step)?)),
            Some(DelayStep::Array(steps)) => steps,
            Some(DelayStep::Generator(generate)) => generate(shape),
        };
        let steps = match steps {
            StepArray::Int(steps) => steps,
            StepArray::Float(_) => {
                return Err(DelayError::UnsupportedDtype {
                    entry: entry.to_string(),
                    dtype: "float",
                })
            }
        };

        match steps.ndim() {
            0 => {
                let step = steps.iter().next().copied().unwrap_or(0);
                Ok(Lag::Uniform(checked(step)?))
            }
            1 => {
                let expected = shape.first().copied();
                if expected != Some(steps.len()) {
                    return Err(DelayError::LeadingDimMismatch {
                        entry: entry.to_string(),
                        expected,
                        got: steps.len(),
                    });
                }
                let mut rows = Vec::with_capacity(steps.len());
                for &step in steps.iter() {
                    rows.push(checked(step)?);
                }
                Ok(Lag::PerRow(Array1::from(rows)))
            }
            ndim => Err(DelayError::UnsupportedShape {
                entry: entry.to_string(),
                ndim,
            }),
        }
    }

    /// Value recorded `entry`'s lag steps ago.
    ///
    /// `rows` optionally selects rows of the target. Per-row entries without
    /// `rows` address every row when the lag vector covers the target.
    pub fn at(
        &self,
        shared: &SharedArgs,
        entry: &str,
        rows: Option<&[usize]>,
    ) -> Result<ArrayD<f64>> {
        let lag = self
            .entries
            .get(entry)
            .ok_or_else(|| DelayError::UnknownEntry(entry.to_string()))?;

        if self.data.is_none() {
            return self.target_value(rows);
        }
        match lag {
            Lag::Current => self.target_value(rows),
            Lag::Uniform(_) => self.retrieve(shared, lag, rows),
            Lag::PerRow(steps) => match rows {
                Some(rows) => self.retrieve(shared, lag, Some(rows)),
                None => {
                    let n_rows = self.target_shape()?.first().copied().unwrap_or(0);
                    if steps.len() != n_rows {
                        return Err(DelayError::RowsMismatch {
                            entry: entry.to_string(),
                            steps: steps.len(),
                            rows: n_rows,
                        });
                    }
                    let all: Vec<usize> = (0..n_rows).collect();
                    self.retrieve(shared, lag, Some(&all))
                }
            },
        }
    }

    /// Low-level read at an explicit lag
    pub fn retrieve(
        &self,
        shared: &SharedArgs,
        lag: &Lag,
        rows: Option<&[usize]>,
    ) -> Result<ArrayD<f64>> {
        let max_step = match lag.max_step() {
            None => return self.target_value(rows),
            Some(max_step) => max_step,
        };
        if is_checking() && max_step > self.length {
            return Err(DelayError::DelayLengthExceeded {
                target: self.target.name().to_string(),
                requested: max_step,
                length: self.length,
            });
        }
        let data = match &self.data {
            Some(data) => data,
            None => return self.target_value(rows),
        };
        let counter = self.counter(shared)?;
        let n = self.length + 1;

        match lag {
            Lag::Current => self.target_value(rows),
            Lag::Uniform(step) => {
                let slab = data.index_axis(Axis(0), self.row_for(*step, counter, n));
                match rows {
                    None => Ok(slab.to_owned()),
                    Some(rows) => {
                        self.check_rows(rows, slab.shape().first().copied().unwrap_or(0))?;
                        Ok(slab.select(Axis(0), rows))
                    }
                }
            }
            Lag::PerRow(steps) => {
                let rows = rows.unwrap_or(&[]);
                if rows.len() != steps.len() {
                    return Err(DelayError::RowsMismatch {
                        entry: format!("<per-row lag of {}>", self.target.name()),
                        steps: steps.len(),
                        rows: rows.len(),
                    });
                }
                self.check_rows(rows, data.shape().get(1).copied().unwrap_or(0))?;
                let mut out_shape = vec![rows.len()];
                out_shape.extend_from_slice(data.shape().get(2..).unwrap_or(&[]));
                let mut out = ArrayD::zeros(IxDyn(&out_shape));
                for (k, (&step, &row)) in steps.iter().zip(rows.iter()).enumerate() {
                    let source = data
                        .index_axis(Axis(0), self.row_for(step, counter, n))
                        .index_axis(Axis(0), row)
                        .to_owned();
                    out.index_axis_mut(Axis(0), k).assign(&source);
                }
                Ok(out)
            }
        }
    }

    /// Push the newest value (the target's current value when `latest` is None)
    pub fn update(&mut self, shared: &SharedArgs, latest: Option<&ArrayD<f64>>) -> Result<()> {
        match self.prepare_update(shared, latest)? {
            Some((row, latest)) => {
                self.write_row(row, &latest);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Storage row and value the next update writes, checked but not applied.
    /// `None` when there is no storage.
    pub(crate) fn prepare_update(
        &self,
        shared: &SharedArgs,
        latest: Option<&ArrayD<f64>>,
    ) -> Result<Option<(usize, ArrayD<f64>)>> {
        let Some(data) = self.data.as_ref() else {
            return Ok(None);
        };
        let latest = match latest {
            Some(value) => value.clone(),
            None => self.target()?.snapshot(),
        };
        let counter = self.counter(shared)?;
        let row = self.row_for(0, counter, self.length + 1);

        let row_shape = data.shape().get(1..).unwrap_or(&[]);
        if latest.shape() != row_shape {
            return Err(DelayError::ShapeMismatch {
                target: self.target.name().to_string(),
                expected: row_shape.to_vec(),
                got: latest.shape().to_vec(),
            });
        }
        Ok(Some((row, latest)))
    }

    pub(crate) fn write_row(&mut self, row: usize, latest: &ArrayD<f64>) {
        let n = self.length + 1;
        let method = self.method;
        let Some(data) = self.data.as_mut() else {
            return;
        };
        match method {
            UpdateMethod::Rotate => {
                data.index_axis_mut(Axis(0), row).assign(latest);
            }
            UpdateMethod::Concat => {
                // drop the oldest row, prepend the newest
                for r in (1..n).rev() {
                    let previous = data.index_axis(Axis(0), r - 1).to_owned();
                    data.index_axis_mut(Axis(0), r).assign(&previous);
                }
                data.index_axis_mut(Axis(0), 0).assign(latest);
            }
        }
        trace!(var = %self.target.name(), row, "delay updated");
    }

    /// Reallocate storage from the target's current value
    pub fn reset_state(&mut self, shared: &SharedArgs, batch_size: Option<usize>) -> Result<()> {
        let target = self.target()?;
        self.check_batch(&target, batch_size)?;
        self.data_batch_axis = target.batch_axis().map(|axis| axis + 1);
        if self.data.is_some() {
            let counter = shared.step_index_or_start();
            self.data = Some(self.allocate(&target, self.length, counter)?);
        }
        debug!(var = %target.name(), ?batch_size, "delay reset");
        Ok(())
    }

    pub(crate) fn check_batch(&self, target: &Variable, batch_size: Option<usize>) -> Result<()> {
        if let Some(requested) = batch_size {
            let found = target.batch_size();
            if found != Some(requested) {
                return Err(DelayError::BatchSizeMismatch {
                    target: target.name().to_string(),
                    found,
                    requested,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // layout
    // ------------------------------------------------------------------------

    fn counter(&self, shared: &SharedArgs) -> Result<i64> {
        match self.method {
            UpdateMethod::Rotate => shared.step_index(),
            UpdateMethod::Concat => Ok(0),
        }
    }

    /// Storage row holding lag `step` at shared counter `counter`.
    ///
    /// Rotate: `(step - counter) mod n`. An update at counter `i` writes row
    /// `-i mod n`; one counter later that row is read as lag 1.
    fn row_for(&self, step: usize, counter: i64, n: usize) -> usize {
        match self.method {
            UpdateMethod::Rotate => (step as i64 - counter).rem_euclid(n as i64) as usize,
            UpdateMethod::Concat => step.min(n - 1),
        }
    }

    /// Storage for `length` lags: lag 0 is the target, the rest `before_t0`
    fn allocate(&self, target: &Variable, length: usize, counter: i64) -> Result<ArrayD<f64>> {
        let current = target.snapshot();
        let fill = self.fill_rows(length, current.shape())?;
        let mut first_shape = vec![1];
        first_shape.extend_from_slice(current.shape());
        let first = current
            .into_shape_with_order(IxDyn(&first_shape))
            .map_err(|e| self.fill_error(e.to_string()))?;
        let by_lag = concatenate(Axis(0), &[first.view(), fill.view()])
            .map_err(|e| self.fill_error(e.to_string()))?;
        Ok(self.layout(&by_lag, counter))
    }

    fn fill_rows(&self, rows: usize, row_shape: &[usize]) -> Result<ArrayD<f64>> {
        let mut shape = vec![rows];
        shape.extend_from_slice(row_shape);
        match &self.before_t0 {
            BeforeT0::Zero => Ok(ArrayD::zeros(IxDyn(&shape))),
            BeforeT0::Scalar(x) => Ok(ArrayD::from_elem(IxDyn(&shape), *x)),
            BeforeT0::Array(a) => a
                .broadcast(IxDyn(&shape))
                .map(|view| view.to_owned())
                .ok_or_else(|| {
                    self.fill_error(format!("shape {:?} does not broadcast to {:?}", a.shape(), shape))
                }),
            BeforeT0::Generator(generate) => {
                let a = generate(&shape);
                if a.shape() != shape.as_slice() {
                    return Err(self.fill_error(format!(
                        "generator returned shape {:?}, expected {:?}",
                        a.shape(),
                        shape
                    )));
                }
                Ok(a)
            }
        }
    }

    fn fill_error(&self, reason: String) -> DelayError {
        DelayError::InvalidFill {
            target: self.target.name().to_string(),
            reason,
        }
    }

    /// Place rows ordered by lag into storage order
    fn layout(&self, by_lag: &ArrayD<f64>, counter: i64) -> ArrayD<f64> {
        let n = by_lag.shape()[0];
        match self.method {
            UpdateMethod::Concat => by_lag.clone(),
            UpdateMethod::Rotate => {
                let mut out = ArrayD::zeros(by_lag.raw_dim());
                for lag in 0..n {
                    out.index_axis_mut(Axis(0), self.row_for(lag, counter, n))
                        .assign(&by_lag.index_axis(Axis(0), lag));
                }
                out
            }
        }
    }

    /// Storage rows ordered by lag
    fn history(&self, data: &ArrayD<f64>, counter: i64) -> ArrayD<f64> {
        let n = data.shape()[0];
        let mut out = ArrayD::zeros(data.raw_dim());
        for lag in 0..n {
            out.index_axis_mut(Axis(0), lag)
                .assign(&data.index_axis(Axis(0), self.row_for(lag, counter, n)));
        }
        out
    }

    /// Extend capacity to `new_length`, keeping every reachable row
    fn grow(&mut self, shared: &SharedArgs, new_length: usize) -> Result<()> {
        let counter = shared.step_index_or_start();
        let data = match &self.data {
            None => {
                let target = self.target()?;
                self.allocate(&target, new_length, counter)?
            }
            Some(data) => {
                let by_lag = self.history(data, counter);
                let row_shape = data.shape()[1..].to_vec();
                let fill = self.fill_rows(new_length - self.length, &row_shape)?;
                let grown = concatenate(Axis(0), &[by_lag.view(), fill.view()])
                    .map_err(|e| self.fill_error(e.to_string()))?;
                self.layout(&grown, counter)
            }
        };
        debug!(var = %self.target.name(), from = self.length, to = new_length, "delay capacity grown");
        self.data = Some(data);
        self.length = new_length;
        Ok(())
    }

    fn target_value(&self, rows: Option<&[usize]>) -> Result<ArrayD<f64>> {
        let value = self.target()?.snapshot();
        match rows {
            None => Ok(value),
            Some(rows) => {
                self.check_rows(rows, value.shape().first().copied().unwrap_or(0))?;
                Ok(value.select(Axis(0), rows))
            }
        }
    }

    fn check_rows(&self, rows: &[usize], len: usize) -> Result<()> {
        if let Some(&index) = rows.iter().find(|&&r| r >= len) {
            return Err(DynaError::IndexOutOfBounds {
                name: self.target.name().to_string(),
                index,
                len,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dyna_core::Value;
    use ndarray::{arr1, arr2};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shared_at(i: i64) -> SharedArgs {
        let mut shared = SharedArgs::new();
        shared.insert("i", i.into());
        shared
    }

    fn push(delay: &mut DelayBuffer, target: &Variable, shared: &mut SharedArgs, i: i64, x: f64) {
        shared.insert("i", i.into());
        target.set_value(arr1(&[x]).into_dyn());
        delay.update(shared, None).unwrap();
    }

    #[test]
    fn test_rotate_reads_lag() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut shared = shared_at(0);
        let mut delay = DelayBuffer::new(&target, 3, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "d2", None, Some(DelayStep::Scalar(2))).unwrap();
        for (k, x) in [1.0, 2.0, 3.0, 4.0, 5.0].into_iter().enumerate() {
            push(&mut delay, &target, &mut shared, k as i64 + 1, x);
        }
        assert_eq!(delay.at(&shared, "d2", None).unwrap(), arr1(&[3.0]).into_dyn());
    }

    #[test]
    fn test_before_t0_visible_before_history_fills() {
        let target = Variable::from_vec("v", vec![7.0]);
        let mut shared = shared_at(0);
        let mut delay =
            DelayBuffer::new(&target, 2, BeforeT0::Scalar(-1.0), UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "d2", None, Some(DelayStep::Scalar(2))).unwrap();
        assert_eq!(delay.at(&shared, "d2", None).unwrap()[[0]], -1.0);
        push(&mut delay, &target, &mut shared, 1, 8.0);
        assert_eq!(delay.at(&shared, "d2", None).unwrap()[[0]], -1.0);
        push(&mut delay, &target, &mut shared, 2, 9.0);
        // two steps in: the initial target value
        assert_eq!(delay.at(&shared, "d2", None).unwrap()[[0]], 7.0);
    }

    #[test]
    fn test_concat_length_one_keeps_previous() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 1, BeforeT0::Zero, UpdateMethod::Concat).unwrap();
        delay.register_entry(&shared, "prev", None, Some(DelayStep::Scalar(1))).unwrap();
        let mut seen = vec![];
        for x in [1.0, 2.0, 3.0] {
            push(&mut delay, &target, &mut shared, 0, x);
            seen.push(delay.at(&shared, "prev", None).unwrap()[[0]]);
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_concat_drops_oldest() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 2, BeforeT0::Zero, UpdateMethod::Concat).unwrap();
        for x in [1.0, 2.0, 3.0, 4.0] {
            push(&mut delay, &target, &mut shared, 0, x);
        }
        let data = delay.data().unwrap();
        assert_eq!(data.iter().copied().collect::<Vec<_>>(), vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_both_time_and_step_fails() {
        let target = Variable::from_vec("v", vec![0.0]);
        let shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        let err = delay
            .register_entry(&shared, "x", Some(DelayTime::Scalar(1.0)), Some(DelayStep::Scalar(1)))
            .unwrap_err();
        assert!(matches!(err, DelayError::ConflictingDelaySpec { .. }));
    }

    #[test]
    fn test_duplicate_entry_fails() {
        let target = Variable::from_vec("v", vec![0.0]);
        let shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "x", None, None).unwrap();
        assert!(matches!(
            delay.register_entry(&shared, "x", None, None),
            Err(DelayError::DuplicateEntry(_))
        ));
    }

    #[test]
    fn test_delay_time_converts_with_dt() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut shared = SharedArgs::new();
        shared.set_dt(0.1).unwrap();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "x", Some(DelayTime::Scalar(2.0)), None).unwrap();
        assert_eq!(delay.entry("x"), Some(&Lag::Uniform(20)));
        assert_eq!(delay.length(), 20);
    }

    #[test]
    fn test_heterogeneous_classification() {
        let target = Variable::from_vec("v", vec![0.0, 0.0, 0.0]);
        let shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay
            .register_entry(&shared, "het", None, Some(vec![0i64, 1, 4].into()))
            .unwrap();
        assert_eq!(delay.length(), 4);
        assert!(matches!(delay.entry("het"), Some(Lag::PerRow(_))));

        let err = delay
            .register_entry(&shared, "bad", None, Some(vec![1i64, 2].into()))
            .unwrap_err();
        assert!(matches!(err, DelayError::LeadingDimMismatch { .. }));

        let float_steps = DelayStep::Array(StepArray::Float(arr1(&[1.0, 1.0, 1.0]).into_dyn()));
        let err = delay.register_entry(&shared, "f", None, Some(float_steps)).unwrap_err();
        assert!(matches!(err, DelayError::UnsupportedDtype { .. }));

        let err = delay.register_entry(&shared, "neg", None, Some((-1i64).into())).unwrap_err();
        assert!(matches!(err, DelayError::NegativeStep { .. }));
    }

    #[test]
    fn test_heterogeneous_diagonal_gather() {
        let target = Variable::from_vec("v", vec![0.0, 0.0]);
        let mut shared = shared_at(0);
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay
            .register_entry(&shared, "het", None, Some(vec![0i64, 2].into()))
            .unwrap();
        for (k, x) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            shared.insert("i", (k as i64 + 1).into());
            target.set_value(arr1(&[x, 10.0 * x]).into_dyn());
            delay.update(&shared, None).unwrap();
        }
        // row 0 at lag 0, row 1 at lag 2
        assert_eq!(delay.at(&shared, "het", None).unwrap(), arr1(&[3.0, 10.0]).into_dyn());
        assert_eq!(delay.at(&shared, "het", Some(&[1, 0])).unwrap(), arr1(&[30.0, 1.0]).into_dyn());
    }

    #[test]
    fn test_generator_steps_are_heterogeneous() {
        let target = Variable::from_vec("v", vec![0.0, 0.0]);
        let shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        let generate: ShapeFn<StepArray> =
            Box::new(|shape| StepArray::Int(ArrayD::from_elem(IxDyn(&[shape[0]]), 3)));
        delay
            .register_entry(&shared, "gen", None, Some(DelayStep::Generator(generate)))
            .unwrap();
        assert_eq!(delay.length(), 3);
    }

    #[test]
    fn test_growth_preserves_history() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut shared = shared_at(0);
        let mut delay = DelayBuffer::new(&target, 1, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "d1", None, Some(DelayStep::Scalar(1))).unwrap();
        push(&mut delay, &target, &mut shared, 1, 1.0);
        push(&mut delay, &target, &mut shared, 2, 2.0);
        delay.register_entry(&shared, "d3", None, Some(DelayStep::Scalar(3))).unwrap();
        assert_eq!(delay.at(&shared, "d1", None).unwrap()[[0]], 1.0);
        push(&mut delay, &target, &mut shared, 3, 3.0);
        push(&mut delay, &target, &mut shared, 4, 4.0);
        assert_eq!(delay.at(&shared, "d3", None).unwrap()[[0]], 1.0);
    }

    #[test]
    fn test_length_exceeded() {
        let target = Variable::from_vec("v", vec![0.0]);
        let shared = shared_at(0);
        let delay = DelayBuffer::new(&target, 2, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        let err = delay.retrieve(&shared, &Lag::Uniform(3), None).unwrap_err();
        assert!(matches!(err, DelayError::DelayLengthExceeded { length: 2, requested: 3, .. }));
    }

    #[test]
    fn test_zero_length_reads_target() {
        let target = Variable::from_vec("v", vec![5.0]);
        let shared = SharedArgs::new();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        delay.register_entry(&shared, "now", None, Some(DelayStep::Scalar(0))).unwrap();
        assert!(delay.data().is_none());
        assert_eq!(delay.at(&shared, "now", None).unwrap()[[0]], 5.0);
    }

    #[test]
    fn test_reset_state_batch_mismatch() {
        let target = Variable::batched("b", ArrayD::zeros(IxDyn(&[2, 3])), 0).unwrap();
        let shared = shared_at(0);
        let mut delay = DelayBuffer::new(&target, 2, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        assert_eq!(delay.data_batch_axis(), Some(1));
        let before = delay.data().cloned();
        assert!(matches!(
            delay.reset_state(&shared, Some(4)),
            Err(DelayError::BatchSizeMismatch { requested: 4, .. })
        ));
        assert_eq!(delay.data().cloned(), before);
        delay.reset_state(&shared, Some(2)).unwrap();
        assert_eq!(delay.data().unwrap().shape(), &[3, 2, 3]);
    }

    #[test]
    fn test_before_t0_array_broadcast() {
        let target = Variable::new("m", arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let fill = arr1(&[9.0, 8.0]).into_dyn();
        let delay = DelayBuffer::new(&target, 2, BeforeT0::Array(fill), UpdateMethod::Concat).unwrap();
        let data = delay.data().unwrap();
        assert_eq!(data[[0, 1, 1]], 4.0);
        assert_eq!(data[[2, 1, 0]], 9.0);

        let bad = arr1(&[1.0, 2.0, 3.0]).into_dyn();
        assert!(DelayBuffer::new(&target, 1, BeforeT0::Array(bad), UpdateMethod::Concat).is_err());
    }

    #[test]
    fn test_dropped_target() {
        let target = Variable::from_vec("gone", vec![0.0]);
        let shared = shared_at(1);
        let mut delay = DelayBuffer::new(&target, 1, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        drop(target);
        assert!(matches!(delay.update(&shared, None), Err(DelayError::TargetDropped(_))));
    }

    #[test]
    fn test_before_t0_generator_fills_past_rows() {
        let target = Variable::from_vec("v", vec![1.0, 2.0]);
        let shared = shared_at(0);
        let requested = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&requested);
        let generate: ShapeFn<ArrayD<f64>> = Box::new(move |shape| {
            *seen.borrow_mut() = shape.to_vec();
            ArrayD::from_shape_fn(IxDyn(shape), |ix| 10.0 + ix[0] as f64)
        });
        let mut delay =
            DelayBuffer::new(&target, 2, BeforeT0::Generator(generate), UpdateMethod::Rotate).unwrap();
        // (rows,) + target shape
        assert_eq!(*requested.borrow(), vec![2, 2]);

        delay.register_entry(&shared, "d1", None, Some(DelayStep::Scalar(1))).unwrap();
        delay.register_entry(&shared, "d2", None, Some(DelayStep::Scalar(2))).unwrap();
        assert_eq!(delay.at(&shared, "d1", None).unwrap(), arr1(&[10.0, 10.0]).into_dyn());
        assert_eq!(delay.at(&shared, "d2", None).unwrap(), arr1(&[11.0, 11.0]).into_dyn());
    }

    #[test]
    fn test_before_t0_generator_wrong_shape() {
        let target = Variable::from_vec("v", vec![1.0, 2.0]);
        let generate: ShapeFn<ArrayD<f64>> = Box::new(|_| ArrayD::zeros(IxDyn(&[3])));
        let err = DelayBuffer::new(&target, 2, BeforeT0::Generator(generate), UpdateMethod::Rotate)
            .unwrap_err();
        assert!(matches!(err, DelayError::InvalidFill { ref target, .. } if target == "v"));
    }

    #[test]
    fn test_delay_time_array_is_per_row() {
        let target = Variable::from_vec("v", vec![0.0, 0.0, 0.0]);
        let mut shared = SharedArgs::new();
        shared.set_dt(0.1).unwrap();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        let times = arr1(&[0.1, 0.2, 0.45]).into_dyn();
        delay.register_entry(&shared, "het", Some(times.into()), None).unwrap();
        assert_eq!(delay.entry("het"), Some(&Lag::PerRow(arr1(&[1, 2, 4]))));
        assert_eq!(delay.length(), 4);
    }

    #[test]
    fn test_delay_time_generator_gets_target_shape() {
        let target = Variable::from_vec("v", vec![0.0, 0.0]);
        let mut shared = SharedArgs::new();
        shared.set_dt(0.1).unwrap();
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();
        let requested = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&requested);
        let generate: ShapeFn<ArrayD<f64>> = Box::new(move |shape| {
            *seen.borrow_mut() = shape.to_vec();
            ArrayD::from_elem(IxDyn(&[shape[0]]), 0.3)
        });
        delay
            .register_entry(&shared, "gen", Some(DelayTime::Generator(generate)), None)
            .unwrap();
        assert_eq!(*requested.borrow(), vec![2]);
        assert_eq!(delay.entry("gen"), Some(&Lag::PerRow(arr1(&[3, 3]))));
        assert_eq!(delay.length(), 3);
    }

    #[test]
    fn test_unusable_dt_is_a_configuration_error() {
        let target = Variable::from_vec("v", vec![0.0]);
        let mut delay = DelayBuffer::new(&target, 0, BeforeT0::Zero, UpdateMethod::Rotate).unwrap();

        let mut shared = SharedArgs::new();
        assert!(matches!(shared.set_dt(0.0), Err(DelayError::InvalidTimeStep(_))));
        assert!(matches!(shared.set_dt(f64::NAN), Err(DelayError::InvalidTimeStep(_))));

        // written around the checked setter
        shared.insert("dt", Value::Float(0.0));
        let err = delay
            .register_entry(&shared, "x", Some(DelayTime::Scalar(1.0)), None)
            .unwrap_err();
        assert!(matches!(err, DelayError::InvalidTimeStep(_)));

        shared.set_dt(1e-300).unwrap();
        let err = delay
            .register_entry(&shared, "y", Some(DelayTime::Scalar(1e300)), None)
            .unwrap_err();
        assert!(matches!(err, DelayError::NonFiniteDelay { ref entry, .. } if entry == "y"));
        assert_eq!(delay.length(), 0);
        assert!(delay.entries().is_empty());
    }

    #[test]
    fn test_update_method_from_str() {
        assert_eq!("concat".parse::<UpdateMethod>().unwrap(), UpdateMethod::Concat);
        assert!(matches!("shift".parse::<UpdateMethod>(), Err(DelayError::UnknownMethod(_))));
    }
}
