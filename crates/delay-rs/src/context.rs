//! Shared simulation context: per-step arguments and the delay registry.

use crate::buffer::{DelayBuffer, DelayStep, DelayTime};
use crate::{DelayError, Result};
use dyna_core::{get_dt, Time, Value};
use ndarray::ArrayD;
use tracing::debug;

// ============================================================================
// SHARED ARGUMENTS
// ============================================================================

/// Ordered name -> value map of per-step shared data (`t`, `i`, `dt`, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedArgs {
    values: Vec<(String, Value)>,
}

impl SharedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replace in place, or append a new key
    pub fn insert(&mut self, key: &str, value: Value) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.values.iter().position(|(k, _)| k == key)?;
        Some(self.values.remove(index).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Saved `dt`, else the process-wide default
    pub fn dt(&self) -> Time {
        self.get("dt").and_then(Value::as_f64).unwrap_or_else(get_dt)
    }

    pub fn set_dt(&mut self, dt: Time) -> Result<()> {
        self.insert("dt", Value::Float(checked_dt(dt)?));
        Ok(())
    }

    /// Shared step counter `i`
    pub fn step_index(&self) -> Result<i64> {
        let value = self
            .get("i")
            .ok_or_else(|| DelayError::MissingShared("i".to_string()))?;
        value.as_i64().ok_or_else(|| DelayError::SharedType {
            key: "i".to_string(),
            expected: "int",
            got: value.type_name(),
        })
    }

    /// Step counter, 0 before the run has started
    pub fn step_index_or_start(&self) -> i64 {
        self.step_index().unwrap_or(0)
    }

    /// Shared time `t`
    pub fn time(&self) -> Option<Time> {
        self.get("t").and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// A usable time step: positive and finite
pub(crate) fn checked_dt(dt: Time) -> Result<Time> {
    if dt.is_finite() && dt > 0.0 {
        Ok(dt)
    } else {
        Err(DelayError::InvalidTimeStep(dt))
    }
}

// ============================================================================
// SHARED CONTEXT
// ============================================================================

/// Anything that can be saved into a [`SharedContext`]
#[derive(Debug)]
pub enum Shared {
    Argument(Value),
    Delay(DelayBuffer),
}

impl From<Value> for Shared {
    fn from(v: Value) -> Self {
        Shared::Argument(v)
    }
}

impl From<f64> for Shared {
    fn from(v: f64) -> Self {
        Shared::Argument(Value::Float(v))
    }
}

impl From<i64> for Shared {
    fn from(v: i64) -> Self {
        Shared::Argument(Value::Int(v))
    }
}

impl From<bool> for Shared {
    fn from(v: bool) -> Self {
        Shared::Argument(Value::Bool(v))
    }
}

impl From<ArrayD<f64>> for Shared {
    fn from(v: ArrayD<f64>) -> Self {
        Shared::Argument(Value::Array(v))
    }
}

impl From<DelayBuffer> for Shared {
    fn from(delay: DelayBuffer) -> Self {
        Shared::Delay(delay)
    }
}

/// Result of [`SharedContext::load`]
#[derive(Debug)]
pub enum Loaded<'a> {
    Value(Value),
    Delay(&'a DelayBuffer),
}

impl Loaded<'_> {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Loaded::Value(v) => Some(v),
            Loaded::Delay(_) => None,
        }
    }

    pub fn as_delay(&self) -> Option<&DelayBuffer> {
        match self {
            Loaded::Value(_) => None,
            Loaded::Delay(delay) => Some(delay),
        }
    }
}

/// One logical context per simulation run.
///
/// Holds the shared arguments and every registered delay, in insertion order.
#[derive(Debug, Default)]
pub struct SharedContext {
    pub args: SharedArgs,
    delays: Vec<(String, DelayBuffer)>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dt` first, then arguments, then delays
    pub fn load(&self, key: &str) -> Result<Loaded<'_>> {
        if key == "dt" {
            return Ok(Loaded::Value(Value::Float(self.args.dt())));
        }
        if let Some(value) = self.args.get(key) {
            return Ok(Loaded::Value(value.clone()));
        }
        if let Some(delay) = self.delay(key) {
            return Ok(Loaded::Delay(delay));
        }
        Err(DelayError::MissingShared(key.to_string()))
    }

    pub fn load_or(&self, key: &str, default: Value) -> Loaded<'_> {
        self.load(key).unwrap_or(Loaded::Value(default))
    }

    /// Delays go to the registry, everything else to the arguments
    pub fn save(&mut self, name: &str, value: impl Into<Shared>) -> Result<()> {
        match value.into() {
            Shared::Argument(value) if name == "dt" => {
                let dt = value.as_f64().ok_or_else(|| DelayError::SharedType {
                    key: "dt".to_string(),
                    expected: "float",
                    got: value.type_name(),
                })?;
                self.args.set_dt(dt)?;
            }
            Shared::Argument(value) => self.args.insert(name, value),
            Shared::Delay(delay) => {
                if self.delay(name).is_some() {
                    return Err(DelayError::DuplicateDelay(name.to_string()));
                }
                debug!(name, %delay, "delay registered");
                self.delays.push((name.to_string(), delay));
            }
        }
        Ok(())
    }

    pub fn save_all<I, S>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Shared)>,
        S: AsRef<str>,
    {
        for (name, value) in items {
            self.save(name.as_ref(), value)?;
        }
        Ok(())
    }

    /// Move to the next step: `i += 1`, `t += dt`
    pub fn advance(&mut self) {
        let dt = self.args.dt();
        let i = self.args.step_index_or_start() + 1;
        let t = self.args.time().unwrap_or(0.0) + dt;
        self.args.insert("i", Value::Int(i));
        self.args.insert("t", Value::Float(t));
    }

    /// Push the target's current value into every delay; nothing changes
    /// if any delay cannot be updated
    pub fn update(&mut self) -> Result<()> {
        let rows = self
            .delays
            .iter()
            .map(|(_, delay)| delay.prepare_update(&self.args, None))
            .collect::<Result<Vec<_>>>()?;
        for ((_, delay), row) in self.delays.iter_mut().zip(rows) {
            if let Some((row, latest)) = row {
                delay.write_row(row, &latest);
            }
        }
        Ok(())
    }

    /// Reset every delay; nothing changes if any batch size mismatches
    pub fn reset(&mut self, batch_size: Option<usize>) -> Result<()> {
        for (_, delay) in &self.delays {
            delay.check_batch(&delay.target()?, batch_size)?;
        }
        for (_, delay) in self.delays.iter_mut() {
            delay.reset_state(&self.args, batch_size)?;
        }
        Ok(())
    }

    pub fn delay(&self, name: &str) -> Option<&DelayBuffer> {
        self.delays.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn delay_mut(&mut self, name: &str) -> Option<&mut DelayBuffer> {
        self.delays.iter_mut().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn delay_names(&self) -> impl Iterator<Item = &str> {
        self.delays.iter().map(|(n, _)| n.as_str())
    }

    /// Register an entry on a saved delay
    pub fn register_entry(
        &mut self,
        delay: &str,
        entry: &str,
        delay_time: Option<DelayTime>,
        delay_step: Option<DelayStep>,
    ) -> Result<()> {
        let buffer = self
            .delays
            .iter_mut()
            .find(|(n, _)| n == delay)
            .map(|(_, d)| d)
            .ok_or_else(|| DelayError::UnknownDelay(delay.to_string()))?;
        buffer.register_entry(&self.args, entry, delay_time, delay_step)?;
        Ok(())
    }

    /// Read `entry` of the delay saved as `delay`
    pub fn at(&self, delay: &str, entry: &str, rows: Option<&[usize]>) -> Result<ArrayD<f64>> {
        self.delay(delay)
            .ok_or_else(|| DelayError::UnknownDelay(delay.to_string()))?
            .at(&self.args, entry, rows)
    }

    /// Copy of the shared arguments
    pub fn shargs(&self) -> SharedArgs {
        self.args.clone()
    }

    /// Remove the named delays, or all of them when `names` is empty
    pub fn clear_delays(&mut self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            debug!(count = self.delays.len(), "all delays cleared");
            self.delays.clear();
            return Ok(());
        }
        if let Some(missing) = names.iter().find(|n| self.delay(n).is_none()) {
            return Err(DelayError::UnknownDelay(missing.to_string()));
        }
        self.delays.retain(|(n, _)| !names.contains(&n.as_str()));
        Ok(())
    }

    /// Remove the named arguments, or all of them when `names` is empty
    pub fn clear_shargs(&mut self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            self.args.clear();
            return Ok(());
        }
        if let Some(missing) = names.iter().find(|n| !self.args.contains(n)) {
            return Err(DelayError::MissingShared(missing.to_string()));
        }
        for name in names {
            self.args.remove(name);
        }
        Ok(())
    }

    /// Empty both maps between independent runs
    pub fn clear(&mut self) {
        self.args.clear();
        self.delays.clear();
        debug!("shared context cleared");
    }
}
