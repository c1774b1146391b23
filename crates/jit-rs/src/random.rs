//! Random-number streams.
//!
//! Each object may own a seedable [`RandomState`]; compiled code reads from
//! the process-global stream instead (reseeded with [`seed`]).

use crate::{JitError, Result};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::fmt;
use std::rc::Rc;

thread_local! {
    static GLOBAL: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0));
}

/// Reseed the global stream
pub fn seed(seed: u64) {
    GLOBAL.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Per-object random stream
#[derive(Clone)]
pub struct RandomState {
    seed: u64,
    rng: Rc<RefCell<StdRng>>,
}

impl RandomState {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restart the stream from its seed
    pub fn reseed(&self) {
        *self.rng.borrow_mut() = StdRng::seed_from_u64(self.seed);
    }
}

impl fmt::Debug for RandomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RandomState(seed={})", self.seed)
    }
}

/// Which stream a random call draws from
#[derive(Debug, Clone)]
pub enum RandomSource {
    Global,
    Local(RandomState),
}

impl RandomSource {
    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        match self {
            RandomSource::Global => GLOBAL.with(|rng| f(&mut rng.borrow_mut())),
            RandomSource::Local(state) => f(&mut state.rng.borrow_mut()),
        }
    }

    pub fn uniform(&self, low: f64, high: f64) -> f64 {
        self.with_rng(|rng| low + (high - low) * rng.gen::<f64>())
    }

    /// Box-Muller
    pub fn normal(&self, loc: f64, scale: f64) -> f64 {
        self.with_rng(|rng| {
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            loc + scale * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
        })
    }

    pub fn uniform_array(&self, shape: &[usize], low: f64, high: f64) -> ArrayD<f64> {
        ArrayD::from_shape_simple_fn(IxDyn(shape), || self.uniform(low, high))
    }

    pub fn normal_array(&self, shape: &[usize], loc: f64, scale: f64) -> ArrayD<f64> {
        ArrayD::from_shape_simple_fn(IxDyn(shape), || self.normal(loc, scale))
    }

    /// Names understood by [`sample`](Self::sample)
    pub fn has_method(name: &str) -> bool {
        matches!(name, "random" | "rand" | "randn" | "uniform" | "normal")
    }

    /// `method(*args)`: trailing shape arguments give an array, none a scalar
    pub fn sample(&self, method: &str, args: &[f64], size: Option<&[usize]>) -> Result<Sample> {
        let arg = |k: usize, default: f64| args.get(k).copied().unwrap_or(default);
        let sample = match (method, size) {
            ("random" | "rand", None) => Sample::Scalar(self.uniform(0.0, 1.0)),
            ("random" | "rand", Some(shape)) => Sample::Array(self.uniform_array(shape, 0.0, 1.0)),
            ("randn", None) => Sample::Scalar(self.normal(0.0, 1.0)),
            ("randn", Some(shape)) => Sample::Array(self.normal_array(shape, 0.0, 1.0)),
            ("uniform", None) => Sample::Scalar(self.uniform(arg(0, 0.0), arg(1, 1.0))),
            ("uniform", Some(shape)) => {
                Sample::Array(self.uniform_array(shape, arg(0, 0.0), arg(1, 1.0)))
            }
            ("normal", None) => Sample::Scalar(self.normal(arg(0, 0.0), arg(1, 1.0))),
            ("normal", Some(shape)) => {
                Sample::Array(self.normal_array(shape, arg(0, 0.0), arg(1, 1.0)))
            }
            (other, _) => {
                return Err(JitError::Runtime(format!(
                    "random stream has no method \"{other}\""
                )))
            }
        };
        Ok(sample)
    }
}

pub enum Sample {
    Scalar(f64),
    Array(ArrayD<f64>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_stream_is_reproducible() {
        let state = RandomState::new(7);
        let source = RandomSource::Local(state.clone());
        let first: Vec<f64> = (0..4).map(|_| source.uniform(0.0, 1.0)).collect();
        state.reseed();
        let second: Vec<f64> = (0..4).map(|_| source.uniform(0.0, 1.0)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn test_normal_moments() {
        let source = RandomSource::Local(RandomState::new(1));
        let samples = source.normal_array(&[20000], 2.0, 0.5);
        let mean = samples.mean().unwrap_or(0.0);
        assert!((mean - 2.0).abs() < 0.05);
    }

    #[test]
    fn test_unknown_method() {
        let source = RandomSource::Global;
        assert!(source.sample("poisson", &[], None).is_err());
    }
}
