//! Values seen by step functions at run time.

use crate::backend::CompiledFn;
use crate::graph::NodeId;
use crate::random::RandomSource;
use crate::{JitError, Result};
use dyna_core::{ArrayCell, Value};
use ndarray::{ArrayD, IxDyn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Names bound around a function: closure, inlined constants, nested functions
pub type Scope = BTreeMap<String, RuntimeValue>;

pub type NativeImpl = Rc<dyn Fn(&[RuntimeValue]) -> Result<RuntimeValue>>;

/// Host function callable from step code
#[derive(Clone)]
pub struct NativeFn {
    pub name: String,
    pub func: NativeImpl,
}

impl NativeFn {
    pub fn new(name: &str, func: impl Fn(&[RuntimeValue]) -> Result<RuntimeValue> + 'static) -> Self {
        Self {
            name: name.to_string(),
            func: Rc::new(func),
        }
    }

    pub fn call(&self, args: &[RuntimeValue]) -> Result<RuntimeValue> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Range,
    Len,
    Abs,
    Exp,
    Log,
    Sqrt,
    Tanh,
    Sum,
    Zeros,
    ZerosLike,
    Min,
    Max,
    Float,
    Int,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "range" => Builtin::Range,
            "len" => Builtin::Len,
            "abs" => Builtin::Abs,
            "exp" => Builtin::Exp,
            "log" => Builtin::Log,
            "sqrt" => Builtin::Sqrt,
            "tanh" => Builtin::Tanh,
            "sum" => Builtin::Sum,
            "zeros" => Builtin::Zeros,
            "zeros_like" => Builtin::ZerosLike,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "float" => Builtin::Float,
            "int" => Builtin::Int,
            _ => return None,
        })
    }
}

#[derive(Clone)]
pub enum RuntimeValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Shared storage: writes through any alias reach every holder
    Array(ArrayCell),
    Range(Vec<i64>),
    Function(CompiledFn),
    Native(NativeFn),
    /// Method of a graph node with the owner bound
    Method { node: NodeId, name: String },
    /// Method of a graph node expecting the owner as first argument
    UnboundMethod { node: NodeId, name: String },
    Random(RandomSource),
    Object(NodeId),
    Builtin(Builtin),
}

impl RuntimeValue {
    pub fn array(value: ArrayD<f64>) -> Self {
        RuntimeValue::Array(Rc::new(RefCell::new(value)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeValue::None => "None",
            RuntimeValue::Bool(_) => "bool",
            RuntimeValue::Int(_) => "int",
            RuntimeValue::Float(_) => "float",
            RuntimeValue::Array(_) => "array",
            RuntimeValue::Range(_) => "range",
            RuntimeValue::Function(_) => "function",
            RuntimeValue::Native(_) => "native function",
            RuntimeValue::Method { .. } => "method",
            RuntimeValue::UnboundMethod { .. } => "function",
            RuntimeValue::Random(_) => "random stream",
            RuntimeValue::Object(_) => "object",
            RuntimeValue::Builtin(_) => "builtin",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RuntimeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            RuntimeValue::Int(i) => Some(*i as f64),
            RuntimeValue::Float(x) => Some(*x),
            RuntimeValue::Array(cell) => {
                let a = cell.borrow();
                if a.len() == 1 {
                    a.iter().next().copied()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RuntimeValue::Bool(b) => Some(*b as i64),
            RuntimeValue::Int(i) => Some(*i),
            RuntimeValue::Float(x) if x.fract() == 0.0 => Some(*x as i64),
            _ => None,
        }
    }

    pub fn expect_f64(&self, what: &str) -> Result<f64> {
        self.as_f64().ok_or_else(|| {
            JitError::Runtime(format!("{what} must be a number, got {}", self.type_name()))
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            RuntimeValue::Bool(_) | RuntimeValue::Int(_) | RuntimeValue::Float(_)
        )
    }

    /// Copy of the data as an array (scalars become 0-d arrays)
    pub fn to_array(&self) -> Result<ArrayD<f64>> {
        match self {
            RuntimeValue::Array(cell) => Ok(cell.borrow().clone()),
            other => Ok(ArrayD::from_elem(IxDyn(&[]), other.expect_f64("array operand")?)),
        }
    }

    pub fn truthy(&self) -> Result<bool> {
        Ok(match self {
            RuntimeValue::None => false,
            RuntimeValue::Bool(b) => *b,
            RuntimeValue::Int(i) => *i != 0,
            RuntimeValue::Float(x) => *x != 0.0,
            RuntimeValue::Range(r) => !r.is_empty(),
            RuntimeValue::Array(_) => {
                let x = self.as_f64().ok_or_else(|| {
                    JitError::Runtime(
                        "the truth value of an array with more than one element is ambiguous"
                            .to_string(),
                    )
                })?;
                x != 0.0
            }
            _ => true,
        })
    }

    pub fn same_array(&self, cell: &ArrayCell) -> bool {
        matches!(self, RuntimeValue::Array(own) if Rc::ptr_eq(own, cell))
    }
}

impl From<&Value> for RuntimeValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(i) => RuntimeValue::Int(*i),
            Value::Float(x) => RuntimeValue::Float(*x),
            Value::Bool(b) => RuntimeValue::Bool(*b),
            Value::Array(a) => RuntimeValue::array(a.clone()),
        }
    }
}

impl From<f64> for RuntimeValue {
    fn from(x: f64) -> Self {
        RuntimeValue::Float(x)
    }
}

impl From<i64> for RuntimeValue {
    fn from(i: i64) -> Self {
        RuntimeValue::Int(i)
    }
}

impl From<ArrayD<f64>> for RuntimeValue {
    fn from(a: ArrayD<f64>) -> Self {
        RuntimeValue::array(a)
    }
}

impl fmt::Debug for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::None => write!(f, "None"),
            RuntimeValue::Bool(b) => write!(f, "{b}"),
            RuntimeValue::Int(i) => write!(f, "{i}"),
            RuntimeValue::Float(x) => write!(f, "{x:?}"),
            RuntimeValue::Array(cell) => write!(f, "{}", cell.borrow()),
            RuntimeValue::Range(r) => write!(f, "range({})", r.len()),
            RuntimeValue::Function(func) => write!(f, "<function {}>", func.name()),
            RuntimeValue::Native(native) => write!(f, "<native {}>", native.name),
            RuntimeValue::Method { node, name } => write!(f, "<method {name} of {node}>"),
            RuntimeValue::UnboundMethod { node, name } => {
                write!(f, "<function {name} of {node}>")
            }
            RuntimeValue::Random(source) => write!(f, "{source:?}"),
            RuntimeValue::Object(node) => write!(f, "<object {node}>"),
            RuntimeValue::Builtin(b) => write!(f, "<builtin {b:?}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_array_aliases_share_storage() {
        let a = RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn());
        let b = a.clone();
        if let RuntimeValue::Array(cell) = &b {
            cell.borrow_mut()[[0]] = 5.0;
            assert!(a.same_array(cell));
        }
        assert_eq!(a.to_array().unwrap()[[0]], 5.0);
    }

    #[test]
    fn test_truthiness() {
        assert!(!RuntimeValue::None.truthy().unwrap());
        assert!(RuntimeValue::Float(0.5).truthy().unwrap());
        assert!(RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn()).truthy().is_err());
    }
}
