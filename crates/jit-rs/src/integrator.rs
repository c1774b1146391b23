//! Integrator step functions and their code-generation metadata.
//!
//! An integrator is a generated step function (`V + dt * f(V, t)`) whose
//! source, scope and raw derivative functions are kept alongside it. The
//! driver rewrites that stored source instead of re-deriving it, and writes
//! the updated metadata back onto the function it produces.

use crate::backend::CompiledFn;
use crate::graph::NodeId;
use crate::runtime::{NativeFn, Scope};
use crate::syntax::{parse_function, FunctionDef};
use crate::Result;
use dyna_core::get_dt;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Function referenced by an integrator's source
#[derive(Debug, Clone)]
pub enum RawFunc {
    /// Method of a node; `None` means the node owning the integrator
    Method { node: Option<NodeId>, method: String },
    Native(NativeFn),
    /// Already compiled by an earlier pass
    Compiled(CompiledFn),
}

/// Where a hoisted argument reads its value from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSource {
    pub node: NodeId,
    pub attr: String,
    /// `"<node>.<attr>.value"`
    pub expr: String,
}

#[derive(Clone)]
pub struct CodeMeta {
    pub func_name: String,
    /// Integration method (`euler`, `rk2`, `exponential_euler`, ...)
    pub method: String,
    pub code: String,
    pub def: FunctionDef,
    pub scope: Scope,
    pub raw_funcs: BTreeMap<String, RawFunc>,
    /// Hoisted arguments accumulated by previous passes
    pub hoisted: BTreeMap<String, StateSource>,
    /// The owner is the first parameter and is passed explicitly to raw funcs
    pub bound: bool,
}

impl CodeMeta {
    pub fn new(
        method: &str,
        code: &str,
        raw_funcs: BTreeMap<String, RawFunc>,
        scope: Scope,
        bound: bool,
    ) -> Result<Self> {
        let def = parse_function(code)?;
        Ok(Self {
            func_name: def.name.clone(),
            method: method.to_string(),
            code: code.to_string(),
            def,
            scope,
            raw_funcs,
            hoisted: BTreeMap::new(),
            bound,
        })
    }

    /// Analyzed as an ordinary bound method rather than through its raw funcs
    pub fn is_exponential(&self) -> bool {
        self.method.starts_with("exponential")
    }

    /// True once every raw function has been compiled
    pub fn is_compiled(&self) -> bool {
        self.raw_funcs.values().all(|f| matches!(f, RawFunc::Compiled(_)))
    }
}

impl fmt::Debug for CodeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMeta")
            .field("func_name", &self.func_name)
            .field("method", &self.method)
            .field("raw_funcs", &self.raw_funcs.keys().collect::<Vec<_>>())
            .field("hoisted", &self.hoisted.keys().collect::<Vec<_>>())
            .field("bound", &self.bound)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Integrator {
    pub meta: Rc<CodeMeta>,
}

impl Integrator {
    pub fn from_meta(meta: CodeMeta) -> Self {
        Self {
            meta: Rc::new(meta),
        }
    }

    /// Integrator over arbitrary source
    pub fn from_source(
        method: &str,
        code: &str,
        raw_funcs: BTreeMap<String, RawFunc>,
        scope: Scope,
        bound: bool,
    ) -> Result<Self> {
        Ok(Self::from_meta(CodeMeta::new(
            method, code, raw_funcs, scope, bound,
        )?))
    }

    /// Forward Euler for `d var / dt = derivative(var, t)`, a method of the owner
    pub fn euler(var: &str, derivative: &str) -> Result<Self> {
        let code = format!(
            "def int_{var}(self, {var}, t, dt={dt:?}) {{\n    \
             d{var} = f(self, {var}, t)\n    \
             return {var} + dt * d{var}\n}}",
            dt = get_dt()
        );
        Self::from_source("euler", &code, Self::derivative(derivative), Scope::new(), true)
    }

    /// Heun's second-order method
    pub fn rk2(var: &str, derivative: &str) -> Result<Self> {
        let code = format!(
            "def int_{var}(self, {var}, t, dt={dt:?}) {{\n    \
             k1 = f(self, {var}, t)\n    \
             k2 = f(self, {var} + dt * k1, t + dt)\n    \
             return {var} + dt / 2.0 * (k1 + k2)\n}}",
            dt = get_dt()
        );
        Self::from_source("rk2", &code, Self::derivative(derivative), Scope::new(), true)
    }

    fn derivative(method: &str) -> BTreeMap<String, RawFunc> {
        BTreeMap::from([(
            "f".to_string(),
            RawFunc::Method {
                node: None,
                method: method.to_string(),
            },
        )])
    }
}
