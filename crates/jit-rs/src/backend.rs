//! Boundary to the function compiler.
//!
//! The driver hands a backend a pure function (no owner parameter, every
//! state read an explicit argument) plus the scope it closes over. The
//! backend returns a callable with the same semantics.

use crate::integrator::CodeMeta;
use crate::runtime::{NativeFn, RuntimeValue, Scope};
use crate::syntax::FunctionDef;
use crate::{JitSettings, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

/// ABI version of the bundled backend
pub const BACKEND_ABI: u32 = 2;
/// Oldest backend ABI the driver accepts
pub const MIN_BACKEND_ABI: u32 = 2;

/// Flags forwarded unchanged to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub nopython: bool,
    pub fastmath: bool,
    pub parallel: bool,
    pub nogil: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            nopython: true,
            fastmath: true,
            parallel: false,
            nogil: false,
        }
    }
}

impl From<&JitSettings> for CompileOptions {
    fn from(settings: &JitSettings) -> Self {
        Self {
            nopython: settings.nopython,
            fastmath: settings.fastmath,
            parallel: settings.parallel,
            nogil: settings.nogil,
        }
    }
}

/// Everything needed to compile one function
pub struct CompileUnit {
    pub def: FunctionDef,
    pub scope: Scope,
    pub options: CompileOptions,
    /// Parameters holding state: plain assignment writes into them in place
    pub by_reference: BTreeSet<String>,
    pub meta: Option<Rc<CodeMeta>>,
}

pub struct Invocation {
    pub args: Vec<RuntimeValue>,
    pub kwargs: Vec<(String, RuntimeValue)>,
}

/// Result of a call
pub struct Outcome {
    pub value: RuntimeValue,
    /// Final binding of every parameter
    pub params: BTreeMap<String, RuntimeValue>,
}

pub type CompiledImpl = Rc<dyn Fn(Invocation) -> Result<Outcome>>;

/// Callable produced by a backend
#[derive(Clone)]
pub struct CompiledFn {
    name: String,
    params: Vec<String>,
    options: CompileOptions,
    meta: Option<Rc<CodeMeta>>,
    imp: CompiledImpl,
}

impl CompiledFn {
    pub fn new(
        name: &str,
        params: Vec<String>,
        options: CompileOptions,
        meta: Option<Rc<CodeMeta>>,
        imp: CompiledImpl,
    ) -> Self {
        Self {
            name: name.to_string(),
            params,
            options,
            meta,
            imp,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    /// Integrator metadata written back by the driver
    pub fn meta(&self) -> Option<&Rc<CodeMeta>> {
        self.meta.as_ref()
    }

    pub fn invoke(&self, args: Vec<RuntimeValue>, kwargs: Vec<(String, RuntimeValue)>) -> Result<Outcome> {
        (self.imp)(Invocation { args, kwargs })
    }

    pub fn call(&self, args: Vec<RuntimeValue>, kwargs: Vec<(String, RuntimeValue)>) -> Result<RuntimeValue> {
        Ok(self.invoke(args, kwargs)?.value)
    }

    pub fn ptr_eq(&self, other: &CompiledFn) -> bool {
        Rc::ptr_eq(&self.imp, &other.imp)
    }
}

impl fmt::Debug for CompiledFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledFn({}({}))", self.name, self.params.join(", "))
    }
}

pub trait Backend {
    fn name(&self) -> &str;

    fn abi_version(&self) -> u32;

    fn compile(&self, unit: CompileUnit) -> Result<CompiledFn>;

    fn compile_native(&self, native: &NativeFn, options: &CompileOptions) -> Result<CompiledFn>;
}
