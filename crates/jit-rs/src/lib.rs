//! # Dyna JIT
//!
//! Turns step methods of stateful objects into pure functions.
//!
//! A step method reads and writes state through attribute chains on its
//! owner (`self.sub.w.value`). The analyzer walks those chains through the
//! declared members of an [`ObjectGraph`], hoists every state read into an
//! explicit trailing parameter (`sub_w=None`), compiles nested methods first
//! and rewrites their call sites to pass the hoisted state along. The
//! resulting function is handed to a [`Backend`](backend::Backend) together
//! with the scope it closes over.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dyna_jit::{Interpreter, Jit, JitSettings, ObjectGraph};
//!
//! let mut graph = ObjectGraph::new();
//! let net = graph.add_node("net")?;
//! graph.add_state(net, "V", Variable::from_vec("V", vec![0.0; 4]))?;
//! graph.add_method(net, "update", "def update(self, dt) { self.V.value += dt }")?;
//!
//! let mut jit = Jit::new(Interpreter, JitSettings::default())?;
//! let result = jit.analyze(&graph, net, "update")?;
//! assert!(result.hoisted_arguments.contains("net_V"));
//! ```

mod analyze;
pub mod backend;
mod driver;
pub mod graph;
pub mod integrator;
mod interp;
pub mod model;
pub mod random;
mod rewrite;
pub mod runner;
pub mod runtime;
pub mod syntax;

pub use analyze::CLASS_KEYWORDS;
pub use backend::{Backend, CompileOptions, CompiledFn, BACKEND_ABI, MIN_BACKEND_ABI};
pub use driver::{AnalysisResult, Jit};
pub use graph::{Member, Method, Node, NodeId, ObjectGraph};
pub use integrator::{CodeMeta, Integrator, RawFunc, StateSource};
pub use interp::{Evaluator, Interpreter};
pub use model::{Model, ModelSpec};
pub use rewrite::{append_call_args, substitute};
pub use runner::{CompiledStep, Runner};
pub use runtime::{NativeFn, RuntimeValue, Scope};
pub use syntax::{parse_function, FunctionDef};

use dyna_core::DynaError;
use dyna_delay::DelayError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JitError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Do not support variadic arguments at rewritten call site: {call}")]
    UnsupportedCallSite { call: String },

    #[error("Unknown owner parameter {param:?} of {function}, expected one of \"self\", \"cls\"")]
    UnrecognizedOwner {
        function: String,
        param: Option<String>,
    },

    #[error("{owner} has no attribute {chain}")]
    UnknownAttribute { owner: String, chain: String },

    #[error("{chain} resolves to an object, only its members can be used in compiled code")]
    ChainResolvesToObject { chain: String },

    #[error("Hoisted argument {name} collides with a name of {function}")]
    NameCollision { function: String, name: String },

    #[error("Recursive call through {chain} cannot be compiled")]
    RecursiveCall { chain: String },

    #[error("Call {call} already passes keyword {keyword}")]
    DuplicateKeyword { call: String, keyword: String },

    #[error("Node name {0} has been used")]
    DuplicateNode(String),

    #[error("Unknown node {0}")]
    UnknownNode(String),

    #[error("{owner}.{member} is not callable")]
    NotCallable { owner: String, member: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Backend ABI version {found} is not supported, need at least {required}")]
    IncompatibleBackend { found: u32, required: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Delay(#[from] DelayError),

    #[error(transparent)]
    Core(#[from] DynaError),
}

pub type Result<T> = std::result::Result<T, JitError>;

/// Compilation flags, forwarded unchanged to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitSettings {
    pub nopython: bool,
    pub fastmath: bool,
    pub parallel: bool,
    pub nogil: bool,
    /// Log generated source at info level
    pub show_code: bool,
}

impl Default for JitSettings {
    fn default() -> Self {
        Self {
            nopython: true,
            fastmath: true,
            parallel: false,
            nogil: false,
            show_code: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default_from_json() {
        let settings: JitSettings = serde_json::from_str(r#"{"show_code": true}"#).unwrap();
        assert!(settings.nopython);
        assert!(settings.show_code);
        assert_eq!(CompileOptions::from(&settings), CompileOptions::default());
    }
}
