//! Tree-walking backend.
//!
//! [`Interpreter`] implements [`Backend`]: compiled functions are evaluated
//! directly from their tree, with arrays passed by reference so that in-place
//! writes reach the state they alias. [`Interpreter::with_graph`] also runs
//! un-rewritten methods against an [`ObjectGraph`], resolving `self.x`
//! chains at run time.

use crate::backend::{
    Backend, CompileOptions, CompileUnit, CompiledFn, CompiledImpl, Invocation, Outcome,
    BACKEND_ABI,
};
use crate::graph::{Member, NodeId, ObjectGraph};
use crate::integrator::RawFunc;
use crate::random::{RandomSource, Sample};
use crate::runtime::{Builtin, NativeFn, RuntimeValue, Scope};
use crate::syntax::{Arg, AssignOp, BinOp, Expr, FunctionDef, Stmt, UnaryOp};
use crate::{JitError, Result};
use dyna_core::ArrayCell;
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Zip};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }

    /// Evaluator for the uncompiled path
    pub fn with_graph(graph: &ObjectGraph) -> Evaluator<'_> {
        Evaluator {
            graph: Some(graph),
            depth: Cell::new(0),
        }
    }
}

impl Backend for Interpreter {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn abi_version(&self) -> u32 {
        BACKEND_ABI
    }

    fn compile(&self, unit: CompileUnit) -> Result<CompiledFn> {
        let CompileUnit {
            def,
            scope,
            options,
            by_reference,
            meta,
        } = unit;
        let name = def.name.clone();
        let params = def.param_names();
        let def = Rc::new(def);
        let scope = Rc::new(scope);
        let by_reference = Rc::new(by_reference);
        let imp: CompiledImpl = Rc::new(move |inv: Invocation| {
            Evaluator::pure().run(&def, &scope, &by_reference, None, inv)
        });
        Ok(CompiledFn::new(&name, params, options, meta, imp))
    }

    fn compile_native(&self, native: &NativeFn, options: &CompileOptions) -> Result<CompiledFn> {
        let native = native.clone();
        let name = native.name.clone();
        let imp: CompiledImpl = Rc::new(move |inv: Invocation| {
            if let Some((key, _)) = inv.kwargs.first() {
                return Err(JitError::Runtime(format!(
                    "{}() got an unexpected keyword argument \"{key}\"",
                    native.name
                )));
            }
            Ok(Outcome {
                value: native.call(&inv.args)?,
                params: BTreeMap::new(),
            })
        });
        Ok(CompiledFn::new(&name, Vec::new(), *options, None, imp))
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

enum Flow {
    Normal,
    Return(RuntimeValue),
}

struct Frame<'s> {
    locals: BTreeMap<String, RuntimeValue>,
    scope: &'s Scope,
    by_reference: &'s BTreeSet<String>,
}

impl Frame<'_> {
    fn lookup(&self, name: &str) -> Result<RuntimeValue> {
        if let Some(value) = self.locals.get(name).or_else(|| self.scope.get(name)) {
            return Ok(value.clone());
        }
        Builtin::lookup(name)
            .map(RuntimeValue::Builtin)
            .ok_or_else(|| JitError::Runtime(format!("name \"{name}\" is not defined")))
    }
}

pub struct Evaluator<'g> {
    graph: Option<&'g ObjectGraph>,
    depth: Cell<usize>,
}

impl<'g> Evaluator<'g> {
    /// Evaluator without graph access, for compiled functions
    fn pure() -> Self {
        Evaluator {
            graph: None,
            depth: Cell::new(0),
        }
    }

    fn graph(&self) -> Result<&'g ObjectGraph> {
        self.graph.ok_or_else(|| {
            JitError::Runtime("object access is not available in compiled code".to_string())
        })
    }

    /// Call a member of `node` with the owner bound
    pub fn call_method(
        &self,
        node: NodeId,
        name: &str,
        args: Vec<RuntimeValue>,
        kwargs: Vec<(String, RuntimeValue)>,
    ) -> Result<RuntimeValue> {
        Ok(self
            .call_member(node, name, true, Invocation { args, kwargs })?
            .value)
    }

    fn call_member(
        &self,
        node: NodeId,
        name: &str,
        bind_owner: bool,
        inv: Invocation,
    ) -> Result<Outcome> {
        let graph = self.graph()?;
        let no_refs = BTreeSet::new();
        let owner = bind_owner.then_some(RuntimeValue::Object(node));
        match graph.member(node, name)? {
            Member::Method(method) => self.run(&method.def, &method.closure, &no_refs, owner, inv),
            Member::Integrator(integ) => {
                let meta = &integ.meta;
                let mut scope = meta.scope.clone();
                for (key, raw) in &meta.raw_funcs {
                    let value = match raw {
                        RawFunc::Method { node: n, method } => {
                            let target = n.unwrap_or(node);
                            if meta.bound {
                                RuntimeValue::UnboundMethod {
                                    node: target,
                                    name: method.clone(),
                                }
                            } else {
                                RuntimeValue::Method {
                                    node: target,
                                    name: method.clone(),
                                }
                            }
                        }
                        RawFunc::Native(native) => RuntimeValue::Native(native.clone()),
                        RawFunc::Compiled(f) => RuntimeValue::Function(f.clone()),
                    };
                    scope.insert(key.clone(), value);
                }
                let owner = if meta.bound { owner } else { None };
                self.run(&meta.def, &scope, &no_refs, owner, inv)
            }
            Member::Native(native) => Ok(Outcome {
                value: native.call(&inv.args)?,
                params: BTreeMap::new(),
            }),
            other => Err(JitError::NotCallable {
                owner: graph.name(node)?.to_string(),
                member: format!("{name} ({})", other.kind()),
            }),
        }
    }

    fn run(
        &self,
        def: &FunctionDef,
        scope: &Scope,
        by_reference: &BTreeSet<String>,
        owner: Option<RuntimeValue>,
        inv: Invocation,
    ) -> Result<Outcome> {
        let depth = self.depth.get();
        if depth >= MAX_DEPTH {
            return Err(JitError::Runtime(format!(
                "maximum call depth exceeded in {}",
                def.name
            )));
        }
        self.depth.set(depth + 1);
        let result = self.run_frame(def, scope, by_reference, owner, inv);
        self.depth.set(depth);
        result
    }

    fn run_frame(
        &self,
        def: &FunctionDef,
        scope: &Scope,
        by_reference: &BTreeSet<String>,
        owner: Option<RuntimeValue>,
        inv: Invocation,
    ) -> Result<Outcome> {
        let mut frame = Frame {
            locals: BTreeMap::new(),
            scope,
            by_reference,
        };
        self.bind_params(def, &mut frame, owner, inv)?;
        let value = match self.exec_block(&def.body, &mut frame)? {
            Flow::Return(value) => value,
            Flow::Normal => RuntimeValue::None,
        };
        let params = def
            .params
            .iter()
            .filter_map(|p| frame.locals.get(&p.name).map(|v| (p.name.clone(), v.clone())))
            .collect();
        Ok(Outcome { value, params })
    }

    fn bind_params(
        &self,
        def: &FunctionDef,
        frame: &mut Frame<'_>,
        owner: Option<RuntimeValue>,
        inv: Invocation,
    ) -> Result<()> {
        let mut positional = owner.into_iter().chain(inv.args);
        for param in &def.params {
            match positional.next() {
                Some(value) => {
                    frame.locals.insert(param.name.clone(), value);
                }
                None => break,
            }
        }
        let extra = positional.count();
        if extra > 0 {
            return Err(JitError::Runtime(format!(
                "{}() takes {} positional arguments but {} more were given",
                def.name,
                def.params.len(),
                extra
            )));
        }
        for (key, value) in inv.kwargs {
            if !def.params.iter().any(|p| p.name == key) {
                return Err(JitError::Runtime(format!(
                    "{}() got an unexpected keyword argument \"{key}\"",
                    def.name
                )));
            }
            if frame.locals.contains_key(&key) {
                return Err(JitError::Runtime(format!(
                    "{}() got multiple values for argument \"{key}\"",
                    def.name
                )));
            }
            frame.locals.insert(key, value);
        }
        for param in &def.params {
            if frame.locals.contains_key(&param.name) {
                continue;
            }
            let default = param.default.as_ref().ok_or_else(|| {
                JitError::Runtime(format!(
                    "{}() missing required argument \"{}\"",
                    def.name, param.name
                ))
            })?;
            let value = self.eval(default, frame)?;
            frame.locals.insert(param.name.clone(), value);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------------

    fn exec_block(&self, body: &[Stmt], frame: &mut Frame<'_>) -> Result<Flow> {
        for stmt in body {
            if let Flow::Return(value) = self.exec(stmt, frame)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, stmt: &Stmt, frame: &mut Frame<'_>) -> Result<Flow> {
        match stmt {
            Stmt::Expr(e) => {
                self.eval(e, frame)?;
                Ok(Flow::Normal)
            }
            Stmt::Return(e) => Ok(Flow::Return(match e {
                Some(e) => self.eval(e, frame)?,
                None => RuntimeValue::None,
            })),
            Stmt::If { test, body, orelse } => {
                if self.eval(test, frame)?.truthy()? {
                    self.exec_block(body, frame)
                } else {
                    self.exec_block(orelse, frame)
                }
            }
            Stmt::For { var, iter, body } => {
                let items = iterate(&self.eval(iter, frame)?)?;
                for item in items {
                    frame.locals.insert(var.clone(), item);
                    if let Flow::Return(value) = self.exec_block(body, frame)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, op, value } => {
                let value = self.eval(value, frame)?;
                self.assign(target, *op, value, frame)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn assign(
        &self,
        target: &Expr,
        op: AssignOp,
        value: RuntimeValue,
        frame: &mut Frame<'_>,
    ) -> Result<()> {
        match target {
            Expr::Name(name) => {
                let current = frame.locals.get(name).cloned();
                match (op.binary(), current) {
                    (Some(bin), Some(RuntimeValue::Array(cell))) => update_cell(&cell, bin, &value),
                    (Some(bin), _) => {
                        let current = frame.lookup(name)?;
                        let updated = binary(bin, &current, &value)?;
                        frame.locals.insert(name.clone(), updated);
                        Ok(())
                    }
                    (None, Some(RuntimeValue::Array(cell))) if frame.by_reference.contains(name) => {
                        store(&cell, &value)
                    }
                    (None, _) => {
                        frame.locals.insert(name.clone(), value);
                        Ok(())
                    }
                }
            }
            Expr::Attribute { value: base, attr } => {
                let cell = match (self.eval(base, frame)?, attr.as_str()) {
                    (RuntimeValue::Array(cell), "value") => cell,
                    (RuntimeValue::Object(node), attr) => match self.graph()?.member(node, attr)? {
                        Member::State(variable) => variable.storage(),
                        other => {
                            return Err(JitError::Runtime(format!(
                                "cannot assign to {} member \"{attr}\"",
                                other.kind()
                            )))
                        }
                    },
                    (other, attr) => {
                        return Err(JitError::Runtime(format!(
                            "cannot assign attribute \"{attr}\" of {}",
                            other.type_name()
                        )))
                    }
                };
                match op.binary() {
                    Some(bin) => update_cell(&cell, bin, &value),
                    None => store(&cell, &value),
                }
            }
            Expr::Index { value: base, indices } => {
                let RuntimeValue::Array(cell) = self.eval(base, frame)? else {
                    return Err(JitError::Runtime(format!(
                        "cannot assign into `{base}`: not an array"
                    )));
                };
                let indices = self.eval_indices(indices, frame)?;
                let value = match op.binary() {
                    Some(bin) => binary(bin, &get_index(&cell, &indices)?, &value)?,
                    None => value,
                };
                set_index(&cell, &indices, &value)
            }
            other => Err(JitError::Runtime(format!("cannot assign to `{other}`"))),
        }
    }

    // ------------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------------

    fn eval(&self, expr: &Expr, frame: &mut Frame<'_>) -> Result<RuntimeValue> {
        match expr {
            Expr::Float(x) => Ok(RuntimeValue::Float(*x)),
            Expr::Int(i) => Ok(RuntimeValue::Int(*i)),
            Expr::Bool(b) => Ok(RuntimeValue::Bool(*b)),
            Expr::None => Ok(RuntimeValue::None),
            Expr::Name(name) => frame.lookup(name),
            Expr::Attribute { value, attr } => {
                let base = self.eval(value, frame)?;
                self.attribute(base, attr)
            }
            Expr::Index { value, indices } => {
                let base = self.eval(value, frame)?;
                let indices = self.eval_indices(indices, frame)?;
                match base {
                    RuntimeValue::Array(cell) => get_index(&cell, &indices),
                    RuntimeValue::Range(items) => match indices.as_slice() {
                        [i] => Ok(RuntimeValue::Int(items[normalize(*i, items.len())?])),
                        _ => Err(JitError::Runtime("range takes a single index".to_string())),
                    },
                    other => Err(JitError::Runtime(format!(
                        "{} is not subscriptable",
                        other.type_name()
                    ))),
                }
            }
            Expr::Call { func, args } => self.eval_call(func, args, frame),
            Expr::Binary {
                op: BinOp::And,
                left,
                right,
            } => {
                let left = self.eval(left, frame)?;
                if !left.truthy()? {
                    return Ok(left);
                }
                self.eval(right, frame)
            }
            Expr::Binary {
                op: BinOp::Or,
                left,
                right,
            } => {
                let left = self.eval(left, frame)?;
                if left.truthy()? {
                    return Ok(left);
                }
                self.eval(right, frame)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, frame)?;
                let right = self.eval(right, frame)?;
                binary(*op, &left, &right)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => Ok(RuntimeValue::Bool(!self.eval(operand, frame)?.truthy()?)),
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => match self.eval(operand, frame)? {
                RuntimeValue::Int(i) => Ok(RuntimeValue::Int(-i)),
                RuntimeValue::Bool(b) => Ok(RuntimeValue::Int(-(b as i64))),
                RuntimeValue::Float(x) => Ok(RuntimeValue::Float(-x)),
                RuntimeValue::Array(cell) => Ok(RuntimeValue::array(cell.borrow().mapv(|x| -x))),
                other => Err(JitError::Runtime(format!(
                    "bad operand type for unary -: {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval_indices(&self, indices: &[Expr], frame: &mut Frame<'_>) -> Result<Vec<i64>> {
        indices
            .iter()
            .map(|e| {
                let v = self.eval(e, frame)?;
                v.as_i64().ok_or_else(|| {
                    JitError::Runtime(format!("indices must be integers, got {}", v.type_name()))
                })
            })
            .collect()
    }

    fn attribute(&self, base: RuntimeValue, attr: &str) -> Result<RuntimeValue> {
        match (base, attr) {
            (RuntimeValue::Object(node), attr) => self.member_value(node, attr),
            (value @ RuntimeValue::Array(_), "value") => Ok(value),
            (value, "value") if value.is_numeric() => Ok(value),
            (RuntimeValue::Array(cell), "size") => Ok(RuntimeValue::Int(cell.borrow().len() as i64)),
            (other, attr) => Err(JitError::Runtime(format!(
                "{} has no attribute \"{attr}\"",
                other.type_name()
            ))),
        }
    }

    fn member_value(&self, node: NodeId, attr: &str) -> Result<RuntimeValue> {
        Ok(match self.graph()?.member(node, attr)? {
            Member::State(variable) => RuntimeValue::Array(variable.storage()),
            Member::Random(state) => RuntimeValue::Random(RandomSource::Local(state.clone())),
            Member::Child(child) => RuntimeValue::Object(*child),
            Member::Method(_) | Member::Integrator(_) => RuntimeValue::Method {
                node,
                name: attr.to_string(),
            },
            Member::Native(native) => RuntimeValue::Native(native.clone()),
            Member::Constant(value) => RuntimeValue::from(value),
        })
    }

    fn eval_call(&self, func: &Expr, args: &[Arg], frame: &mut Frame<'_>) -> Result<RuntimeValue> {
        let callee = match func {
            Expr::Attribute { value, attr } => match self.eval(value, frame)? {
                RuntimeValue::Random(source) => {
                    return self.call_random(&source, attr, args, frame);
                }
                base => self.attribute(base, attr)?,
            },
            _ => self.eval(func, frame)?,
        };

        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(e) => positional.push(self.eval(e, frame)?),
                Arg::Keyword(name, e) => keywords.push((name.clone(), self.eval(e, frame)?)),
                Arg::Star(_) | Arg::DoubleStar(_) => {
                    return Err(JitError::Runtime(format!(
                        "variadic arguments are not supported: `{func}(...)`"
                    )))
                }
            }
        }
        let inv = Invocation {
            args: positional,
            kwargs: keywords,
        };

        match callee {
            RuntimeValue::Function(f) => Ok((f.invoke(inv.args, inv.kwargs))?.value),
            RuntimeValue::Native(native) => {
                if !inv.kwargs.is_empty() {
                    return Err(JitError::Runtime(format!(
                        "{}() takes no keyword arguments",
                        native.name
                    )));
                }
                native.call(&inv.args)
            }
            RuntimeValue::Method { node, name } => Ok(self.call_member(node, &name, true, inv)?.value),
            RuntimeValue::UnboundMethod { node, name } => {
                Ok(self.call_member(node, &name, false, inv)?.value)
            }
            RuntimeValue::Builtin(builtin) => {
                if !inv.kwargs.is_empty() {
                    return Err(JitError::Runtime(format!(
                        "{builtin:?} takes no keyword arguments"
                    )));
                }
                call_builtin(builtin, &inv.args)
            }
            other => Err(JitError::Runtime(format!(
                "`{func}` ({}) is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_random(
        &self,
        source: &RandomSource,
        method: &str,
        args: &[Arg],
        frame: &mut Frame<'_>,
    ) -> Result<RuntimeValue> {
        let mut params = Vec::new();
        let mut size: Option<Vec<usize>> = None;
        for arg in args {
            match arg {
                Arg::Positional(e) => params.push(self.eval(e, frame)?.expect_f64("random argument")?),
                Arg::Keyword(key, e) if key == "size" => {
                    size = Some(shape_of(&self.eval(e, frame)?)?);
                }
                other => {
                    return Err(JitError::Runtime(format!(
                        "unsupported argument `{other}` to random.{method}"
                    )))
                }
            }
        }
        // rand(d0, d1, ...) and randn(...) take the shape positionally
        if matches!(method, "rand" | "randn") && !params.is_empty() {
            size = Some(params.iter().map(|d| d.max(0.0) as usize).collect());
            params.clear();
        }
        Ok(match source.sample(method, &params, size.as_deref())? {
            Sample::Scalar(x) => RuntimeValue::Float(x),
            Sample::Array(a) => RuntimeValue::array(a),
        })
    }
}

// ============================================================================
// ARRAY HELPERS
// ============================================================================

fn normalize(index: i64, len: usize) -> Result<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved as usize >= len {
        return Err(JitError::Runtime(format!(
            "index {index} is out of bounds for axis with size {len}"
        )));
    }
    Ok(resolved as usize)
}

fn get_index(cell: &ArrayCell, indices: &[i64]) -> Result<RuntimeValue> {
    let array = cell.borrow();
    if indices.len() > array.ndim() {
        return Err(JitError::Runtime(format!(
            "too many indices for array: array is {}-dimensional, but {} were indexed",
            array.ndim(),
            indices.len()
        )));
    }
    let mut view = array.view();
    for &index in indices {
        let k = normalize(index, view.len_of(Axis(0)))?;
        view = view.index_axis_move(Axis(0), k);
    }
    if view.ndim() == 0 {
        Ok(RuntimeValue::Float(view.iter().next().copied().unwrap_or(0.0)))
    } else {
        Ok(RuntimeValue::array(view.to_owned()))
    }
}

fn set_index(cell: &ArrayCell, indices: &[i64], value: &RuntimeValue) -> Result<()> {
    // copy first: the value may alias the target
    let rhs = value.to_array()?;
    let mut array = cell.borrow_mut();
    if indices.len() > array.ndim() {
        return Err(JitError::Runtime("too many indices for array".to_string()));
    }
    let mut view = array.view_mut();
    for &index in indices {
        let k = normalize(index, view.len_of(Axis(0)))?;
        view = view.index_axis_move(Axis(0), k);
    }
    let broadcast = rhs.broadcast(view.raw_dim()).ok_or_else(|| {
        JitError::Runtime(format!(
            "could not broadcast {:?} into {:?}",
            rhs.shape(),
            view.shape()
        ))
    })?;
    view.assign(&broadcast);
    Ok(())
}

/// Whole-value write into shared storage, keeping its shape
fn store(cell: &ArrayCell, value: &RuntimeValue) -> Result<()> {
    let rhs = value.to_array()?;
    let shape = cell.borrow().raw_dim();
    let new = if rhs.raw_dim() == shape {
        rhs
    } else {
        rhs.broadcast(shape.clone())
            .map(|view| view.to_owned())
            .ok_or_else(|| {
                JitError::Runtime(format!(
                    "could not broadcast {:?} into {:?}",
                    rhs.shape(),
                    shape.slice()
                ))
            })?
    };
    *cell.borrow_mut() = new;
    Ok(())
}

fn update_cell(cell: &ArrayCell, op: BinOp, value: &RuntimeValue) -> Result<()> {
    let current = RuntimeValue::array(cell.borrow().clone());
    let updated = binary(op, &current, value)?;
    store(cell, &updated)
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = a.len().max(b.len());
    let dim = |s: &[usize], k: usize| {
        let offset = n - s.len();
        if k < offset {
            1
        } else {
            s[k - offset]
        }
    };
    (0..n)
        .map(|k| match (dim(a, k), dim(b, k)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn zip_arrays(a: &ArrayD<f64>, b: &ArrayD<f64>, f: impl Fn(f64, f64) -> f64) -> Result<ArrayD<f64>> {
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| {
        JitError::Runtime(format!(
            "operands could not be broadcast together with shapes {:?} {:?}",
            a.shape(),
            b.shape()
        ))
    })?;
    let dim = IxDyn(&shape);
    match (a.broadcast(dim.clone()), b.broadcast(dim)) {
        (Some(av), Some(bv)) => Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y))),
        _ => Err(JitError::Runtime("broadcast failed".to_string())),
    }
}

fn float_op(op: BinOp) -> Result<fn(f64, f64) -> f64> {
    Ok(match op {
        BinOp::Add => |x, y| x + y,
        BinOp::Sub => |x, y| x - y,
        BinOp::Mul => |x, y| x * y,
        BinOp::Div => |x, y| x / y,
        BinOp::Mod => |x, y| x - y * (x / y).floor(),
        BinOp::Pow => f64::powf,
        BinOp::Eq => |x, y| f64::from(u8::from(x == y)),
        BinOp::Ne => |x, y| f64::from(u8::from(x != y)),
        BinOp::Lt => |x, y| f64::from(u8::from(x < y)),
        BinOp::Le => |x, y| f64::from(u8::from(x <= y)),
        BinOp::Gt => |x, y| f64::from(u8::from(x > y)),
        BinOp::Ge => |x, y| f64::from(u8::from(x >= y)),
        BinOp::And | BinOp::Or => {
            return Err(JitError::Runtime(
                "logical operators are evaluated lazily".to_string(),
            ))
        }
    })
}

fn is_comparison(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
    )
}

fn binary(op: BinOp, left: &RuntimeValue, right: &RuntimeValue) -> Result<RuntimeValue> {
    use RuntimeValue as V;

    if matches!(left, V::Array(_)) || matches!(right, V::Array(_)) {
        let f = float_op(op)?;
        return Ok(V::array(zip_arrays(&left.to_array()?, &right.to_array()?, f)?));
    }

    match (left, right) {
        (V::None, V::None) if matches!(op, BinOp::Eq | BinOp::Ne) => {
            return Ok(V::Bool(op == BinOp::Eq))
        }
        (l, r) if !l.is_numeric() || !r.is_numeric() => {
            return Err(JitError::Runtime(format!(
                "unsupported operand types for {}: {} and {}",
                op.symbol(),
                l.type_name(),
                r.type_name()
            )))
        }
        _ => {}
    }

    let ints = !matches!(left, V::Float(_)) && !matches!(right, V::Float(_));
    if ints {
        if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
            let overflow = || JitError::Runtime(format!("integer overflow in {a} {} {b}", op.symbol()));
            match op {
                BinOp::Add => return a.checked_add(b).map(V::Int).ok_or_else(overflow),
                BinOp::Sub => return a.checked_sub(b).map(V::Int).ok_or_else(overflow),
                BinOp::Mul => return a.checked_mul(b).map(V::Int).ok_or_else(overflow),
                BinOp::Mod => {
                    if b == 0 {
                        return Err(JitError::Runtime("integer modulo by zero".to_string()));
                    }
                    // result takes the sign of the divisor
                    let r = a % b;
                    return Ok(V::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }));
                }
                BinOp::Pow if b >= 0 => {
                    return u32::try_from(b)
                        .ok()
                        .and_then(|e| a.checked_pow(e))
                        .map(V::Int)
                        .ok_or_else(overflow)
                }
                _ => {}
            }
        }
    }

    let a = left.expect_f64("left operand")?;
    let b = right.expect_f64("right operand")?;
    let result = float_op(op)?(a, b);
    if is_comparison(op) {
        Ok(V::Bool(result != 0.0))
    } else {
        Ok(V::Float(result))
    }
}

fn iterate(value: &RuntimeValue) -> Result<Vec<RuntimeValue>> {
    match value {
        RuntimeValue::Range(items) => Ok(items.iter().map(|&i| RuntimeValue::Int(i)).collect()),
        RuntimeValue::Array(cell) => {
            let array = cell.borrow();
            match array.ndim() {
                0 => Err(JitError::Runtime("iteration over a 0-d array".to_string())),
                1 => Ok(array.iter().map(|&x| RuntimeValue::Float(x)).collect()),
                _ => Ok(array
                    .axis_iter(Axis(0))
                    .map(|row| RuntimeValue::array(row.to_owned()))
                    .collect()),
            }
        }
        other => Err(JitError::Runtime(format!(
            "{} is not iterable",
            other.type_name()
        ))),
    }
}

fn shape_of(value: &RuntimeValue) -> Result<Vec<usize>> {
    match value {
        RuntimeValue::Array(cell) => Ok(cell.borrow().iter().map(|&d| d.max(0.0) as usize).collect()),
        other => {
            let n = other.as_i64().ok_or_else(|| {
                JitError::Runtime(format!("size must be an integer, got {}", other.type_name()))
            })?;
            Ok(vec![n.max(0) as usize])
        }
    }
}

fn unary_math(value: &RuntimeValue, name: &str, f: fn(f64) -> f64) -> Result<RuntimeValue> {
    match value {
        RuntimeValue::Array(cell) => Ok(RuntimeValue::array(cell.borrow().mapv(f))),
        other => Ok(RuntimeValue::Float(f(other.expect_f64(name)?))),
    }
}

fn call_builtin(builtin: Builtin, args: &[RuntimeValue]) -> Result<RuntimeValue> {
    let arg = |k: usize| {
        args.get(k).ok_or_else(|| {
            JitError::Runtime(format!("{builtin:?} expects at least {} arguments", k + 1))
        })
    };
    let int = |k: usize| -> Result<i64> {
        let v = arg(k)?;
        v.as_i64()
            .ok_or_else(|| JitError::Runtime(format!("expected an integer, got {}", v.type_name())))
    };

    match builtin {
        Builtin::Range => {
            let (start, stop, step) = match args.len() {
                1 => (0, int(0)?, 1),
                2 => (int(0)?, int(1)?, 1),
                _ => (int(0)?, int(1)?, int(2)?),
            };
            if step == 0 {
                return Err(JitError::Runtime("range() arg 3 must not be zero".to_string()));
            }
            let mut items = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                items.push(i);
                i += step;
            }
            Ok(RuntimeValue::Range(items))
        }
        Builtin::Len => match arg(0)? {
            RuntimeValue::Array(cell) => {
                let array = cell.borrow();
                match array.shape().first() {
                    Some(&n) => Ok(RuntimeValue::Int(n as i64)),
                    None => Err(JitError::Runtime("len() of unsized object".to_string())),
                }
            }
            RuntimeValue::Range(items) => Ok(RuntimeValue::Int(items.len() as i64)),
            other => Err(JitError::Runtime(format!(
                "object of type {} has no len()",
                other.type_name()
            ))),
        },
        Builtin::Abs => match arg(0)? {
            RuntimeValue::Int(i) => Ok(RuntimeValue::Int(i.abs())),
            other => unary_math(other, "abs", f64::abs),
        },
        Builtin::Exp => unary_math(arg(0)?, "exp", f64::exp),
        Builtin::Log => unary_math(arg(0)?, "log", f64::ln),
        Builtin::Sqrt => unary_math(arg(0)?, "sqrt", f64::sqrt),
        Builtin::Tanh => unary_math(arg(0)?, "tanh", f64::tanh),
        Builtin::Sum => match arg(0)? {
            RuntimeValue::Array(cell) => Ok(RuntimeValue::Float(cell.borrow().sum())),
            RuntimeValue::Range(items) => Ok(RuntimeValue::Int(items.iter().sum())),
            other => Err(JitError::Runtime(format!(
                "{} is not iterable",
                other.type_name()
            ))),
        },
        Builtin::Zeros => {
            let shape = if args.len() == 1 {
                shape_of(arg(0)?)?
            } else {
                (0..args.len()).map(|k| int(k).map(|d| d.max(0) as usize)).collect::<Result<_>>()?
            };
            Ok(RuntimeValue::array(ArrayD::zeros(IxDyn(&shape))))
        }
        Builtin::ZerosLike => Ok(RuntimeValue::array(ArrayD::zeros(arg(0)?.to_array()?.raw_dim()))),
        Builtin::Min | Builtin::Max => {
            let pick_max = builtin == Builtin::Max;
            let values: Vec<f64> = match args {
                [RuntimeValue::Array(cell)] => cell.borrow().iter().copied().collect(),
                _ => args
                    .iter()
                    .map(|v| v.expect_f64("min/max argument"))
                    .collect::<Result<_>>()?,
            };
            let best = values
                .into_iter()
                .reduce(|a, b| if (b > a) == pick_max { b } else { a })
                .ok_or_else(|| JitError::Runtime("min/max of an empty sequence".to_string()))?;
            if args.iter().all(|v| matches!(v, RuntimeValue::Int(_))) {
                Ok(RuntimeValue::Int(best as i64))
            } else {
                Ok(RuntimeValue::Float(best))
            }
        }
        Builtin::Float => Ok(RuntimeValue::Float(arg(0)?.expect_f64("float()")?)),
        Builtin::Int => Ok(RuntimeValue::Int(arg(0)?.expect_f64("int()")?.trunc() as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse_function;
    use ndarray::arr1;

    fn compile(source: &str) -> CompiledFn {
        let def = parse_function(source).unwrap();
        Interpreter
            .compile(CompileUnit {
                def,
                scope: Scope::new(),
                options: CompileOptions::default(),
                by_reference: BTreeSet::new(),
                meta: None,
            })
            .unwrap()
    }

    #[test]
    fn test_arithmetic_and_control_flow() {
        let f = compile(
            "def f(n) {
                total = 0
                for i in range(n) {
                    if i % 2 == 0 { total += i } else { total -= 1 }
                }
                return total * 2 ** 2
            }",
        );
        let out = f.call(vec![RuntimeValue::Int(5)], vec![]).unwrap();
        // (0 + 2 + 4 - 2) * 4
        assert!(matches!(out, RuntimeValue::Int(16)));
    }

    #[test]
    fn test_arrays_are_passed_by_reference() {
        let f = compile("def f(x) { x[0] = 7.0 \n x += 1.0 }");
        let x = RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn());
        f.call(vec![x.clone()], vec![]).unwrap();
        assert_eq!(x.to_array().unwrap(), arr1(&[8.0, 3.0]).into_dyn());
    }

    #[test]
    fn test_plain_assignment_rebinds_unless_by_reference() {
        let def = parse_function("def f(x) { x = x * 2.0 }").unwrap();
        let x = RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn());

        let rebinding = compile("def f(x) { x = x * 2.0 }");
        let outcome = rebinding.invoke(vec![x.clone()], vec![]).unwrap();
        assert_eq!(x.to_array().unwrap()[[1]], 2.0);
        assert!(!outcome.params["x"].same_array(match &x {
            RuntimeValue::Array(cell) => cell,
            _ => unreachable!(),
        }));

        let by_reference = Interpreter
            .compile(CompileUnit {
                def,
                scope: Scope::new(),
                options: CompileOptions::default(),
                by_reference: BTreeSet::from(["x".to_string()]),
                meta: None,
            })
            .unwrap();
        by_reference.call(vec![x.clone()], vec![]).unwrap();
        assert_eq!(x.to_array().unwrap()[[1]], 4.0);
    }

    #[test]
    fn test_whole_value_store_keeps_shape() {
        let def = parse_function("def f(x, y) { x = y }").unwrap();
        let f = Interpreter
            .compile(CompileUnit {
                def,
                scope: Scope::new(),
                options: CompileOptions::default(),
                by_reference: BTreeSet::from(["x".to_string()]),
                meta: None,
            })
            .unwrap();
        let x = RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn());

        f.call(vec![x.clone(), RuntimeValue::Float(5.0)], vec![]).unwrap();
        assert_eq!(x.to_array().unwrap(), arr1(&[5.0, 5.0]).into_dyn());

        let y = RuntimeValue::array(arr1(&[1.0, 2.0, 3.0]).into_dyn());
        match f.call(vec![x.clone(), y], vec![]) {
            Err(JitError::Runtime(msg)) => assert_eq!(msg, "could not broadcast [3] into [2]"),
            other => panic!("expected a broadcast error, got {other:?}"),
        }
        assert_eq!(x.to_array().unwrap(), arr1(&[5.0, 5.0]).into_dyn());
    }

    #[test]
    fn test_keyword_binding_and_defaults() {
        let f = compile("def f(a, b=10, c=None) { return a + b }");
        let out = f
            .call(vec![RuntimeValue::Int(1)], vec![("b".to_string(), RuntimeValue::Int(2))])
            .unwrap();
        assert!(matches!(out, RuntimeValue::Int(3)));
        assert!(f.call(vec![], vec![]).is_err());
        assert!(f
            .call(vec![RuntimeValue::Int(1)], vec![("d".to_string(), RuntimeValue::Int(2))])
            .is_err());
    }

    #[test]
    fn test_broadcasting() {
        let f = compile("def f(a, b) { return a * b + 1.0 }");
        let a = RuntimeValue::array(ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let b = RuntimeValue::array(arr1(&[10.0, 100.0]).into_dyn());
        let out = f.call(vec![a, b], vec![]).unwrap().to_array().unwrap();
        assert_eq!(out, ndarray::arr2(&[[11.0, 201.0], [31.0, 401.0]]).into_dyn());

        let c = RuntimeValue::array(arr1(&[1.0, 2.0, 3.0]).into_dyn());
        let d = RuntimeValue::array(arr1(&[1.0, 2.0]).into_dyn());
        assert!(f.call(vec![c, d], vec![]).is_err());
    }

    #[test]
    fn test_builtins() {
        let f = compile("def f(x) { return sum(zeros_like(x)) + max(x) + len(x) + abs(-2) }");
        let x = RuntimeValue::array(arr1(&[1.0, 5.0, 3.0]).into_dyn());
        let out = f.call(vec![x], vec![]).unwrap();
        assert_eq!(out.as_f64(), Some(10.0));
    }

    #[test]
    fn test_python_modulo() {
        let f = compile("def f(a, b) { return a % b }");
        let out = f.call(vec![RuntimeValue::Int(-1), RuntimeValue::Int(3)], vec![]).unwrap();
        assert!(matches!(out, RuntimeValue::Int(2)));
        let out = f.call(vec![RuntimeValue::Float(-1.0), RuntimeValue::Int(3)], vec![]).unwrap();
        assert_eq!(out.as_f64(), Some(2.0));
    }

    #[test]
    fn test_native_rejects_keywords() {
        let native = NativeFn::new("double", |args| {
            Ok(RuntimeValue::Float(args[0].expect_f64("x")? * 2.0))
        });
        let f = Interpreter.compile_native(&native, &CompileOptions::default()).unwrap();
        assert_eq!(f.call(vec![RuntimeValue::Float(2.0)], vec![]).unwrap().as_f64(), Some(4.0));
        assert!(f
            .call(vec![], vec![("x".to_string(), RuntimeValue::Float(1.0))])
            .is_err());
    }
}
