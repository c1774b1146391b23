//! Recompilation driver.
//!
//! [`Jit::analyze`] turns a member of the object graph into a pure function:
//! state read through `self.<chain>` becomes a trailing parameter, nested
//! methods are analyzed and compiled first, random streams and constants are
//! bound in the code scope. Results are cached per `(node, member)`.

use crate::analyze::{
    collect_chains, hoisted_name, owner_param, resolve_chain, uses_name, Terminal,
};
use crate::backend::{Backend, CompileOptions, CompileUnit, CompiledFn, MIN_BACKEND_ABI};
use crate::graph::{Member, NodeId, ObjectGraph};
use crate::integrator::{CodeMeta, RawFunc, StateSource};
use crate::random::RandomSource;
use crate::rewrite::{append_call_args, substitute};
use crate::runner::CompiledStep;
use crate::runtime::{RuntimeValue, Scope};
use crate::syntax::{Expr, FunctionDef, Param};
use crate::{JitError, JitSettings, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::{debug, info, trace};

/// A compiled function plus what it needs at call time
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub function: CompiledFn,
    /// Generated source; `None` when the function needed no rewriting
    pub source: Option<String>,
    pub hoisted_arguments: BTreeSet<String>,
    /// Hoisted name to the expression supplying it (`sub.w.value`)
    pub argument_to_source_expression: BTreeMap<String, String>,
    /// Chain prefix to the child node it reached
    pub visited_objects: BTreeMap<String, NodeId>,
    pub states: BTreeMap<String, StateSource>,
}

impl AnalysisResult {
    fn new(
        function: CompiledFn,
        source: Option<String>,
        states: BTreeMap<String, StateSource>,
        visited_objects: BTreeMap<String, NodeId>,
    ) -> Self {
        Self {
            function,
            source,
            hoisted_arguments: states.keys().cloned().collect(),
            argument_to_source_expression: states
                .iter()
                .map(|(name, s)| (name.clone(), s.expr.clone()))
                .collect(),
            visited_objects,
            states,
        }
    }

    /// Call the function, supplying every hoisted argument not given in
    /// `kwargs` from the graph. Hoisted values rebound by the call are
    /// written back to their state.
    pub fn invoke(
        &self,
        graph: &ObjectGraph,
        args: Vec<RuntimeValue>,
        mut kwargs: Vec<(String, RuntimeValue)>,
    ) -> Result<RuntimeValue> {
        let mut supplied = Vec::new();
        for (name, source) in &self.states {
            if kwargs.iter().any(|(k, _)| k == name) {
                continue;
            }
            let variable = graph.state(source.node, &source.attr)?;
            kwargs.push((name.clone(), RuntimeValue::Array(variable.storage())));
            supplied.push((name, variable));
        }

        let outcome = self.function.invoke(args, kwargs)?;

        for (name, variable) in supplied {
            match outcome.params.get(name) {
                Some(value) if !value.same_array(&variable.storage()) => {
                    trace!(name = %name, "hoisted argument rebound, writing back");
                    let data = value.to_array()?;
                    let shape = variable.shape();
                    let broadcast = data.broadcast(shape.as_slice()).map(|view| view.to_owned());
                    variable.assign(&broadcast.unwrap_or(data))?;
                }
                _ => {}
            }
        }
        Ok(outcome.value)
    }
}

pub struct Jit<B: Backend> {
    backend: B,
    settings: JitSettings,
    cache: BTreeMap<(NodeId, String), AnalysisResult>,
    /// Members under analysis, for cycle detection
    stack: Vec<(NodeId, String)>,
}

impl<B: Backend> Jit<B> {
    pub fn new(backend: B, settings: JitSettings) -> Result<Self> {
        let found = backend.abi_version();
        if found < MIN_BACKEND_ABI {
            return Err(JitError::IncompatibleBackend {
                found,
                required: MIN_BACKEND_ABI,
            });
        }
        debug!(backend = backend.name(), abi = found, "jit driver ready");
        Ok(Self {
            backend,
            settings,
            cache: BTreeMap::new(),
            stack: Vec::new(),
        })
    }

    pub fn settings(&self) -> &JitSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn options(&self) -> CompileOptions {
        CompileOptions::from(&self.settings)
    }

    /// Analyze and compile `member` of `node`
    pub fn analyze(&mut self, graph: &ObjectGraph, node: NodeId, member: &str) -> Result<AnalysisResult> {
        let key = (node, member.to_string());
        if let Some(hit) = self.cache.get(&key) {
            trace!(node = %node, member, "analysis cache hit");
            return Ok(hit.clone());
        }
        if self.stack.contains(&key) {
            return Err(JitError::RecursiveCall {
                chain: format!("{}.{member}", graph.name(node)?),
            });
        }

        debug!(node = graph.name(node)?, member, "analyzing");
        self.stack.push(key.clone());
        let result = self.analyze_member(graph, node, member);
        self.stack.pop();
        let result = result?;

        debug!(
            node = graph.name(node)?,
            member,
            hoisted = result.hoisted_arguments.len(),
            "analysis finished"
        );
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    /// Recompile an integrator-produced function from its stored metadata
    pub fn recompile(
        &mut self,
        graph: &ObjectGraph,
        owner: NodeId,
        function: &CompiledFn,
    ) -> Result<AnalysisResult> {
        match function.meta() {
            Some(meta) => {
                let meta = Rc::clone(meta);
                self.analyze_integrator(graph, owner, &meta, Some(function))
            }
            None => Ok(AnalysisResult::new(
                function.clone(),
                None,
                BTreeMap::new(),
                BTreeMap::new(),
            )),
        }
    }

    /// Drop cached results of `node`
    pub fn invalidate(&mut self, node: NodeId) {
        self.cache.retain(|(n, _), _| *n != node);
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Compile the step methods of every node reachable from `root`
    pub fn compile_steps(&mut self, graph: &ObjectGraph, root: NodeId) -> Result<Vec<CompiledStep>> {
        let mut steps = Vec::new();
        for node in graph.reachable(root)? {
            for method in graph.node(node)?.steps.clone() {
                let result = self.analyze(graph, node, &method)?;
                steps.push(CompiledStep {
                    node,
                    method,
                    result,
                });
            }
        }
        info!(count = steps.len(), "step functions compiled");
        Ok(steps)
    }

    fn analyze_member(&mut self, graph: &ObjectGraph, node: NodeId, member: &str) -> Result<AnalysisResult> {
        match graph.member(node, member)? {
            Member::Method(method) => self.analyze_method(graph, node, &method.def, &method.closure),
            Member::Integrator(integ) => {
                let meta = Rc::clone(&integ.meta);
                self.analyze_integrator(graph, node, &meta, None)
            }
            Member::Native(native) => {
                let function = self.backend.compile_native(native, &self.options())?;
                Ok(AnalysisResult::new(function, None, BTreeMap::new(), BTreeMap::new()))
            }
            other => Err(JitError::NotCallable {
                owner: graph.name(node)?.to_string(),
                member: format!("{member} ({})", other.kind()),
            }),
        }
    }

    fn analyze_method(
        &mut self,
        graph: &ObjectGraph,
        node: NodeId,
        original: &FunctionDef,
        closure: &Scope,
    ) -> Result<AnalysisResult> {
        let owner = owner_param(original)?;
        let mut def = original.clone();
        def.decorators.clear();
        def.params.remove(0);

        let bound = def.bound_names();
        let mut scope = closure.clone();
        let mut states: BTreeMap<String, StateSource> = BTreeMap::new();
        let mut subst = BTreeMap::new();
        let mut visited = BTreeMap::new();
        let mut synthesized: BTreeMap<String, (NodeId, String)> = BTreeMap::new();
        let mut call_rewrites = Vec::new();

        for chain in collect_chains(&def, &owner) {
            let resolved = resolve_chain(graph, node, &chain, &mut visited)?;
            if subst.contains_key(&resolved.text) {
                continue;
            }
            let name = hoisted_name(graph, resolved.node, &resolved.attr)?;
            let identity = (resolved.node, resolved.attr.clone());
            match synthesized.get(&name) {
                Some(existing) if *existing != identity => {
                    return Err(JitError::NameCollision {
                        function: def.name.clone(),
                        name,
                    })
                }
                Some(_) => {}
                None => {
                    if bound.contains(&name) || closure.contains_key(&name) {
                        return Err(JitError::NameCollision {
                            function: def.name.clone(),
                            name,
                        });
                    }
                    synthesized.insert(name.clone(), identity);
                }
            }

            match resolved.terminal {
                Terminal::State => {
                    subst.insert(format!("{}.value", resolved.text), name.clone());
                    states.insert(
                        name.clone(),
                        StateSource {
                            node: resolved.node,
                            attr: resolved.attr.clone(),
                            expr: format!("{}.{}.value", graph.name(resolved.node)?, resolved.attr),
                        },
                    );
                }
                Terminal::Random => {
                    scope.insert(name.clone(), RuntimeValue::Random(RandomSource::Global));
                }
                Terminal::Constant => {
                    if let Member::Constant(value) = graph.member(resolved.node, &resolved.attr)? {
                        scope.insert(name.clone(), RuntimeValue::from(value));
                    }
                }
                Terminal::Callable => {
                    let callee = self.analyze(graph, resolved.node, &resolved.attr)?;
                    if !callee.hoisted_arguments.is_empty() {
                        call_rewrites.push((resolved.text.clone(), callee.hoisted_arguments.clone()));
                    }
                    states.extend(callee.states);
                    scope.insert(name.clone(), RuntimeValue::Function(callee.function));
                }
            }
            subst.insert(resolved.text, name);
        }

        // state hoisted by nested calls must not shadow locals either
        if let Some(name) = states
            .keys()
            .find(|n| bound.contains(*n) || closure.contains_key(*n))
        {
            return Err(JitError::NameCollision {
                function: def.name.clone(),
                name: name.clone(),
            });
        }

        for (call, names) in &call_rewrites {
            append_call_args(&mut def, call, names, None)?;
        }
        let rewritten = substitute(&mut def, &subst);
        if uses_name(&def, &owner) {
            return Err(JitError::ChainResolvesToObject { chain: owner });
        }
        for name in states.keys() {
            def.params.push(Param::with_default(name, Expr::None));
        }

        let source = (rewritten > 0).then(|| def.to_string());
        if let Some(source) = &source {
            self.log_source(&def.name, source);
        }
        let unit = CompileUnit {
            def,
            scope,
            options: self.options(),
            by_reference: states.keys().cloned().collect(),
            meta: None,
        };
        let function = self.backend.compile(unit)?;
        Ok(AnalysisResult::new(function, source, states, visited))
    }

    fn analyze_integrator(
        &mut self,
        graph: &ObjectGraph,
        node: NodeId,
        meta: &Rc<CodeMeta>,
        original: Option<&CompiledFn>,
    ) -> Result<AnalysisResult> {
        if meta.is_exponential() {
            return self.analyze_method(graph, node, &meta.def, &meta.scope);
        }

        let mut def = meta.def.clone();
        def.decorators.clear();
        let remove_self = if meta.bound {
            Some(owner_param(&def)?)
        } else {
            None
        };
        if remove_self.is_some() {
            def.params.remove(0);
        }

        let mut scope = meta.scope.clone();
        let mut raw_funcs = meta.raw_funcs.clone();
        let mut states = meta.hoisted.clone();
        let mut changed = remove_self.is_some();

        for (key, raw) in &meta.raw_funcs {
            let function = match raw {
                RawFunc::Compiled(function) => function.clone(),
                RawFunc::Method { node: target, method } => {
                    let callee = self.analyze(graph, target.unwrap_or(node), method)?;
                    if !callee.hoisted_arguments.is_empty() || remove_self.is_some() {
                        append_call_args(
                            &mut def,
                            key,
                            &callee.hoisted_arguments,
                            remove_self.as_deref(),
                        )?;
                    }
                    states.extend(callee.states);
                    changed = true;
                    callee.function
                }
                RawFunc::Native(native) => {
                    changed = true;
                    self.backend.compile_native(native, &self.options())?
                }
            };
            scope.insert(key.clone(), RuntimeValue::Function(function.clone()));
            raw_funcs.insert(key.clone(), RawFunc::Compiled(function));
        }

        if !changed {
            let function = match original {
                Some(function) => function.clone(),
                None => self.backend.compile(CompileUnit {
                    def,
                    scope,
                    options: self.options(),
                    by_reference: states.keys().cloned().collect(),
                    meta: Some(Rc::clone(meta)),
                })?,
            };
            trace!(func = %meta.func_name, "integrator already compiled");
            return Ok(AnalysisResult::new(function, None, states, BTreeMap::new()));
        }

        if let Some(owner) = &remove_self {
            if uses_name(&def, owner) {
                return Err(JitError::ChainResolvesToObject {
                    chain: owner.clone(),
                });
            }
        }
        let existing: BTreeSet<String> = def.param_names().into_iter().collect();
        let bound = def.bound_names();
        for name in states.keys() {
            if existing.contains(name) && meta.hoisted.contains_key(name) {
                continue;
            }
            if bound.contains(name) || meta.scope.contains_key(name) {
                return Err(JitError::NameCollision {
                    function: def.name.clone(),
                    name: name.clone(),
                });
            }
            def.params.push(Param::with_default(name, Expr::None));
        }

        let source = def.to_string();
        self.log_source(&def.name, &source);
        debug!(
            func = %meta.func_name,
            method = %meta.method,
            hoisted = states.len(),
            "integrator recompiled"
        );
        let new_meta = Rc::new(CodeMeta {
            func_name: meta.func_name.clone(),
            method: meta.method.clone(),
            code: source.clone(),
            def: def.clone(),
            scope: scope.clone(),
            raw_funcs,
            hoisted: states.clone(),
            bound: false,
        });
        let function = self.backend.compile(CompileUnit {
            def,
            scope,
            options: self.options(),
            by_reference: states.keys().cloned().collect(),
            meta: Some(new_meta),
        })?;
        Ok(AnalysisResult::new(function, Some(source), states, BTreeMap::new()))
    }

    fn log_source(&self, name: &str, source: &str) {
        if self.settings.show_code {
            info!(func = name, "generated source:\n{source}");
        } else {
            debug!(func = name, "generated source:\n{source}");
        }
    }
}
