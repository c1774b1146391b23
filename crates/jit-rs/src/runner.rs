//! Step loop.
//!
//! Each simulation step advances the shared counter and time, pushes the
//! current target values into every delay, then runs the step methods of
//! every node in graph order.

use crate::backend::Backend;
use crate::driver::{AnalysisResult, Jit};
use crate::graph::{Member, NodeId, ObjectGraph};
use crate::interp::Interpreter;
use crate::runtime::RuntimeValue;
use crate::Result;
use dyna_delay::SharedContext;
use tracing::{debug, trace};

/// Compiled step method of one node
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub node: NodeId,
    pub method: String,
    pub result: AnalysisResult,
}

impl CompiledStep {
    /// Run with the shared arguments whose names match parameters.
    ///
    /// A parameter named `<delay>_<entry>` receives that delay entry.
    pub fn run(&self, graph: &ObjectGraph, ctx: &SharedContext) -> Result<RuntimeValue> {
        let params = self
            .result
            .function
            .params()
            .iter()
            .filter(|p| !self.result.states.contains_key(*p));
        let kwargs = shared_kwargs(ctx, params)?;
        self.result.invoke(graph, Vec::new(), kwargs)
    }
}

/// Step method run directly against the graph
#[derive(Debug, Clone)]
pub struct DirectStep {
    pub node: NodeId,
    pub method: String,
    /// Parameters after the owner
    pub params: Vec<String>,
}

impl DirectStep {
    fn new(graph: &ObjectGraph, node: NodeId, method: &str) -> Result<Self> {
        let params = match graph.member(node, method)? {
            Member::Method(m) => m.def.param_names().into_iter().skip(1).collect(),
            Member::Integrator(integ) => {
                let skip = usize::from(integ.meta.bound);
                integ.meta.def.param_names().into_iter().skip(skip).collect()
            }
            _ => Vec::new(),
        };
        Ok(Self {
            node,
            method: method.to_string(),
            params,
        })
    }

    pub fn run(&self, graph: &ObjectGraph, ctx: &SharedContext) -> Result<RuntimeValue> {
        let kwargs = shared_kwargs(ctx, self.params.iter())?;
        Interpreter::with_graph(graph).call_method(self.node, &self.method, Vec::new(), kwargs)
    }
}

fn shared_kwargs<'a>(
    ctx: &SharedContext,
    params: impl Iterator<Item = &'a String>,
) -> Result<Vec<(String, RuntimeValue)>> {
    let mut kwargs = Vec::new();
    for param in params {
        if let Some(value) = ctx.args.get(param) {
            kwargs.push((param.clone(), RuntimeValue::from(value)));
        } else if param == "dt" {
            kwargs.push((param.clone(), RuntimeValue::Float(ctx.args.dt())));
        } else if let Some((delay, entry)) = delay_entry(ctx, param) {
            let value = ctx.at(delay, entry, None)?;
            kwargs.push((param.clone(), RuntimeValue::array(value)));
        }
    }
    Ok(kwargs)
}

fn delay_entry<'c, 'p>(ctx: &'c SharedContext, param: &'p str) -> Option<(&'c str, &'p str)> {
    ctx.delay_names().find_map(|name| {
        let entry = param.strip_prefix(name)?.strip_prefix('_')?;
        ctx.delay(name)?.entry(entry).map(|_| (name, entry))
    })
}

#[derive(Debug, Clone)]
enum Step {
    Compiled(CompiledStep),
    Direct(DirectStep),
}

impl Step {
    fn run(&self, graph: &ObjectGraph, ctx: &SharedContext) -> Result<RuntimeValue> {
        match self {
            Step::Compiled(step) => step.run(graph, ctx),
            Step::Direct(step) => step.run(graph, ctx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    steps: Vec<Step>,
    executed: usize,
}

impl Runner {
    /// Runner over the compiled step methods reachable from `root`
    pub fn new<B: Backend>(jit: &mut Jit<B>, graph: &ObjectGraph, root: NodeId) -> Result<Self> {
        let steps = jit
            .compile_steps(graph, root)?
            .into_iter()
            .map(Step::Compiled)
            .collect();
        Ok(Self { steps, executed: 0 })
    }

    /// Runner evaluating the original step methods without compilation
    pub fn uncompiled(graph: &ObjectGraph, root: NodeId) -> Result<Self> {
        let mut steps = Vec::new();
        for node in graph.reachable(root)? {
            for method in &graph.node(node)?.steps {
                steps.push(Step::Direct(DirectStep::new(graph, node, method)?));
            }
        }
        debug!(count = steps.len(), "uncompiled runner ready");
        Ok(Self { steps, executed: 0 })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps run so far
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn step(&mut self, graph: &ObjectGraph, ctx: &mut SharedContext) -> Result<()> {
        ctx.advance();
        ctx.update()?;
        for step in &self.steps {
            step.run(graph, ctx)?;
        }
        self.executed += 1;
        trace!(step = self.executed, "step done");
        Ok(())
    }

    /// Run `n` steps, calling `on_step` with the number completed
    pub fn run(
        &mut self,
        graph: &ObjectGraph,
        ctx: &mut SharedContext,
        n: usize,
        mut on_step: impl FnMut(usize),
    ) -> Result<()> {
        for k in 0..n {
            self.step(graph, ctx)?;
            on_step(k + 1);
        }
        debug!(steps = n, total = self.executed, "run finished");
        Ok(())
    }
}
