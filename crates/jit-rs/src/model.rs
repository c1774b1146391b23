//! JSON model description.
//!
//! ```json
//! {
//!   "dt": 0.1,
//!   "root": "net",
//!   "nodes": [
//!     { "name": "net",
//!       "members": {
//!         "V": { "state": { "value": [0.0, 0.0] } },
//!         "tau": { "constant": 10.0 },
//!         "syn": { "child": "syn" },
//!         "update": { "method": "def update(self, dt) { self.V.value += dt / self.tau }" }
//!       },
//!       "steps": ["update"] }
//!   ],
//!   "delays": [
//!     { "name": "V_delay", "node": "net", "state": "V", "length": 2,
//!       "entries": [{ "name": "d2", "step": 2 }] }
//!   ]
//! }
//! ```

use crate::graph::{Member, Method, NodeId, ObjectGraph};
use crate::integrator::{Integrator, RawFunc};
use crate::random::{self, RandomState};
use crate::runtime::Scope;
use crate::{JitError, JitSettings, Result};
use dyna_core::{DynaError, Value, Variable};
use dyna_delay::{BeforeT0, DelayBuffer, DelayStep, DelayTime, SharedContext, UpdateMethod};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Time step; the process-wide default when absent
    #[serde(default)]
    pub dt: Option<f64>,
    /// Seed of the global random stream
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub settings: JitSettings,
    pub root: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub delays: Vec<DelaySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub members: BTreeMap<String, MemberSpec>,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberSpec {
    State(StateSpec),
    Constant(ConstantSpec),
    /// Name of another node
    Child(String),
    /// Seed of a per-node stream
    Random(u64),
    /// Method source
    Method(String),
    Integrator(IntegratorSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSpec {
    pub value: Vec<f64>,
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
    #[serde(default)]
    pub batch_axis: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantSpec {
    Bool(bool),
    Int(i64),
    Float(f64),
    Array(Vec<f64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegratorSpec {
    Euler {
        var: String,
        derivative: String,
    },
    Rk2 {
        var: String,
        derivative: String,
    },
    Source {
        method: String,
        code: String,
        /// Name in `code` to a method of the owning node
        #[serde(default)]
        raw_funcs: BTreeMap<String, String>,
        #[serde(default)]
        bound: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySpec {
    pub name: String,
    pub node: String,
    pub state: String,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub method: UpdateMethod,
    #[serde(default)]
    pub before_t0: f64,
    #[serde(default)]
    pub entries: Vec<EntrySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySpec {
    pub name: String,
    #[serde(default)]
    pub step: Option<StepSpec>,
    #[serde(default)]
    pub time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Uniform(i64),
    PerRow(Vec<i64>),
}

/// A built model
#[derive(Debug)]
pub struct Model {
    pub graph: ObjectGraph,
    pub context: SharedContext,
    pub root: NodeId,
    pub settings: JitSettings,
}

impl ModelSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Build the graph, then the delays over its states
    pub fn build(&self) -> Result<Model> {
        let mut context = SharedContext::new();
        if let Some(dt) = self.dt {
            dyna_core::set_dt(dt)?;
            context.args.set_dt(dt)?;
        }
        if let Some(seed) = self.seed {
            random::seed(seed);
        }

        let mut graph = ObjectGraph::new();
        let ids = self
            .nodes
            .iter()
            .map(|node| graph.add_node(&node.name))
            .collect::<Result<Vec<_>>>()?;

        for (spec, &id) in self.nodes.iter().zip(&ids) {
            for (name, member) in &spec.members {
                let member = build_member(&graph, &spec.name, name, member)?;
                graph.insert(id, name, member)?;
            }
            for step in &spec.steps {
                graph.add_step(id, step)?;
            }
        }

        for delay in &self.delays {
            let node = find(&graph, &delay.node)?;
            let target = graph.state(node, &delay.state)?;
            let before_t0 = if delay.before_t0 == 0.0 {
                BeforeT0::Zero
            } else {
                BeforeT0::Scalar(delay.before_t0)
            };
            let buffer = DelayBuffer::new(&target, delay.length, before_t0, delay.method)?;
            context.save(&delay.name, buffer)?;
            for entry in &delay.entries {
                let step = entry.step.as_ref().map(|s| match s {
                    StepSpec::Uniform(step) => DelayStep::Scalar(*step),
                    StepSpec::PerRow(steps) => DelayStep::from(steps.clone()),
                });
                let time = entry.time.map(DelayTime::Scalar);
                context.register_entry(&delay.name, &entry.name, time, step)?;
            }
            debug!(delay = %delay.name, entries = delay.entries.len(), "delay built");
        }

        let root = find(&graph, &self.root)?;
        info!(
            nodes = graph.len(),
            delays = self.delays.len(),
            root = %self.root,
            "model built"
        );
        Ok(Model {
            graph,
            context,
            root,
            settings: self.settings,
        })
    }
}

fn find(graph: &ObjectGraph, name: &str) -> Result<NodeId> {
    graph
        .find(name)
        .ok_or_else(|| JitError::UnknownNode(name.to_string()))
}

fn build_member(graph: &ObjectGraph, node: &str, name: &str, spec: &MemberSpec) -> Result<Member> {
    Ok(match spec {
        MemberSpec::State(state) => {
            let shape = state.shape.clone().unwrap_or_else(|| vec![state.value.len()]);
            let value = ArrayD::from_shape_vec(IxDyn(&shape), state.value.clone()).map_err(|e| {
                DynaError::InvalidArgument(format!("state {node}.{name} with shape {shape:?}: {e}"))
            })?;
            let variable = match state.batch_axis {
                Some(axis) => Variable::batched(name, value, axis)?,
                None => Variable::new(name, value),
            };
            Member::State(variable)
        }
        MemberSpec::Constant(constant) => Member::Constant(match constant {
            ConstantSpec::Bool(b) => Value::Bool(*b),
            ConstantSpec::Int(i) => Value::Int(*i),
            ConstantSpec::Float(x) => Value::Float(*x),
            ConstantSpec::Array(values) => {
                Value::Array(ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.clone()).map_err(
                    |e| DynaError::InvalidArgument(format!("constant {node}.{name}: {e}")),
                )?)
            }
        }),
        MemberSpec::Child(child) => Member::Child(find(graph, child)?),
        MemberSpec::Random(seed) => Member::Random(RandomState::new(*seed)),
        MemberSpec::Method(source) => Member::Method(Method::parse(source)?),
        MemberSpec::Integrator(IntegratorSpec::Euler { var, derivative }) => {
            Member::Integrator(Integrator::euler(var, derivative)?)
        }
        MemberSpec::Integrator(IntegratorSpec::Rk2 { var, derivative }) => {
            Member::Integrator(Integrator::rk2(var, derivative)?)
        }
        MemberSpec::Integrator(IntegratorSpec::Source {
            method,
            code,
            raw_funcs,
            bound,
        }) => {
            let raw_funcs = raw_funcs
                .iter()
                .map(|(key, target)| {
                    (
                        key.clone(),
                        RawFunc::Method {
                            node: None,
                            method: target.clone(),
                        },
                    )
                })
                .collect();
            Member::Integrator(Integrator::from_source(
                method,
                code,
                raw_funcs,
                Scope::new(),
                *bound,
            )?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"{
        "root": "net",
        "nodes": [
            { "name": "net",
              "members": {
                "V": { "state": { "value": [1.0, 2.0, 3.0, 4.0], "shape": [2, 2] } },
                "tau": { "constant": 10.0 },
                "n": { "constant": 3 },
                "syn": { "child": "syn" },
                "update": { "method": "def update(self) { self.V.value += self.syn.g.value }" }
              },
              "steps": ["update"] },
            { "name": "syn",
              "members": {
                "g": { "state": { "value": [0.5, 0.5] } },
                "owner": { "child": "net" }
              } }
        ],
        "delays": [
            { "name": "g_delay", "node": "syn", "state": "g", "length": 1,
              "method": "concat", "entries": [{ "name": "prev", "step": 1 }] }
        ]
    }"#;

    #[test]
    fn test_build_model() {
        let model = ModelSpec::from_json(MODEL).unwrap().build().unwrap();
        let net = model.graph.find("net").unwrap();
        assert_eq!(model.root, net);
        assert_eq!(model.graph.state(net, "V").unwrap().shape(), vec![2, 2]);
        assert!(matches!(
            model.graph.member(net, "n").unwrap(),
            Member::Constant(Value::Int(3))
        ));
        assert!(matches!(
            model.graph.member(net, "tau").unwrap(),
            Member::Constant(Value::Float(_))
        ));
        let delay = model.context.delay("g_delay").unwrap();
        assert_eq!(delay.method(), UpdateMethod::Concat);
        assert!(delay.entry("prev").is_some());
    }

    #[test]
    fn test_unknown_child() {
        let spec = ModelSpec::from_json(
            r#"{ "root": "a", "nodes": [{ "name": "a", "members": { "b": { "child": "nope" } } }] }"#,
        )
        .unwrap();
        assert!(matches!(spec.build(), Err(JitError::UnknownNode(_))));
    }

    #[test]
    fn test_bad_state_shape() {
        let spec = ModelSpec::from_json(
            r#"{ "root": "a", "nodes": [{ "name": "a",
                 "members": { "x": { "state": { "value": [1.0, 2.0, 3.0], "shape": [2, 2] } } } }] }"#,
        )
        .unwrap();
        assert!(matches!(spec.build(), Err(JitError::Core(_))));
    }
}
