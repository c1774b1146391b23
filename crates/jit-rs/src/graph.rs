//! Object graph: an arena of stateful nodes and their declared members.
//!
//! Nodes reference each other through [`Member::Child`] edges, which may
//! form cycles (a child pointing back at its parent). Walks track node ids.

use crate::integrator::Integrator;
use crate::random::RandomState;
use crate::runtime::{NativeFn, Scope};
use crate::syntax::{parse_function, FunctionDef};
use crate::{JitError, Result};
use dyna_core::{Value, Variable};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Step function attached to a node
#[derive(Debug, Clone)]
pub struct Method {
    pub def: FunctionDef,
    pub source: String,
    /// Free names captured where the method was defined
    pub closure: Scope,
}

impl Method {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            def: parse_function(source)?,
            source: source.to_string(),
            closure: Scope::new(),
        })
    }

    pub fn with_closure(mut self, closure: Scope) -> Self {
        self.closure = closure;
        self
    }
}

/// Externally-readable member of a node
#[derive(Debug, Clone)]
pub enum Member {
    /// Mutable array state
    State(Variable),
    Random(RandomState),
    Child(NodeId),
    Method(Method),
    Native(NativeFn),
    Integrator(Integrator),
    /// Plain data, inlined at analysis time
    Constant(Value),
}

impl Member {
    pub fn kind(&self) -> &'static str {
        match self {
            Member::State(_) => "state",
            Member::Random(_) => "random",
            Member::Child(_) => "child",
            Member::Method(_) => "method",
            Member::Native(_) => "native",
            Member::Integrator(_) => "integrator",
            Member::Constant(_) => "constant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub members: BTreeMap<String, Member>,
    /// Methods run once per simulation step, in order
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectGraph {
    nodes: Vec<Node>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node names are unique: hoisted names are derived from them
    pub fn add_node(&mut self, name: &str) -> Result<NodeId> {
        if self.find(name).is_some() {
            return Err(JitError::DuplicateNode(name.to_string()));
        }
        self.nodes.push(Node {
            name: name.to_string(),
            members: BTreeMap::new(),
            steps: Vec::new(),
        });
        Ok(NodeId(self.nodes.len() - 1))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| JitError::UnknownNode(id.to_string()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| JitError::UnknownNode(id.to_string()))
    }

    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(self.node(id)?.name.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, id: NodeId, name: &str, member: Member) -> Result<()> {
        if let Member::Child(child) = member {
            self.node(child)?;
        }
        self.node_mut(id)?.members.insert(name.to_string(), member);
        Ok(())
    }

    pub fn add_state(&mut self, id: NodeId, name: &str, variable: Variable) -> Result<()> {
        self.insert(id, name, Member::State(variable))
    }

    pub fn add_child(&mut self, id: NodeId, name: &str, child: NodeId) -> Result<()> {
        self.insert(id, name, Member::Child(child))
    }

    pub fn add_method(&mut self, id: NodeId, name: &str, source: &str) -> Result<()> {
        self.insert(id, name, Member::Method(Method::parse(source)?))
    }

    pub fn add_constant(&mut self, id: NodeId, name: &str, value: impl Into<Value>) -> Result<()> {
        self.insert(id, name, Member::Constant(value.into()))
    }

    /// Append `method` to the node's per-step methods
    pub fn add_step(&mut self, id: NodeId, method: &str) -> Result<()> {
        let node = self.node_mut(id)?;
        match node.members.get(method) {
            Some(Member::Method(_)) | Some(Member::Integrator(_)) | Some(Member::Native(_)) => {
                node.steps.push(method.to_string());
                Ok(())
            }
            _ => Err(JitError::NotCallable {
                owner: node.name.clone(),
                member: method.to_string(),
            }),
        }
    }

    pub fn member(&self, id: NodeId, name: &str) -> Result<&Member> {
        let node = self.node(id)?;
        node.members
            .get(name)
            .ok_or_else(|| JitError::UnknownAttribute {
                owner: node.name.clone(),
                chain: name.to_string(),
            })
    }

    pub fn state(&self, id: NodeId, name: &str) -> Result<Variable> {
        match self.member(id, name)? {
            Member::State(variable) => Ok(variable.clone()),
            other => Err(JitError::Runtime(format!(
                "{}.{name} is a {}, not a state",
                self.name(id)?,
                other.kind()
            ))),
        }
    }

    /// Every node reachable from `root` through child edges, root first
    pub fn reachable(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let mut order = vec![root];
        let mut k = 0;
        while k < order.len() {
            for member in self.node(order[k])?.members.values() {
                if let Member::Child(child) = member {
                    if !order.contains(child) {
                        order.push(*child);
                    }
                }
            }
            k += 1;
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_node_names() {
        let mut graph = ObjectGraph::new();
        graph.add_node("neu").unwrap();
        assert!(matches!(graph.add_node("neu"), Err(JitError::DuplicateNode(_))));
    }

    #[test]
    fn test_cycles_are_walkable() {
        let mut graph = ObjectGraph::new();
        let parent = graph.add_node("parent").unwrap();
        let child = graph.add_node("child").unwrap();
        graph.add_child(parent, "sub", child).unwrap();
        graph.add_child(child, "up", parent).unwrap();
        assert_eq!(graph.reachable(parent).unwrap(), vec![parent, child]);
    }

    #[test]
    fn test_member_lookup() {
        let mut graph = ObjectGraph::new();
        let id = graph.add_node("neu").unwrap();
        graph
            .add_state(id, "V", Variable::from_vec("V", vec![0.0; 3]))
            .unwrap();
        graph.add_constant(id, "tau", 10.0).unwrap();
        assert_eq!(graph.state(id, "V").unwrap().shape(), vec![3]);
        assert!(graph.state(id, "tau").is_err());
        assert!(matches!(
            graph.member(id, "missing"),
            Err(JitError::UnknownAttribute { .. })
        ));
        assert!(matches!(graph.add_step(id, "tau"), Err(JitError::NotCallable { .. })));
    }
}
