//! Attribute-chain collection and resolution against the object graph.
//!
//! Nothing here executes code: a function body is scanned for chains rooted
//! at its owner parameter, and each chain is walked through the declared
//! members of the graph until it reaches something that is not a child node.

use crate::graph::{Member, NodeId, ObjectGraph};
use crate::syntax::{Expr, FunctionDef};
use crate::{JitError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// First-parameter names accepted as the owning object
pub const CLASS_KEYWORDS: [&str; 2] = ["self", "cls"];

/// Name of the owner parameter of `def`
pub(crate) fn owner_param(def: &FunctionDef) -> Result<String> {
    match def.params.first() {
        Some(param) if CLASS_KEYWORDS.contains(&param.name.as_str()) => Ok(param.name.clone()),
        other => Err(JitError::UnrecognizedOwner {
            function: def.name.clone(),
            param: other.map(|p| p.name.clone()),
        }),
    }
}

/// Maximal attribute chains rooted at `owner`, in first-occurrence order
pub(crate) fn collect_chains(def: &FunctionDef, owner: &str) -> Vec<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut chains = Vec::new();
    def.visit_exprs(&mut |expr: &Expr| {
        if !matches!(expr, Expr::Attribute { .. }) {
            return true;
        }
        match expr.chain() {
            Some(chain) if chain[0] == owner => {
                if seen.insert(chain.clone()) {
                    chains.push(chain);
                }
                false
            }
            _ => true,
        }
    });
    chains
}

/// Whether the bare owner name is still referenced
pub(crate) fn uses_name(def: &FunctionDef, name: &str) -> bool {
    let mut found = false;
    def.visit_exprs(&mut |expr: &Expr| {
        if matches!(expr, Expr::Name(n) if n == name) {
            found = true;
        }
        !found
    });
    found
}

/// Terminal member a chain resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    State,
    Random,
    Constant,
    Callable,
}

#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    /// Consumed prefix of the chain, as written (`self.sub.w`)
    pub text: String,
    pub node: NodeId,
    pub attr: String,
    pub terminal: Terminal,
}

/// Walk `chain` (owner name first) from `owner` through child edges.
///
/// Child nodes passed on the way are recorded in `visited` by the chain
/// prefix that reached them. Cycles need no special casing: the walk is
/// bounded by the chain length and nodes are identified by id.
pub(crate) fn resolve_chain(
    graph: &ObjectGraph,
    owner: NodeId,
    chain: &[String],
    visited: &mut BTreeMap<String, NodeId>,
) -> Result<Resolved> {
    let mut node = owner;
    for (k, attr) in chain.iter().enumerate().skip(1) {
        let prefix = chain[..=k].join(".");
        let member = graph
            .member(node, attr)
            .map_err(|_| JitError::UnknownAttribute {
                owner: graph.name(owner).unwrap_or("?").to_string(),
                chain: prefix.clone(),
            })?;
        let terminal = match member {
            Member::Child(child) => {
                visited.insert(prefix, *child);
                node = *child;
                continue;
            }
            Member::State(_) => Terminal::State,
            Member::Random(_) => Terminal::Random,
            Member::Constant(_) => Terminal::Constant,
            Member::Method(_) | Member::Integrator(_) | Member::Native(_) => Terminal::Callable,
        };
        return Ok(Resolved {
            text: prefix,
            node,
            attr: attr.clone(),
            terminal,
        });
    }
    Err(JitError::ChainResolvesToObject {
        chain: chain.join("."),
    })
}

/// `<node name>_<attr>`
pub(crate) fn hoisted_name(graph: &ObjectGraph, node: NodeId, attr: &str) -> Result<String> {
    Ok(format!("{}_{attr}", graph.name(node)?))
}
