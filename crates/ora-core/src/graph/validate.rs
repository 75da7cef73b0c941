use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{OraError, Result};

use super::edge::{Branch, Edge};
use super::node::{Node, NodeConfig, Quorum};
use super::predicate::Predicate;
use super::registry;

/// A workflow definition as written by its author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Explicit entry nodes. Empty means every node without inbound edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            entry: vec![],
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry.push(id.into());
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| OraError::WorkflowParse(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| OraError::WorkflowParse(e.to_string()))
    }

    /// Load a workflow file. `.json` files parse as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }
}

/// One structural problem in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphViolation {
    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("duplicate node id '{id}'")]
    DuplicateNode { id: String },

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("edge {from} -> {to} has label '{label}', expected yes or no")]
    InvalidLabel {
        from: String,
        to: String,
        label: String,
    },

    #[error("edge {from} -> {to} is labeled '{label}' but {from} is not a condition")]
    UnexpectedLabel {
        from: String,
        to: String,
        label: String,
    },

    #[error("condition '{node}' needs exactly one yes and one no edge (found [{}])", .found.join(", "))]
    ConditionBranches { node: String, found: Vec<String> },

    #[error("merge '{node}' needs at least 2 inbound edges (found {inbound})")]
    MergeInbound { node: String, inbound: usize },

    #[error("merge '{node}' quorum {quorum} is outside 1..={inbound}")]
    QuorumOutOfRange {
        node: String,
        quorum: usize,
        inbound: usize,
    },

    #[error("node '{node}' uses unknown tool '{tool_id}'")]
    UnknownTool { node: String, tool_id: String },

    #[error("node '{node}' uses unknown agent type '{agent_type}'")]
    UnknownAgentType { node: String, agent_type: String },

    #[error("condition '{node}': {message}")]
    InvalidPredicate { node: String, message: String },

    #[error("entry '{id}' is not a node")]
    UnknownEntry { id: String },

    #[error("graph has no entry node")]
    NoEntry,

    #[error("node '{node}' is unreachable from the entry set")]
    Unreachable { node: String },
}

/// Every violation found in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("malformed graph: {}", join_violations(.violations))]
pub struct MalformedGraphError {
    pub violations: Vec<GraphViolation>,
}

fn join_violations(violations: &[GraphViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A graph that passed validation, with precomputed adjacency.
///
/// Forward edges define join semantics. Back edges close a cycle and re-enter
/// their target when they fire.
#[derive(Debug, Clone)]
pub struct ValidGraph {
    graph: Graph,
    index: HashMap<String, usize>,
    entries: Vec<String>,
    back: Vec<bool>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    predicates: HashMap<String, Predicate>,
}

/// Check a graph, reporting every violation found.
pub fn validate(graph: &Graph) -> std::result::Result<ValidGraph, MalformedGraphError> {
    if graph.nodes.is_empty() {
        return Err(MalformedGraphError {
            violations: vec![GraphViolation::EmptyGraph],
        });
    }

    let mut violations = Vec::new();

    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        if index.contains_key(&node.id) {
            violations.push(GraphViolation::DuplicateNode {
                id: node.id.clone(),
            });
        } else {
            index.insert(node.id.clone(), i);
        }
    }

    let n = graph.nodes.len();
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut edge_ends: Vec<Option<(usize, usize)>> = Vec::with_capacity(graph.edges.len());

    for (ei, edge) in graph.edges.iter().enumerate() {
        let from = index.get(&edge.from).copied();
        let to = index.get(&edge.to).copied();
        for (end, id) in [(from, &edge.from), (to, &edge.to)] {
            if end.is_none() {
                violations.push(GraphViolation::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: id.clone(),
                });
            }
        }
        match (from, to) {
            (Some(f), Some(t)) => {
                outgoing[f].push(ei);
                incoming[t].push(ei);
                edge_ends.push(Some((f, t)));
            }
            _ => edge_ends.push(None),
        }

        let Some(f) = from else { continue };
        let is_condition = matches!(graph.nodes[f].config, NodeConfig::Condition(_));
        match (&edge.label, is_condition) {
            (Some(label), true) if Branch::parse(label).is_none() => {
                violations.push(GraphViolation::InvalidLabel {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    label: label.clone(),
                });
            }
            (Some(label), false) => {
                violations.push(GraphViolation::UnexpectedLabel {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    label: label.clone(),
                });
            }
            _ => {}
        }
    }

    let mut predicates = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        if index.get(&node.id) != Some(&i) {
            continue;
        }
        match &node.config {
            NodeConfig::Condition(cfg) => {
                let branches: Vec<Option<Branch>> = outgoing[i]
                    .iter()
                    .map(|&ei| graph.edges[ei].branch_label())
                    .collect();
                let has = |b: Branch| branches.iter().filter(|x| **x == Some(b)).count() == 1;
                if branches.len() != 2 || !has(Branch::Yes) || !has(Branch::No) {
                    violations.push(GraphViolation::ConditionBranches {
                        node: node.id.clone(),
                        found: outgoing[i]
                            .iter()
                            .map(|&ei| {
                                graph.edges[ei]
                                    .label
                                    .clone()
                                    .unwrap_or_else(|| "<unlabeled>".to_string())
                            })
                            .collect(),
                    });
                }
                match Predicate::parse(&cfg.predicate) {
                    Ok(p) => {
                        predicates.insert(node.id.clone(), p);
                    }
                    Err(e) => violations.push(GraphViolation::InvalidPredicate {
                        node: node.id.clone(),
                        message: e.to_string(),
                    }),
                }
            }
            NodeConfig::Tool(cfg) => {
                if registry::tool(&cfg.tool_id).is_none() {
                    violations.push(GraphViolation::UnknownTool {
                        node: node.id.clone(),
                        tool_id: cfg.tool_id.clone(),
                    });
                }
            }
            NodeConfig::Agent(cfg) => {
                if registry::agent_permissions(&cfg.agent_type).is_none() {
                    violations.push(GraphViolation::UnknownAgentType {
                        node: node.id.clone(),
                        agent_type: cfg.agent_type.clone(),
                    });
                }
            }
            NodeConfig::Merge(_) => {}
        }
    }

    // Entry set
    let mut entries: Vec<usize> = Vec::new();
    if graph.entry.is_empty() {
        entries.extend((0..n).filter(|&i| index.get(&graph.nodes[i].id) == Some(&i) && incoming[i].is_empty()));
    } else {
        for id in &graph.entry {
            match index.get(id) {
                Some(&i) if !entries.contains(&i) => entries.push(i),
                Some(_) => {}
                None => violations.push(GraphViolation::UnknownEntry { id: id.clone() }),
            }
        }
    }
    if entries.is_empty() {
        violations.push(GraphViolation::NoEntry);
    }

    // Depth-first from the entries, in declaration order. An edge into a node
    // still on the stack closes a cycle.
    let mut back = vec![false; graph.edges.len()];
    let mut color = vec![0u8; n];
    for &entry in &entries {
        if color[entry] != 0 {
            continue;
        }
        color[entry] = 1;
        let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            if pos < outgoing[node].len() {
                top.1 += 1;
                let ei = outgoing[node][pos];
                let Some((_, target)) = edge_ends[ei] else { continue };
                match color[target] {
                    0 => {
                        color[target] = 1;
                        stack.push((target, 0));
                    }
                    1 => back[ei] = true,
                    _ => {}
                }
            } else {
                color[node] = 2;
                stack.pop();
            }
        }
    }

    for (i, node) in graph.nodes.iter().enumerate() {
        if color[i] == 0 && index.get(&node.id) == Some(&i) && !entries.is_empty() {
            violations.push(GraphViolation::Unreachable {
                node: node.id.clone(),
            });
        }
    }

    // Merge arity is measured on forward edges from distinct sources.
    for (i, node) in graph.nodes.iter().enumerate() {
        let NodeConfig::Merge(cfg) = &node.config else { continue };
        if index.get(&node.id) != Some(&i) {
            continue;
        }
        let sources: HashSet<&str> = incoming[i]
            .iter()
            .filter(|&&ei| !back[ei])
            .map(|&ei| graph.edges[ei].from.as_str())
            .collect();
        let inbound = sources.len();
        if inbound < 2 {
            violations.push(GraphViolation::MergeInbound {
                node: node.id.clone(),
                inbound,
            });
        } else if let Quorum::AtLeast(q) = cfg.quorum {
            if q == 0 || q > inbound {
                violations.push(GraphViolation::QuorumOutOfRange {
                    node: node.id.clone(),
                    quorum: q,
                    inbound,
                });
            }
        }
    }

    if !violations.is_empty() {
        return Err(MalformedGraphError { violations });
    }

    Ok(ValidGraph {
        graph: graph.clone(),
        entries: entries.iter().map(|&i| graph.nodes[i].id.clone()).collect(),
        index,
        back,
        outgoing,
        incoming,
        predicates,
    })
}

impl ValidGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn id(&self) -> &str {
        &self.graph.id
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.nodes.iter()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.idx(id).map(|i| &self.graph.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn predicate(&self, id: &str) -> Option<&Predicate> {
        self.predicates.get(id)
    }

    fn idx(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn select<'a>(&'a self, list: Option<&'a Vec<usize>>, back: bool) -> impl Iterator<Item = &'a Edge> + 'a {
        list.into_iter()
            .flatten()
            .filter(move |&&ei| self.back[ei] == back)
            .map(move |&ei| &self.graph.edges[ei])
    }

    pub fn forward_in(&self, id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.select(self.idx(id).map(|i| &self.incoming[i]), false)
    }

    pub fn forward_out(&self, id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.select(self.idx(id).map(|i| &self.outgoing[i]), false)
    }

    pub fn back_out(&self, id: &str) -> impl Iterator<Item = &Edge> + '_ {
        self.select(self.idx(id).map(|i| &self.outgoing[i]), true)
    }

    pub fn back_edges(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.graph
            .edges
            .iter()
            .zip(&self.back)
            .filter(|(_, b)| **b)
            .map(|(e, _)| e)
    }

    /// `id` plus everything reachable from it over forward edges.
    pub fn forward_reachable(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !self.contains(&current) || !seen.insert(current.clone()) {
                continue;
            }
            for edge in self.forward_out(&current) {
                stack.push(edge.to.clone());
            }
        }
        seen
    }

    /// No outgoing edges at all.
    pub fn is_sink(&self, id: &str) -> bool {
        self.idx(id).is_some_and(|i| self.outgoing[i].is_empty())
    }
}
