//! Workflow graph model.
//!
//! A workflow is a directed graph of agent, tool, condition and merge nodes.
//! [`Graph`] is the raw, deserializable definition; [`validate`] checks it and
//! produces a [`ValidGraph`] with precomputed adjacency, classified back edges
//! and parsed predicates. The engine only ever runs a `ValidGraph`.

pub mod edge;
pub mod node;
pub mod predicate;
pub mod registry;
pub mod validate;

pub use edge::{Branch, Edge};
pub use node::{AgentConfig, ConditionConfig, MergeConfig, Node, NodeConfig, NodeKind, Quorum, ToolConfig};
pub use predicate::{is_truthy, Predicate, PredicateError};
pub use registry::{action_for, ToolSpec};
pub use validate::{validate, Graph, GraphViolation, MalformedGraphError, ValidGraph};
