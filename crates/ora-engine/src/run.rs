//! Per-run node state and the readiness rules that drive scheduling.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ora_core::graph::{Branch, Edge, NodeConfig, Quorum, ValidGraph};
use ora_core::security::AuthorityContext;
use ora_core::types::{Bindings, NodeStatus, RunFailure, RunId, RunOutcome};

/// Durable per-node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    /// Selected branch, for resolved condition nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
    /// Activations of this node in the run, across loop iterations.
    #[serde(default)]
    pub dispatches: u32,
}

impl NodeState {
    fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            branch: None,
            dispatches: 0,
        }
    }
}

/// State of a forward edge, derived from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Fired,
    /// Source pruned, or a condition that selected the other branch.
    DeadPruned,
    /// Source failed, was blocked, or was cancelled.
    DeadFailed,
    Pending,
}

/// What should happen to a pending node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Wait,
    Ready,
    Blocked { upstream: String },
    Pruned,
    QuorumMet,
    QuorumUnreachable { succeeded: usize, required: usize },
}

/// Minimal persisted state needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub graph_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub nodes: BTreeMap<String, NodeState>,
    pub bindings: Bindings,
    pub authority: AuthorityContext,
    pub dispatches: u32,
    pub taken_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.status.clone()))
            .collect()
    }
}

/// Node statuses, bindings and counters for one run. Only the run's actor
/// mutates this.
#[derive(Debug, Clone)]
pub struct RunState {
    graph: Arc<ValidGraph>,
    nodes: BTreeMap<String, NodeState>,
    pub bindings: Bindings,
    pub dispatches: u32,
    pub failure: Option<RunFailure>,
    pub cancelled: bool,
}

impl RunState {
    pub fn new(graph: Arc<ValidGraph>, bindings: Bindings) -> Self {
        let nodes = graph
            .nodes()
            .map(|n| (n.id.clone(), NodeState::pending()))
            .collect();
        Self {
            graph,
            nodes,
            bindings,
            dispatches: 0,
            failure: None,
            cancelled: false,
        }
    }

    /// Rebuild from a snapshot. Succeeded and pruned nodes keep their state;
    /// everything else starts over as pending.
    pub fn resume(graph: Arc<ValidGraph>, snapshot: &RunSnapshot) -> Self {
        let mut state = Self::new(graph, snapshot.bindings.clone());
        for (id, saved) in &snapshot.nodes {
            let Some(node) = state.nodes.get_mut(id) else { continue };
            node.dispatches = saved.dispatches;
            if matches!(saved.status, NodeStatus::Succeeded | NodeStatus::Pruned) {
                node.status = saved.status.clone();
                node.branch = saved.branch;
            }
        }
        state
    }

    pub fn graph(&self) -> &Arc<ValidGraph> {
        &self.graph
    }

    pub fn status(&self, id: &str) -> Option<&NodeStatus> {
        self.nodes.get(id).map(|n| &n.status)
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    /// Set a node's status. Returns false if unchanged or unknown.
    pub fn set_status(&mut self, id: &str, status: NodeStatus) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.status != status => {
                node.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn set_branch(&mut self, id: &str, branch: Option<Branch>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.branch = branch;
        }
    }

    /// Count one activation of `id`.
    pub fn count_dispatch(&mut self, id: &str) {
        self.dispatches += 1;
        if let Some(node) = self.nodes.get_mut(id) {
            node.dispatches += 1;
        }
    }

    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.status.clone()))
            .collect()
    }

    pub fn ids_with(&self, pred: impl Fn(&NodeStatus) -> bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| pred(&n.status))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn edge_state(&self, edge: &Edge) -> EdgeState {
        let Some(source) = self.nodes.get(&edge.from) else {
            return EdgeState::Pending;
        };
        match &source.status {
            NodeStatus::Succeeded => {
                let is_condition = self
                    .graph
                    .node(&edge.from)
                    .is_some_and(|n| matches!(n.config, NodeConfig::Condition(_)));
                if is_condition && edge.branch_label() != source.branch {
                    EdgeState::DeadPruned
                } else {
                    EdgeState::Fired
                }
            }
            NodeStatus::Pruned => EdgeState::DeadPruned,
            NodeStatus::Failed { .. } | NodeStatus::Blocked { .. } | NodeStatus::Cancelled => {
                EdgeState::DeadFailed
            }
            _ => EdgeState::Pending,
        }
    }

    /// Apply the join rules to a node using its forward inbound edges.
    pub fn readiness(&self, id: &str) -> Readiness {
        let Some(node) = self.graph.node(id) else {
            return Readiness::Wait;
        };
        let inbound: Vec<&Edge> = self.graph.forward_in(id).collect();

        if let NodeConfig::Merge(cfg) = &node.config {
            return self.merge_readiness(id, cfg.quorum);
        }

        if inbound.is_empty() {
            return Readiness::Ready;
        }
        let states: Vec<(EdgeState, &Edge)> =
            inbound.iter().map(|e| (self.edge_state(e), *e)).collect();

        if states.iter().any(|(s, _)| *s == EdgeState::Pending) {
            return Readiness::Wait;
        }
        if let Some((_, edge)) = states.iter().find(|(s, _)| *s == EdgeState::DeadFailed) {
            return Readiness::Blocked {
                upstream: edge.from.clone(),
            };
        }
        if states.iter().any(|(s, _)| *s == EdgeState::Fired) {
            return Readiness::Ready;
        }
        Readiness::Pruned
    }

    fn merge_readiness(&self, id: &str, quorum: Quorum) -> Readiness {
        // Collapse to one state per distinct source
        let mut by_source: BTreeMap<&str, EdgeState> = BTreeMap::new();
        for edge in self.graph.forward_in(id) {
            let state = self.edge_state(edge);
            by_source
                .entry(edge.from.as_str())
                .and_modify(|s| {
                    if state == EdgeState::Fired || *s == EdgeState::Pending {
                        *s = state;
                    }
                })
                .or_insert(state);
        }

        let total = by_source.len();
        let pruned = by_source.values().filter(|s| **s == EdgeState::DeadPruned).count();
        let fired = by_source.values().filter(|s| **s == EdgeState::Fired).count();
        let pending = by_source.values().any(|s| *s == EdgeState::Pending);

        if pruned == total {
            return Readiness::Pruned;
        }
        let required = match quorum {
            Quorum::All => total - pruned,
            Quorum::AtLeast(n) => n,
        };
        if fired >= required {
            return Readiness::QuorumMet;
        }
        if pending {
            return Readiness::Wait;
        }
        Readiness::QuorumUnreachable {
            succeeded: fired,
            required,
        }
    }

    /// Targets of forward edges leaving `id`, deduplicated.
    pub fn successors(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for edge in self.graph.forward_out(id) {
            if !out.contains(&edge.to) {
                out.push(edge.to.clone());
            }
        }
        out
    }

    /// Back edges leaving `id` that fire now. Only meaningful once `id` succeeded.
    pub fn firing_back_edges(&self, id: &str) -> Vec<String> {
        self.graph
            .back_out(id)
            .filter(|e| self.edge_state(e) == EdgeState::Fired)
            .map(|e| e.to.clone())
            .collect()
    }

    /// Reset the nodes in `region` to pending. Returns those that changed.
    pub fn reset(&mut self, region: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut changed = Vec::new();
        for id in region {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.branch = None;
                if node.status != NodeStatus::Pending {
                    node.status = NodeStatus::Pending;
                    changed.push(id);
                }
            }
        }
        changed
    }

    /// True once nothing is queued, running or paused.
    pub fn is_quiescent(&self) -> bool {
        !self.nodes.values().any(|n| {
            matches!(
                n.status,
                NodeStatus::Ready | NodeStatus::Running | NodeStatus::Paused
            )
        })
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            return RunOutcome::Cancelled;
        }
        if let Some(reason) = &self.failure {
            return RunOutcome::Failed {
                reason: reason.clone(),
            };
        }
        if self.nodes.values().any(|n| n.status.is_failure()) {
            RunOutcome::PartiallyFailed
        } else {
            RunOutcome::Succeeded
        }
    }

    pub fn snapshot(&self, run_id: &RunId, authority: &AuthorityContext, outcome: Option<RunOutcome>) -> RunSnapshot {
        RunSnapshot {
            run_id: run_id.clone(),
            graph_id: self.graph.id().to_string(),
            outcome,
            nodes: self.nodes.clone(),
            bindings: self.bindings.clone(),
            authority: authority.clone(),
            dispatches: self.dispatches,
            taken_at: Utc::now(),
        }
    }
}
