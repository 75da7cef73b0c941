use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CapabilityError;
use crate::graph::Branch;
use crate::security::{AuthorityLevel, AuthorizationError, EscalationRequest};

/// Run-scoped variable bindings. Ordered so snapshots serialize deterministically.
pub type Bindings = BTreeMap<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique agent instance identifier. Never reused across runs.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new() -> Self {
        Self(format!("agt_{}", &Uuid::new_v4().simple().to_string()[..12]))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Killed,
}

impl AgentStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Killed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Why a node ended up failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeFailure {
    /// The security gate refused the dispatch.
    Denied { error: AuthorizationError },
    /// The capability reported a failure.
    Capability { error: CapabilityError },
    /// The agent burned past its token budget.
    BudgetExceeded { token_burn: f64, budget: f64 },
    /// The agent was killed by an operator.
    Killed,
    /// A merge could not collect enough successful inputs.
    QuorumUnreachable { succeeded: usize, required: usize },
    /// Dispatching this node would have exceeded the run's ceiling.
    IterationLimitExceeded { limit: u32 },
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { error } => write!(f, "denied: {}", error),
            Self::Capability { error } => write!(f, "capability error: {}", error),
            Self::BudgetExceeded { token_burn, budget } => {
                write!(f, "budget exceeded: {:.4} > {:.4}", token_burn, budget)
            }
            Self::Killed => write!(f, "agent killed"),
            Self::QuorumUnreachable {
                succeeded,
                required,
            } => write!(f, "quorum unreachable: {}/{}", succeeded, required),
            Self::IterationLimitExceeded { limit } => {
                write!(f, "dispatch limit {} exceeded", limit)
            }
        }
    }
}

/// Status of a single node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Paused,
    Succeeded,
    Failed { reason: NodeFailure },
    /// Never dispatched because an upstream dependency failed.
    Blocked { upstream: String },
    /// Never dispatched because its branch was not taken.
    Pruned,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::Failed { .. }
                | Self::Blocked { .. }
                | Self::Pruned
                | Self::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Blocked { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Pruned => "pruned",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed ({})", reason),
            Self::Blocked { upstream } => write!(f, "blocked (upstream {})", upstream),
            other => f.write_str(other.label()),
        }
    }
}

/// Why a run failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    IterationLimitExceeded { limit: u32 },
    QuorumUnreachable { node: String },
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationLimitExceeded { limit } => {
                write!(f, "dispatch limit {} exceeded", limit)
            }
            Self::QuorumUnreachable { node } => write!(f, "merge {} unreachable", node),
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyFailed,
    Failed { reason: RunFailure },
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::PartiallyFailed => f.write_str("partially failed"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Run accepted and about to start dispatching.
    RunStarted { run_id: RunId, graph_id: String },
    /// A node changed status.
    NodeStatusChanged {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
    },
    /// A condition node selected a branch.
    BranchSelected {
        run_id: RunId,
        node_id: String,
        branch: Branch,
    },
    /// A back edge fired and the loop body was reset.
    NodeReentered {
        run_id: RunId,
        node_id: String,
        dispatches: u32,
    },
    /// An agent changed lifecycle state.
    AgentStatusChanged {
        run_id: RunId,
        agent_id: AgentId,
        node_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    /// An agent reported progress.
    AgentProgress {
        run_id: RunId,
        agent_id: AgentId,
        progress: u8,
        token_burn: f64,
    },
    /// An agent burned through its budget.
    BudgetExceeded {
        run_id: RunId,
        agent_id: AgentId,
        token_burn: f64,
        budget: f64,
    },
    /// The gate allowed a dispatch.
    AuthorizationGranted {
        run_id: RunId,
        node_id: String,
        level: AuthorityLevel,
    },
    /// The gate denied a dispatch.
    AuthorizationDenied {
        run_id: RunId,
        node_id: String,
        error: AuthorizationError,
    },
    /// Escalation requested and waiting for an external decision.
    EscalationRequested { request: EscalationRequest },
    /// Escalation decision recorded.
    EscalationResolved { request_id: String, approved: bool },
    /// The run's authority context was replaced.
    AuthorityEscalated {
        run_id: RunId,
        from: AuthorityLevel,
        to: AuthorityLevel,
    },
    /// Cancellation requested for the run.
    RunCancelled { run_id: RunId },
    /// Run finished.
    RunCompleted {
        run_id: RunId,
        outcome: RunOutcome,
        dispatches: u32,
    },
}

impl EngineEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStatusChanged { run_id, .. }
            | Self::BranchSelected { run_id, .. }
            | Self::NodeReentered { run_id, .. }
            | Self::AgentStatusChanged { run_id, .. }
            | Self::AgentProgress { run_id, .. }
            | Self::BudgetExceeded { run_id, .. }
            | Self::AuthorizationGranted { run_id, .. }
            | Self::AuthorizationDenied { run_id, .. }
            | Self::AuthorityEscalated { run_id, .. }
            | Self::RunCancelled { run_id }
            | Self::RunCompleted { run_id, .. } => Some(run_id),
            Self::EscalationRequested { request } => Some(&request.run_id),
            Self::EscalationResolved { .. } => None,
        }
    }
}
