use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::MalformedGraphError;
use crate::security::{AuthorityLevel, AuthorizationError};

#[derive(Debug, Error)]
pub enum OraError {
    // Graph errors
    #[error(transparent)]
    MalformedGraph(#[from] MalformedGraphError),

    #[error("Workflow parse error: {0}")]
    WorkflowParse(String),

    // Security errors
    #[error("Authorization denied: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Escalation to {target} denied: {reason}")]
    EscalationDenied {
        target: AuthorityLevel,
        reason: String,
    },

    #[error("Escalation to {target} timed out after {timeout_secs}s")]
    EscalationTimeout {
        target: AuthorityLevel,
        timeout_secs: u64,
    },

    // Capability errors
    #[error("Capability failed: {0}")]
    Capability(#[from] CapabilityError),

    // Agent errors
    #[error("Agent {agent} exceeded token budget: {token_burn:.4} > {budget:.4}")]
    BudgetExceeded {
        agent: String,
        token_burn: f64,
        budget: f64,
    },

    // Execution errors
    #[error("Merge {node} cannot reach quorum: {succeeded}/{required} inbound branches succeeded")]
    QuorumUnreachable {
        node: String,
        succeeded: usize,
        required: usize,
    },

    #[error("Run exceeded dispatch limit ({0})")]
    IterationLimitExceeded(u32),

    #[error("Run {0} ended without a report")]
    RunAborted(String),

    #[error("Snapshot is for graph {found}, not {expected}")]
    SnapshotMismatch { expected: String, found: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Agent not found in run {run}: {agent}")]
    AgentNotFound { run: String, agent: String },

    #[error("Node not found in run {run}: {node}")]
    NodeNotFound { run: String, node: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OraError>;

/// Opaque failure reported by an agent or tool capability.
///
/// The engine records these verbatim and never retries them.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("{message}")]
    Failed { message: String },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("invocation timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}
