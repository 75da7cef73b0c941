use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CapabilityError;
use crate::graph::NodeConfig;
use crate::security::{GateSnapshot, VaultStatus};
use crate::types::{AgentId, Bindings, RunId};

/// One capability call issued by an agent or tool node.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub run_id: RunId,
    pub node_id: String,
    /// Present for agent nodes only.
    pub agent_id: Option<AgentId>,
    pub config: NodeConfig,
    /// Copy of the run's variables at dispatch time.
    pub bindings: Bindings,
}

/// Successful capability result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    #[serde(default)]
    pub output: serde_json::Value,
    /// Merged into the run's variables.
    #[serde(default)]
    pub bindings: Bindings,
}

impl CapabilityOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            bindings: Bindings::new(),
        }
    }

    pub fn bind(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.bindings.insert(key.into(), value);
        self
    }
}

/// Progress report from a running invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressTick {
    pub node_id: String,
    /// Identifies the dispatch so stale ticks from a reset node are dropped.
    pub attempt: u32,
    pub progress: u8,
    /// Incremental token spend in USD since the last tick.
    pub token_burn: f64,
}

/// Handle a capability uses to report progress and spend.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    node_id: String,
    attempt: u32,
    tx: mpsc::UnboundedSender<ProgressTick>,
}

impl ProgressReporter {
    pub fn new(node_id: impl Into<String>, attempt: u32, tx: mpsc::UnboundedSender<ProgressTick>) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            tx,
        }
    }

    /// Report progress (clamped to 100) and the token spend since the last report.
    pub fn report(&self, progress: u8, token_burn: f64) {
        let _ = self.tx.send(ProgressTick {
            node_id: self.node_id.clone(),
            attempt: self.attempt,
            progress: progress.min(100),
            token_burn,
        });
    }
}

/// Per-invocation context handed to a capability.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Cancelled on kill, cancel, budget overrun, or loop reset.
    pub cancel: CancellationToken,
    pub progress: Option<ProgressReporter>,
}

impl InvocationContext {
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn report(&self, progress: u8, token_burn: f64) {
        if let Some(reporter) = &self.progress {
            reporter.report(progress, token_burn);
        }
    }
}

/// Opaque external work performed by agent and tool nodes.
pub trait Capability: Send + Sync + 'static {
    /// Capability name, for logging.
    fn name(&self) -> &str {
        "capability"
    }

    /// Perform one invocation. Implementations should observe `ctx.cancel`.
    fn invoke(
        &self,
        invocation: Invocation,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<CapabilityOutput, CapabilityError>>;
}

/// Read-only view of vault and gate state.
pub trait SecurityProvider: Send + Sync + 'static {
    fn current_vault_status(&self) -> VaultStatus;

    fn current_gate_snapshot(&self) -> GateSnapshot;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_clamps_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new("n1", 2, tx);
        reporter.report(250, 0.01);
        let tick = rx.try_recv().unwrap();
        assert_eq!(tick.progress, 100);
        assert_eq!(tick.attempt, 2);
        assert_eq!(tick.node_id, "n1");
    }

    #[test]
    fn detached_context_drops_reports() {
        let ctx = InvocationContext::detached();
        ctx.report(50, 1.0);
        assert!(!ctx.cancel.is_cancelled());
    }

    #[test]
    fn output_builder() {
        let out = CapabilityOutput::new(serde_json::json!("ok")).bind("tests_pass", true.into());
        assert_eq!(out.bindings["tests_pass"], serde_json::json!(true));
    }
}
