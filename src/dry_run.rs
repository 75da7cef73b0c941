use futures::future::BoxFuture;
use tracing::debug;

use ora_core::error::CapabilityError;
use ora_core::graph::NodeConfig;
use ora_core::traits::{Capability, CapabilityOutput, Invocation, InvocationContext};

/// Capability that performs nothing and succeeds every invocation.
///
/// Lets `ora run` exercise scheduling, authorization, and auditing of a
/// workflow without real agents or tools behind it.
pub struct DryRunCapability;

impl Capability for DryRunCapability {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn invoke(
        &self,
        invocation: Invocation,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<CapabilityOutput, CapabilityError>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(CapabilityError::Cancelled);
            }
            let target = match &invocation.config {
                NodeConfig::Agent(cfg) => format!("agent:{}", cfg.agent_type),
                NodeConfig::Tool(cfg) => format!("tool:{}", cfg.tool_id),
                other => format!("{:?}", other),
            };
            debug!(run_id = %invocation.run_id, node_id = %invocation.node_id, %target, "Dry-run invocation");
            ctx.report(100, 0.0);
            Ok(CapabilityOutput::new(serde_json::json!({
                "dry_run": true,
                "node": invocation.node_id,
                "target": target,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ora_core::graph::Node;
    use ora_core::types::RunId;

    #[tokio::test]
    async fn succeeds_without_side_effects() {
        let invocation = Invocation {
            run_id: RunId::from_string("r"),
            node_id: "push".into(),
            agent_id: None,
            config: Node::tool("push", "git.push").config,
            bindings: Default::default(),
        };
        let out = DryRunCapability
            .invoke(invocation, InvocationContext::detached())
            .await
            .unwrap();
        assert_eq!(out.output["target"], "tool:git.push");
        assert!(out.bindings.is_empty());
    }

    #[tokio::test]
    async fn honours_cancellation() {
        let ctx = InvocationContext::detached();
        ctx.cancel.cancel();
        let invocation = Invocation {
            run_id: RunId::from_string("r"),
            node_id: "a".into(),
            agent_id: None,
            config: Node::agent("a", "planner", "plan").config,
            bindings: Default::default(),
        };
        assert_eq!(
            DryRunCapability.invoke(invocation, ctx).await,
            Err(CapabilityError::Cancelled)
        );
    }
}
