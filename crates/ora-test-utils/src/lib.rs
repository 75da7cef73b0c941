//! Test doubles and fixtures shared by the Ora crates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use ora_core::error::CapabilityError;
use ora_core::graph::{Branch, Edge, Graph, Node, Quorum};
use ora_core::security::{GateSnapshot, SecurityMonitor, VaultStatus};
use ora_core::traits::{Capability, CapabilityOutput, Invocation, InvocationContext};
use ora_core::types::{EngineEvent, RunId};

/// What a scripted invocation does.
#[derive(Debug, Clone)]
pub struct Script {
    outcome: Result<CapabilityOutput, CapabilityError>,
    delay: Duration,
    ticks: Vec<(u8, f64)>,
    hang: bool,
    panic: bool,
}

impl Script {
    pub fn ok() -> Self {
        Self {
            outcome: Ok(CapabilityOutput::default()),
            delay: Duration::ZERO,
            ticks: Vec::new(),
            hang: false,
            panic: false,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            outcome: Err(CapabilityError::failed(message)),
            ..Self::ok()
        }
    }

    /// Bind a variable on success.
    pub fn bind(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Ok(output) = &mut self.outcome {
            output.bindings.insert(key.to_string(), value);
        }
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Report progress and spend before finishing.
    pub fn tick(mut self, progress: u8, token_burn: f64) -> Self {
        self.ticks.push((progress, token_burn));
        self
    }

    /// Never finish on its own; only cancellation ends the invocation.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn panics(mut self) -> Self {
        self.panic = true;
        self
    }
}

/// A capability whose behaviour is scripted per node.
///
/// Each node has a queue of scripts; the last one repeats. Nodes without a
/// script succeed immediately.
#[derive(Default)]
pub struct ScriptedCapability {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, node_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(node_id.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn next_script(&self, node_id: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        match scripts.get_mut(node_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(Script::ok),
            Some(queue) => queue.front().cloned().unwrap_or_else(Script::ok),
            None => Script::ok(),
        }
    }

    /// Node ids in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|i| i.node_id.clone())
            .collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, node_id: &str) -> usize {
        self.calls().iter().filter(|n| *n == node_id).count()
    }
}

impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        "scripted"
    }

    fn invoke(
        &self,
        invocation: Invocation,
        ctx: InvocationContext,
    ) -> BoxFuture<'_, Result<CapabilityOutput, CapabilityError>> {
        let script = self.next_script(&invocation.node_id);
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(invocation);

        Box::pin(async move {
            if script.panic {
                panic!("scripted panic");
            }
            for (progress, burn) in &script.ticks {
                ctx.report(*progress, *burn);
                tokio::task::yield_now().await;
            }
            if script.hang {
                ctx.cancel.cancelled().await;
                return Err(CapabilityError::Cancelled);
            }
            if !script.delay.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(CapabilityError::Cancelled),
                    _ = tokio::time::sleep(script.delay) => {}
                }
            }
            script.outcome
        })
    }
}

/// Security monitor with all gates secure and the vault unlocked.
pub fn open_security() -> Arc<SecurityMonitor> {
    Arc::new(SecurityMonitor::new(
        GateSnapshot::all_secure(),
        VaultStatus::unlocked(),
    ))
}

/// Security monitor with all gates secure and the vault locked.
pub fn locked_security() -> Arc<SecurityMonitor> {
    Arc::new(SecurityMonitor::default())
}

/// `a → b → c`, all tools.
pub fn linear_graph() -> Graph {
    Graph::new("linear")
        .node(Node::tool("a", "filesystem.read"))
        .node(Node::tool("b", "filesystem.write"))
        .node(Node::tool("c", "filesystem.list"))
        .edge(Edge::new("a", "b"))
        .edge(Edge::new("b", "c"))
}

/// `build → test → check(tests_pass)`: yes → `audit` → `consensus`,
/// no → `consensus` (quorum 1).
pub fn review_graph() -> Graph {
    Graph::new("review")
        .node(Node::agent("build", "builder", "implement the change"))
        .node(Node::tool("test", "terminal.execute").with_args(serde_json::json!({"cmd": "cargo test"})))
        .node(Node::condition("check", "tests_pass"))
        .node(Node::agent("audit", "planner", "review the diff"))
        .node(Node::merge("consensus", Quorum::AtLeast(1)))
        .edge(Edge::new("build", "test"))
        .edge(Edge::new("test", "check"))
        .edge(Edge::branch("check", "audit", Branch::Yes))
        .edge(Edge::branch("check", "consensus", Branch::No))
        .edge(Edge::new("audit", "consensus"))
}

/// `start` fans out to `w1`, `w2`, `w3`, joined by `join` with the given quorum.
pub fn fan_out_graph(quorum: Quorum) -> Graph {
    Graph::new("fan-out")
        .node(Node::tool("start", "filesystem.read"))
        .node(Node::agent("w1", "planner", "one"))
        .node(Node::agent("w2", "planner", "two"))
        .node(Node::agent("w3", "planner", "three"))
        .node(Node::merge("join", quorum))
        .edge(Edge::new("start", "w1"))
        .edge(Edge::new("start", "w2"))
        .edge(Edge::new("start", "w3"))
        .edge(Edge::new("w1", "join"))
        .edge(Edge::new("w2", "join"))
        .edge(Edge::new("w3", "join"))
}

/// `build → check(done)`: no loops back to `build`, yes → `ship`.
pub fn retry_loop_graph() -> Graph {
    Graph::new("loop")
        .node(Node::agent("build", "builder", "try again"))
        .node(Node::condition("check", "done"))
        .node(Node::tool("ship", "filesystem.write"))
        .edge(Edge::new("build", "check"))
        .edge(Edge::branch("check", "build", Branch::No))
        .edge(Edge::branch("check", "ship", Branch::Yes))
        .entry("build")
}

/// Wait for the first event matching `pred`, failing after a generous timeout.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait for a node of `run` to reach a status with the given label.
pub async fn wait_for_status(
    rx: &mut broadcast::Receiver<EngineEvent>,
    run: &RunId,
    node: &str,
    label: &str,
) -> EngineEvent {
    wait_for_event(rx, |e| {
        matches!(e, EngineEvent::NodeStatusChanged { run_id, node_id, status }
            if run_id == run && node_id == node && status.label() == label)
    })
    .await
}
