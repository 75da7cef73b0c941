use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use ora_core::config::AppConfig;
use ora_core::error::{OraError, Result};
use ora_core::event::EventBus;
use ora_core::graph::{validate, Graph};
use ora_core::security::{permission, AuthorityContext, AuthorityLevel, EscalationDecision, EscalationRequest};
use ora_core::traits::{Capability, SecurityProvider};
use ora_core::types::{AgentId, Bindings, EngineEvent, NodeStatus, RunId};

use crate::agent::AgentSnapshot;
use crate::approval::EscalationBroker;
use crate::executor::{Control, RunActor, RunCommand, RunDeps, RunReport, RunView, SharedAuthority};
use crate::gate::AuthorityGate;
use crate::run::{RunSnapshot, RunState};
use crate::snapshot::SnapshotStore;

struct RunHandle {
    /// `None` once the actor has exited.
    commands: Option<mpsc::UnboundedSender<RunCommand>>,
    view: watch::Receiver<RunView>,
    authority: Arc<SharedAuthority>,
}

/// Live runs plus the most recently finished ones, oldest first.
#[derive(Default)]
struct RunTable {
    handles: HashMap<RunId, RunHandle>,
    finished: VecDeque<RunId>,
}

impl RunTable {
    /// Mark a run finished and forget the oldest finished runs beyond `retain`.
    fn retire(&mut self, run_id: &RunId, retain: usize) {
        if let Some(handle) = self.handles.get_mut(run_id) {
            handle.commands = None;
            self.finished.push_back(run_id.clone());
        }
        while self.finished.len() > retain {
            if let Some(old) = self.finished.pop_front() {
                self.handles.remove(&old);
                debug!(run_id = %old, "Evicted finished run");
            }
        }
    }
}

/// Entry point for submitting, controlling and observing workflow runs.
///
/// Each submitted run gets its own actor task; this type only routes
/// commands to it and reads the views it publishes.
pub struct Orchestrator {
    config: AppConfig,
    capability: Arc<dyn Capability>,
    gate: Arc<AuthorityGate>,
    event_bus: Arc<EventBus>,
    broker: Arc<EscalationBroker>,
    snapshots: Option<Arc<SnapshotStore>>,
    runs: Arc<Mutex<RunTable>>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        capability: Arc<dyn Capability>,
        security: Arc<dyn SecurityProvider>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
        Self {
            config: config.clone(),
            capability,
            gate: Arc::new(AuthorityGate::new(security, event_bus.clone())),
            broker: Arc::new(EscalationBroker::new(event_bus.clone())),
            event_bus,
            snapshots: None,
            runs: Arc::new(Mutex::new(RunTable::default())),
        }
    }

    /// Save a snapshot of every run when it completes.
    pub fn with_snapshots(mut self, store: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn broker(&self) -> Arc<EscalationBroker> {
        self.broker.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    /// Validate `graph` and start a run. A malformed graph is rejected before
    /// anything is dispatched.
    pub async fn submit_run(
        &self,
        graph: &Graph,
        authority: AuthorityContext,
        bindings: Bindings,
    ) -> Result<RunId> {
        let valid = Arc::new(validate(graph)?);
        let state = RunState::new(valid, bindings);
        Ok(self.start(state, authority).await)
    }

    /// Start a new run from a snapshot. Succeeded and pruned nodes keep their
    /// state; everything else is dispatched again.
    pub async fn resume_run(&self, graph: &Graph, snapshot: &RunSnapshot) -> Result<RunId> {
        if graph.id != snapshot.graph_id {
            return Err(OraError::SnapshotMismatch {
                expected: graph.id.clone(),
                found: snapshot.graph_id.clone(),
            });
        }
        let valid = Arc::new(validate(graph)?);
        let state = RunState::resume(valid, snapshot);
        info!(from_run = %snapshot.run_id, graph_id = %snapshot.graph_id, "Resuming from snapshot");
        Ok(self.start(state, snapshot.authority.clone()).await)
    }

    async fn start(&self, state: RunState, authority: AuthorityContext) -> RunId {
        let run_id = RunId::new();
        let authority = Arc::new(SharedAuthority::new(authority));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(RunView {
            statuses: state.statuses(),
            ..RunView::default()
        });

        let deps = RunDeps {
            config: self.config.engine.clone(),
            capability: self.capability.clone(),
            gate: self.gate.clone(),
            event_bus: self.event_bus.clone(),
            snapshots: self.snapshots.clone(),
        };
        let actor = RunActor::new(run_id.clone(), state, deps, authority.clone(), command_rx, view_tx);

        self.runs.lock().await.handles.insert(
            run_id.clone(),
            RunHandle {
                commands: Some(commands),
                view,
                authority,
            },
        );

        let runs = self.runs.clone();
        let retain = self.config.engine.retained_runs;
        let id = run_id.clone();
        tokio::spawn(async move {
            actor.run().await;
            runs.lock().await.retire(&id, retain);
        });
        run_id
    }

    async fn with_handle<T>(&self, run_id: &RunId, f: impl FnOnce(&RunHandle) -> T) -> Result<T> {
        let runs = self.runs.lock().await;
        runs.handles
            .get(run_id)
            .map(f)
            .ok_or_else(|| OraError::RunNotFound(run_id.to_string()))
    }

    /// Wait for a run to finish.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunReport> {
        let mut view = self.with_handle(run_id, |h| h.view.clone()).await?;
        loop {
            if let Some(report) = view.borrow_and_update().report.clone() {
                return Ok(report);
            }
            if view.changed().await.is_err() {
                return view
                    .borrow()
                    .report
                    .clone()
                    .ok_or_else(|| OraError::RunAborted(run_id.to_string()));
            }
        }
    }

    /// The report of a finished run, or `None` while it is still going.
    pub async fn report(&self, run_id: &RunId) -> Result<Option<RunReport>> {
        self.with_handle(run_id, |h| h.view.borrow().report.clone())
            .await
    }

    pub async fn node_statuses(&self, run_id: &RunId) -> Result<BTreeMap<String, NodeStatus>> {
        self.with_handle(run_id, |h| h.view.borrow().statuses.clone())
            .await
    }

    pub async fn agents(&self, run_id: &RunId) -> Result<Vec<AgentSnapshot>> {
        self.with_handle(run_id, |h| h.view.borrow().agents.clone())
            .await
    }

    pub async fn bindings(&self, run_id: &RunId) -> Result<Bindings> {
        self.with_handle(run_id, |h| h.view.borrow().bindings.clone())
            .await
    }

    pub async fn authority(&self, run_id: &RunId) -> Result<AuthorityContext> {
        self.with_handle(run_id, |h| (*h.authority.current()).clone())
            .await
    }

    pub async fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().await.handles.keys().cloned().collect()
    }

    /// Route a control to the run's actor and wait for it to be applied.
    async fn send(&self, run_id: &RunId, control: Control) -> Result<()> {
        let commands = self.with_handle(run_id, |h| h.commands.clone()).await?;
        let (reply, rx) = oneshot::channel();
        let sent = commands.is_some_and(|c| c.send(RunCommand { control, reply }).is_ok());
        if !sent {
            warn!(run_id = %run_id, "Run already finished, ignoring control");
            return Ok(());
        }
        // Actor exiting with the command queued counts as a no-op
        rx.await.unwrap_or(Ok(()))
    }

    pub async fn pause_agent(&self, run_id: &RunId, agent_id: &AgentId) -> Result<()> {
        self.send(run_id, Control::Pause(agent_id.clone())).await
    }

    pub async fn resume_agent(&self, run_id: &RunId, agent_id: &AgentId) -> Result<()> {
        self.send(run_id, Control::Resume(agent_id.clone())).await
    }

    pub async fn kill_agent(&self, run_id: &RunId, agent_id: &AgentId) -> Result<()> {
        self.send(run_id, Control::Kill(agent_id.clone())).await
    }

    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.send(run_id, Control::Cancel).await
    }

    /// Re-dispatch a failed node and whatever its failure blocked.
    pub async fn retry_node(&self, run_id: &RunId, node_id: &str) -> Result<()> {
        let known = self
            .with_handle(run_id, |h| h.view.borrow().statuses.contains_key(node_id))
            .await?;
        if !known {
            return Err(OraError::NodeNotFound {
                run: run_id.to_string(),
                node: node_id.to_string(),
            });
        }
        self.send(run_id, Control::Retry(node_id.to_string())).await
    }

    /// Raise a run's authority level.
    ///
    /// Levels up to `escalation.auto_approve_up_to` are granted immediately
    /// when the run holds `escalate`; anything else waits on the broker for an
    /// external decision. On approval the run's context is replaced; nodes
    /// already dispatched keep the authority they were checked against.
    pub async fn request_escalation(
        &self,
        run_id: &RunId,
        target: AuthorityLevel,
        reason: impl Into<String>,
    ) -> Result<()> {
        let (authority, finished) = self
            .with_handle(run_id, |h| {
                (h.authority.clone(), h.view.borrow().report.is_some())
            })
            .await?;
        if finished {
            warn!(run_id = %run_id, "Run already finished, ignoring escalation");
            return Ok(());
        }

        let current = authority.current();
        if target <= current.level {
            debug!(run_id = %run_id, level = %current.level, %target, "Already at or above requested level");
            return Ok(());
        }

        let auto = current.has(permission::ESCALATE)
            && target <= self.config.escalation.auto_approve_up_to;
        if auto {
            info!(run_id = %run_id, from = %current.level, to = %target, "Escalation auto-approved");
        } else {
            let request = EscalationRequest {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                from: current.level,
                to: target,
                reason: reason.into(),
                timestamp: Utc::now(),
            };
            let timeout = Duration::from_secs(self.config.escalation.approval_timeout_secs);
            self.broker.decide(request, timeout).await?;
        }

        // Another escalation may have gone further while this one waited
        let Some(from) = authority.raise(target) else {
            debug!(run_id = %run_id, %target, "Escalation superseded by a higher grant");
            return Ok(());
        };
        info!(run_id = %run_id, %from, to = %target, "Authority escalated");
        self.event_bus.publish(EngineEvent::AuthorityEscalated {
            run_id: run_id.clone(),
            from,
            to: target,
        });
        Ok(())
    }

    /// Answer a pending escalation. Returns false if no such request is waiting.
    pub async fn respond_escalation(&self, request_id: &str, decision: EscalationDecision) -> bool {
        self.broker.respond(request_id, decision).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ora_core::error::CapabilityError;
    use ora_core::graph::{Edge, GraphViolation, Node, Quorum};
    use ora_core::security::{AuthorizationError, SecurityMonitor};
    use ora_core::types::{AgentStatus, NodeFailure, RunFailure, RunOutcome};
    use ora_test_utils::{
        linear_graph, open_security, retry_loop_graph, wait_for_event, wait_for_status, Script,
        ScriptedCapability,
    };
    use serde_json::json;

    fn orchestrator(cap: Arc<ScriptedCapability>, security: Arc<SecurityMonitor>) -> Orchestrator {
        Orchestrator::new(&AppConfig::default(), cap, security)
    }

    fn ctx(level: AuthorityLevel) -> AuthorityContext {
        AuthorityContext::for_level(level)
    }

    fn solo_agent(budget: Option<f64>) -> Graph {
        let mut node = Node::agent("solo", "planner", "think");
        if let Some(b) = budget {
            node = node.with_budget(b);
        }
        Graph::new("solo")
            .node(node)
            .node(Node::tool("after", "filesystem.list"))
            .edge(Edge::new("solo", "after"))
    }

    async fn running_agent(
        rx: &mut broadcast::Receiver<EngineEvent>,
        run: &RunId,
        node: &str,
    ) -> AgentId {
        let event = wait_for_event(rx, |e| {
            matches!(e, EngineEvent::AgentStatusChanged { run_id, node_id, to: AgentStatus::Running, .. }
                if run_id == run && node_id == node)
        })
        .await;
        match event {
            EngineEvent::AgentStatusChanged { agent_id, .. } => agent_id,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn linear_run_binds_outputs() {
        let cap = ScriptedCapability::new()
            .script("a", Script::ok().bind("x", json!(1)))
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let run = orch
            .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(cap.calls(), vec!["a", "b", "c"]);
        assert_eq!(report.bindings["x"], 1);
        assert_eq!(report.bindings["a_status"], "success");
        assert_eq!(report.dispatches, 3);
        // later nodes see earlier bindings
        let c = &cap.invocations()[2];
        assert_eq!(c.bindings["b_status"], "success");
    }

    #[tokio::test]
    async fn failure_blocks_downstream() {
        let cap = ScriptedCapability::new()
            .script("b", Script::fail("disk full"))
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let run = orch
            .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
        assert_eq!(
            report.nodes["b"],
            NodeStatus::Failed {
                reason: NodeFailure::Capability {
                    error: CapabilityError::failed("disk full")
                }
            }
        );
        assert_eq!(
            report.nodes["c"],
            NodeStatus::Blocked {
                upstream: "b".into()
            }
        );
        assert_eq!(report.bindings["b_status"], "failure");
        assert_eq!(cap.call_count("c"), 0);
    }

    #[tokio::test]
    async fn malformed_graph_rejected_before_dispatch() {
        let cap = ScriptedCapability::new().into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let graph = linear_graph().edge(Edge::new("c", "ghost"));
        let err = orch
            .submit_run(&graph, ctx(AuthorityLevel::A5), Bindings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OraError::MalformedGraph(_)));
        assert!(cap.calls().is_empty());
        assert!(orch.run_ids().await.is_empty());
    }

    #[tokio::test]
    async fn zero_quorum_merge_never_runs() {
        let cap = ScriptedCapability::new().into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let graph = Graph::new("eager")
            .node(Node::tool("a", "filesystem.read"))
            .node(Node::tool("b", "filesystem.read"))
            .node(Node::merge("m", Quorum::AtLeast(0)))
            .node(Node::tool("after", "filesystem.list"))
            .edge(Edge::new("a", "m"))
            .edge(Edge::new("b", "m"))
            .edge(Edge::new("m", "after"));
        match orch
            .submit_run(&graph, ctx(AuthorityLevel::A1), Bindings::new())
            .await
        {
            Err(OraError::MalformedGraph(err)) => assert_eq!(
                err.violations,
                vec![GraphViolation::QuorumOutOfRange {
                    node: "m".into(),
                    quorum: 0,
                    inbound: 2
                }]
            ),
            other => panic!("expected malformed graph, got {:?}", other),
        }
        assert!(cap.calls().is_empty());
        assert!(orch.run_ids().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_run_and_node() {
        let orch = orchestrator(ScriptedCapability::new().into_arc(), open_security());
        let missing = RunId::from_string("missing");
        assert!(matches!(orch.wait(&missing).await, Err(OraError::RunNotFound(_))));
        assert!(matches!(orch.cancel_run(&missing).await, Err(OraError::RunNotFound(_))));

        let run = orch
            .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        assert!(matches!(
            orch.retry_node(&run, "ghost").await,
            Err(OraError::NodeNotFound { .. })
        ));
        orch.wait(&run).await.unwrap();
    }

    #[tokio::test]
    async fn only_newest_finished_runs_are_kept() {
        let mut config = AppConfig::default();
        config.engine.retained_runs = 2;
        let cap = ScriptedCapability::new().into_arc();
        let orch = Orchestrator::new(&config, cap, open_security());

        let mut runs = Vec::new();
        for _ in 0..3 {
            let run = orch
                .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
                .await
                .unwrap();
            orch.wait(&run).await.unwrap();
            runs.push(run);
        }

        // retirement happens just after the report is published
        tokio::time::timeout(Duration::from_secs(5), async {
            while orch.run_ids().await.len() > 2 || orch.run_ids().await.contains(&runs[0]) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(orch.wait(&runs[0]).await, Err(OraError::RunNotFound(_))));
        assert!(matches!(orch.node_statuses(&runs[0]).await, Err(OraError::RunNotFound(_))));

        let kept = &runs[1];
        assert_eq!(orch.wait(kept).await.unwrap().outcome, RunOutcome::Succeeded);
        assert_eq!(orch.node_statuses(kept).await.unwrap()["c"], NodeStatus::Succeeded);
        assert_eq!(orch.bindings(kept).await.unwrap()["a_status"], "success");
        assert_eq!(orch.authority(kept).await.unwrap().level, AuthorityLevel::A1);
        assert!(orch.report(kept).await.unwrap().is_some());
        // controls on a retained run are still no-ops, and node ids still checked
        orch.cancel_run(kept).await.unwrap();
        orch.retry_node(kept, "b").await.unwrap();
        assert!(matches!(
            orch.retry_node(kept, "ghost").await,
            Err(OraError::NodeNotFound { .. })
        ));
        orch.request_escalation(kept, AuthorityLevel::A5, "late")
            .await
            .unwrap();
        assert_eq!(orch.authority(kept).await.unwrap().level, AuthorityLevel::A1);
    }

    #[tokio::test]
    async fn pause_holds_result_until_resume() {
        let cap = ScriptedCapability::new()
            .script("solo", Script::ok().delay_ms(50))
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&solo_agent(None), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();

        let agent = running_agent(&mut rx, &run, "solo").await;
        orch.pause_agent(&run, &agent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let statuses = orch.node_statuses(&run).await.unwrap();
        assert_eq!(statuses["solo"], NodeStatus::Paused);
        assert_eq!(statuses["after"], NodeStatus::Pending);
        assert_eq!(orch.agents(&run).await.unwrap()[0].status, AgentStatus::Paused);

        orch.resume_agent(&run, &agent).await.unwrap();
        let report = orch.wait(&run).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.agents[0].status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn kill_paused_agent_fails_node() {
        let cap = ScriptedCapability::new()
            .script("solo", Script::ok().hang())
            .into_arc();
        let orch = orchestrator(cap, open_security());
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&solo_agent(None), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();

        let agent = running_agent(&mut rx, &run, "solo").await;
        orch.pause_agent(&run, &agent).await.unwrap();
        orch.kill_agent(&run, &agent).await.unwrap();
        let report = orch.wait(&run).await.unwrap();

        assert_eq!(
            report.nodes["solo"],
            NodeStatus::Failed {
                reason: NodeFailure::Killed
            }
        );
        assert_eq!(report.agents[0].status, AgentStatus::Killed);
        assert_eq!(report.outcome, RunOutcome::PartiallyFailed);

        // controls after the run ended are no-ops
        orch.kill_agent(&run, &agent).await.unwrap();
        orch.resume_agent(&run, &agent).await.unwrap();
        orch.cancel_run(&run).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_agent_in_live_run() {
        let cap = ScriptedCapability::new()
            .script("solo", Script::ok().hang())
            .into_arc();
        let orch = orchestrator(cap, open_security());
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&solo_agent(None), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        running_agent(&mut rx, &run, "solo").await;

        let err = orch
            .pause_agent(&run, &AgentId::from_string("agt_nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, OraError::AgentNotFound { .. }));

        orch.cancel_run(&run).await.unwrap();
        let report = orch.wait(&run).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.nodes["solo"], NodeStatus::Cancelled);
        assert_eq!(report.nodes["after"], NodeStatus::Cancelled);
        assert_eq!(report.agents[0].status, AgentStatus::Killed);
    }

    #[tokio::test]
    async fn budget_overrun_fails_agent() {
        let cap = ScriptedCapability::new()
            .script("solo", Script::ok().tick(10, 0.6).tick(20, 0.6).hang())
            .into_arc();
        let orch = orchestrator(cap, open_security());
        let run = orch
            .submit_run(&solo_agent(Some(1.0)), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();

        match &report.nodes["solo"] {
            NodeStatus::Failed {
                reason: NodeFailure::BudgetExceeded { token_burn, budget },
            } => {
                assert!(token_burn > budget);
                assert_eq!(*budget, 1.0);
            }
            other => panic!("expected budget failure, got {}", other),
        }
        assert_eq!(report.agents[0].status, AgentStatus::Error);
        assert_eq!(report.agents[0].progress, 20);
        assert!(matches!(report.nodes["after"], NodeStatus::Blocked { .. }));
    }

    #[tokio::test]
    async fn default_budget_applies_without_override() {
        let mut config = AppConfig::default();
        config.engine.default_agent_budget = 0.5;
        let cap = ScriptedCapability::new()
            .script("solo", Script::ok().tick(50, 0.75).hang())
            .into_arc();
        let orch = Orchestrator::new(&config, cap, open_security());
        let run = orch
            .submit_run(&solo_agent(None), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();
        assert_eq!(report.agents[0].budget, Some(0.5));
        assert_eq!(report.agents[0].status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn loop_reenters_until_condition_holds() {
        let cap = ScriptedCapability::new()
            .script("build", Script::ok().bind("done", json!(false)))
            .script("build", Script::ok().bind("done", json!(true)))
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&retry_loop_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();

        wait_for_event(&mut rx, |e| {
            matches!(e, EngineEvent::NodeReentered { node_id, .. } if node_id == "build")
        })
        .await;
        let report = orch.wait(&run).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(cap.call_count("build"), 2);
        assert_eq!(cap.call_count("ship"), 1);
        assert_eq!(report.nodes["ship"], NodeStatus::Succeeded);
        // build, check, build, check, ship
        assert_eq!(report.dispatches, 5);
    }

    #[tokio::test]
    async fn endless_loop_hits_dispatch_ceiling() {
        let mut config = AppConfig::default();
        config.engine.max_dispatches = 5;
        let cap = ScriptedCapability::new()
            .script("build", Script::ok().bind("done", json!(false)))
            .into_arc();
        let orch = Orchestrator::new(&config, cap.clone(), open_security());
        let run = orch
            .submit_run(&retry_loop_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: RunFailure::IterationLimitExceeded { limit: 5 }
            }
        );
        assert_eq!(report.dispatches, 5);
        assert_eq!(cap.call_count("ship"), 0);
        assert!(report.nodes.values().all(|s| s.is_terminal()));
    }

    #[tokio::test]
    async fn panicking_capability_fails_node() {
        let cap = ScriptedCapability::new()
            .script("a", Script::ok().panics())
            .into_arc();
        let orch = orchestrator(cap, open_security());
        let run = orch
            .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&run).await.unwrap();
        assert!(matches!(
            &report.nodes["a"],
            NodeStatus::Failed { reason: NodeFailure::Capability { .. } }
        ));
        assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
    }

    fn exec_graph() -> Graph {
        Graph::new("exec")
            .node(Node::agent("hold", "planner", "keep the run open"))
            .node(Node::tool("shell", "terminal.execute"))
    }

    #[tokio::test]
    async fn escalation_auto_approved_then_retry() {
        let cap = ScriptedCapability::new()
            .script("hold", Script::ok().hang())
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security());
        let mut rx = orch.subscribe();
        let authority = ctx(AuthorityLevel::A1).with_permission(permission::ESCALATE);
        let run = orch
            .submit_run(&exec_graph(), authority, Bindings::new())
            .await
            .unwrap();

        // hold is declared first, so its agent starts before shell is denied
        let hold = running_agent(&mut rx, &run, "hold").await;
        wait_for_status(&mut rx, &run, "shell", "failed").await;

        orch.request_escalation(&run, AuthorityLevel::A2, "need a shell")
            .await
            .unwrap();
        let authority = orch.authority(&run).await.unwrap();
        assert_eq!(authority.level, AuthorityLevel::A2);
        assert!(authority.has(permission::EXECUTE));
        assert!(authority.has(permission::ESCALATE));

        orch.retry_node(&run, "shell").await.unwrap();
        wait_for_status(&mut rx, &run, "shell", "succeeded").await;
        orch.kill_agent(&run, &hold).await.unwrap();
        orch.wait(&run).await.unwrap();
        assert_eq!(cap.call_count("shell"), 1);
    }

    #[tokio::test]
    async fn escalation_above_threshold_needs_approval() {
        let cap = ScriptedCapability::new()
            .script("hold", Script::ok().hang())
            .into_arc();
        let orch = Arc::new(orchestrator(cap, open_security()));
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&exec_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();

        let pending = {
            let orch = orch.clone();
            let run = run.clone();
            tokio::spawn(async move {
                orch.request_escalation(&run, AuthorityLevel::A4, "deploy")
                    .await
            })
        };
        let request_id = match wait_for_event(&mut rx, |e| {
            matches!(e, EngineEvent::EscalationRequested { .. })
        })
        .await
        {
            EngineEvent::EscalationRequested { request } => request.id,
            _ => unreachable!(),
        };
        assert!(orch.respond_escalation(&request_id, EscalationDecision::Approved).await);
        pending.await.unwrap().unwrap();
        assert_eq!(orch.authority(&run).await.unwrap().level, AuthorityLevel::A4);

        let denied = {
            let orch = orch.clone();
            let run = run.clone();
            tokio::spawn(async move {
                orch.request_escalation(&run, AuthorityLevel::A5, "root").await
            })
        };
        let request_id = match wait_for_event(&mut rx, |e| {
            matches!(e, EngineEvent::EscalationRequested { .. })
        })
        .await
        {
            EngineEvent::EscalationRequested { request } => request.id,
            _ => unreachable!(),
        };
        orch.respond_escalation(
            &request_id,
            EscalationDecision::Denied {
                reason: "no".into(),
            },
        )
        .await;
        assert!(matches!(
            denied.await.unwrap(),
            Err(OraError::EscalationDenied { .. })
        ));
        assert_eq!(orch.authority(&run).await.unwrap().level, AuthorityLevel::A4);

        orch.cancel_run(&run).await.unwrap();
        orch.wait(&run).await.unwrap();
    }

    #[tokio::test]
    async fn late_lower_approval_keeps_higher_level() {
        let cap = ScriptedCapability::new()
            .script("hold", Script::ok().hang())
            .into_arc();
        let orch = Arc::new(orchestrator(cap, open_security()));
        let mut rx = orch.subscribe();
        let run = orch
            .submit_run(&exec_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();

        let escalate = |target: AuthorityLevel| {
            let orch = orch.clone();
            let run = run.clone();
            tokio::spawn(async move { orch.request_escalation(&run, target, "deploy").await })
        };
        let to_a4 = escalate(AuthorityLevel::A4);
        let to_a5 = escalate(AuthorityLevel::A5);

        let mut ids = HashMap::new();
        while ids.len() < 2 {
            if let EngineEvent::EscalationRequested { request } =
                wait_for_event(&mut rx, |e| matches!(e, EngineEvent::EscalationRequested { .. }))
                    .await
            {
                ids.insert(request.to, request.id);
            }
        }

        assert!(orch.respond_escalation(&ids[&AuthorityLevel::A5], EscalationDecision::Approved).await);
        to_a5.await.unwrap().unwrap();
        assert!(orch.respond_escalation(&ids[&AuthorityLevel::A4], EscalationDecision::Approved).await);
        to_a4.await.unwrap().unwrap();

        assert_eq!(orch.authority(&run).await.unwrap().level, AuthorityLevel::A5);
        orch.cancel_run(&run).await.unwrap();
        orch.wait(&run).await.unwrap();
        // only the A5 grant was published
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event,
                EngineEvent::AuthorityEscalated { to: AuthorityLevel::A4, .. }
            ));
        }
    }

    #[tokio::test]
    async fn escalation_times_out() {
        let mut config = AppConfig::default();
        config.escalation.approval_timeout_secs = 0;
        let cap = ScriptedCapability::new()
            .script("hold", Script::ok().hang())
            .into_arc();
        let orch = Orchestrator::new(&config, cap, open_security());
        let run = orch
            .submit_run(&exec_graph(), ctx(AuthorityLevel::A0), Bindings::new())
            .await
            .unwrap();

        let err = orch
            .request_escalation(&run, AuthorityLevel::A3, "please")
            .await
            .unwrap_err();
        assert!(matches!(err, OraError::EscalationTimeout { .. }));
        assert!(orch.broker().outstanding().await.is_empty());

        // a lower target is a no-op
        orch.request_escalation(&run, AuthorityLevel::A0, "noop")
            .await
            .unwrap();
        orch.cancel_run(&run).await.unwrap();
        let report = orch.wait(&run).await.unwrap();
        assert!(matches!(
            &report.nodes["shell"],
            NodeStatus::Failed {
                reason: NodeFailure::Denied {
                    error: AuthorizationError::InsufficientAuthority { .. }
                }
            }
        ));
    }

    #[tokio::test]
    async fn snapshot_saved_and_resumed() {
        let store = Arc::new(SnapshotStore::in_memory().unwrap());
        let cap = ScriptedCapability::new()
            .script("b", Script::fail("flaky"))
            .script("b", Script::ok())
            .into_arc();
        let orch = orchestrator(cap.clone(), open_security()).with_snapshots(store.clone());

        let first = orch
            .submit_run(&linear_graph(), ctx(AuthorityLevel::A1), Bindings::new())
            .await
            .unwrap();
        let report = orch.wait(&first).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::PartiallyFailed);

        let snapshot = store.load(&first).unwrap().unwrap();
        assert_eq!(snapshot.statuses(), report.nodes);
        assert_eq!(snapshot.outcome, Some(RunOutcome::PartiallyFailed));

        let second = orch.resume_run(&linear_graph(), &snapshot).await.unwrap();
        let resumed = orch.wait(&second).await.unwrap();
        assert_eq!(resumed.outcome, RunOutcome::Succeeded);
        assert_eq!(cap.call_count("a"), 1);
        assert_eq!(cap.call_count("b"), 2);
        assert_eq!(resumed.bindings["a_status"], "success");

        let other = Graph::new("different").node(Node::tool("x", "filesystem.read"));
        assert!(matches!(
            orch.resume_run(&other, &snapshot).await,
            Err(OraError::SnapshotMismatch { .. })
        ));
    }
}
