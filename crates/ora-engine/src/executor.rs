//! The per-run actor.
//!
//! One task owns a run's [`RunState`], its agents and its bindings. Capability
//! invocations run in a `JoinSet`; their results, progress ticks and control
//! commands come back over channels and are applied one at a time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ora_core::config::EngineConfig;
use ora_core::error::{CapabilityError, OraError, Result};
use ora_core::event::EventBus;
use ora_core::graph::{Branch, NodeConfig, NodeKind, ValidGraph};
use ora_core::security::{AuthDecision, AuthorityContext, AuthorityLevel};
use ora_core::traits::{
    Capability, CapabilityOutput, Invocation, InvocationContext, ProgressReporter, ProgressTick,
};
use ora_core::types::{
    AgentId, AgentStatus, Bindings, EngineEvent, NodeFailure, NodeStatus, RunFailure, RunId, RunOutcome,
};

use crate::agent::{AgentControl, AgentInstance, AgentSnapshot, TickOutcome};
use crate::gate::AuthorityGate;
use crate::run::{Readiness, RunState};
use crate::snapshot::SnapshotStore;

/// A run's authority context. Escalation swaps the whole `Arc`; a context is
/// never mutated once published.
pub struct SharedAuthority {
    inner: RwLock<Arc<AuthorityContext>>,
}

impl SharedAuthority {
    pub fn new(ctx: AuthorityContext) -> Self {
        Self {
            inner: RwLock::new(Arc::new(ctx)),
        }
    }

    pub fn current(&self) -> Arc<AuthorityContext> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Escalate to `target` unless the run already holds it or more.
    /// Returns the level that was replaced.
    pub fn raise(&self, target: AuthorityLevel) -> Option<AuthorityLevel> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if target <= guard.level {
            return None;
        }
        let previous = guard.level;
        *guard = Arc::new(guard.escalated_to(target));
        Some(previous)
    }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub graph_id: String,
    pub outcome: RunOutcome,
    pub nodes: BTreeMap<String, NodeStatus>,
    pub bindings: Bindings,
    pub dispatches: u32,
    pub agents: Vec<AgentSnapshot>,
}

/// Observable copy of a run, republished after every step.
#[derive(Debug, Clone, Default)]
pub struct RunView {
    pub statuses: BTreeMap<String, NodeStatus>,
    pub agents: Vec<AgentSnapshot>,
    pub bindings: Bindings,
    pub dispatches: u32,
    pub report: Option<RunReport>,
}

#[derive(Debug)]
pub(crate) enum Control {
    Pause(AgentId),
    Resume(AgentId),
    Kill(AgentId),
    Cancel,
    Retry(String),
}

#[derive(Debug)]
pub(crate) struct RunCommand {
    pub control: Control,
    pub reply: oneshot::Sender<Result<()>>,
}

/// A dispatched node awaiting its capability result.
struct InFlight {
    attempt: u32,
    cancel: CancellationToken,
    agent: Option<AgentId>,
    /// Result that arrived while the agent was paused.
    held: Option<std::result::Result<CapabilityOutput, CapabilityError>>,
}

struct TaskDone {
    node_id: String,
    attempt: u32,
    result: std::result::Result<CapabilityOutput, CapabilityError>,
}

/// Everything a run actor needs from its orchestrator.
pub(crate) struct RunDeps {
    pub config: EngineConfig,
    pub capability: Arc<dyn Capability>,
    pub gate: Arc<AuthorityGate>,
    pub event_bus: Arc<EventBus>,
    pub snapshots: Option<Arc<SnapshotStore>>,
}

pub(crate) struct RunActor {
    run_id: RunId,
    graph: Arc<ValidGraph>,
    state: RunState,
    deps: RunDeps,
    authority: Arc<SharedAuthority>,
    agents: Vec<AgentInstance>,
    in_flight: HashMap<String, InFlight>,
    ready: VecDeque<String>,
    tasks: JoinSet<TaskDone>,
    attempts: u32,
    halted: bool,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<RunCommand>,
    commands_open: bool,
    tick_tx: mpsc::UnboundedSender<ProgressTick>,
    tick_rx: mpsc::UnboundedReceiver<ProgressTick>,
    view: watch::Sender<RunView>,
}

impl RunActor {
    pub fn new(
        run_id: RunId,
        state: RunState,
        deps: RunDeps,
        authority: Arc<SharedAuthority>,
        commands: mpsc::UnboundedReceiver<RunCommand>,
        view: watch::Sender<RunView>,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        Self {
            run_id,
            graph: state.graph().clone(),
            state,
            deps,
            authority,
            agents: Vec::new(),
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            attempts: 0,
            halted: false,
            cancel: CancellationToken::new(),
            commands,
            commands_open: true,
            tick_tx,
            tick_rx,
            view,
        }
    }

    /// Drive the run to completion.
    pub async fn run(mut self) -> RunReport {
        info!(run_id = %self.run_id, graph_id = %self.graph.id(), "Run started");
        self.publish(EngineEvent::RunStarted {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id().to_string(),
        });

        let seeds: Vec<String> = self.graph.nodes().map(|n| n.id.clone()).collect();
        self.settle(seeds);

        loop {
            self.dispatch_ready();
            self.publish_view(None);

            if self.is_finished() {
                break;
            }
            if !self.commands_open && self.tasks.is_empty() {
                // Nobody left to resume paused work
                warn!(run_id = %self.run_id, "Control channel closed with paused work, cancelling");
                self.cancel_run();
                continue;
            }

            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(done) => self.on_task_done(done),
                    Err(e) => error!(run_id = %self.run_id, error = %e, "Dispatch task aborted"),
                },
                Some(tick) = self.tick_rx.recv() => self.on_tick(tick),
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => {
                        let result = self.on_control(cmd.control);
                        let _ = cmd.reply.send(result);
                    }
                    None => self.commands_open = false,
                },
            }
        }

        self.finish()
    }

    fn is_finished(&self) -> bool {
        self.ready.is_empty() && self.tasks.is_empty() && self.state.is_quiescent()
    }

    fn publish(&self, event: EngineEvent) {
        self.deps.event_bus.publish(event);
    }

    fn publish_view(&self, report: Option<RunReport>) {
        self.view.send_replace(RunView {
            statuses: self.state.statuses(),
            agents: self.agents.iter().map(AgentInstance::snapshot).collect(),
            bindings: self.state.bindings.clone(),
            dispatches: self.state.dispatches,
            report,
        });
    }

    fn set_status(&mut self, id: &str, status: NodeStatus) {
        if self.state.set_status(id, status.clone()) {
            debug!(run_id = %self.run_id, node_id = %id, %status, "Node status");
            self.publish(EngineEvent::NodeStatusChanged {
                run_id: self.run_id.clone(),
                node_id: id.to_string(),
                status,
            });
        }
    }

    fn agent_mut(&mut self, id: &AgentId) -> Option<&mut AgentInstance> {
        self.agents.iter_mut().find(|a| a.id() == id)
    }

    /// Apply a control to an agent, publishing the transition.
    fn control_agent(&mut self, id: &AgentId, control: AgentControl) -> bool {
        let run_id = self.run_id.clone();
        let Some(agent) = self.agent_mut(id) else {
            return false;
        };
        let node_id = agent.node_id().to_string();
        match agent.apply(control) {
            Some(t) => {
                self.publish(EngineEvent::AgentStatusChanged {
                    run_id,
                    agent_id: id.clone(),
                    node_id,
                    from: t.from,
                    to: t.to,
                });
                true
            }
            None => false,
        }
    }

    /// Count an activation. Trips the dispatch ceiling and halts the run when
    /// it would be exceeded.
    fn activate(&mut self, id: &str) -> bool {
        let limit = self.deps.config.max_dispatches;
        if self.state.dispatches >= limit {
            warn!(run_id = %self.run_id, node_id = %id, limit, "Dispatch limit exceeded");
            self.state.failure = Some(RunFailure::IterationLimitExceeded { limit });
            self.set_status(
                id,
                NodeStatus::Failed {
                    reason: NodeFailure::IterationLimitExceeded { limit },
                },
            );
            self.halt();
            return false;
        }
        self.state.count_dispatch(id);
        true
    }

    /// Stop all work: kill live agents, cancel invocations, and mark every
    /// unfinished node cancelled.
    fn halt(&mut self) {
        self.halted = true;
        self.ready.clear();
        let flights: Vec<InFlight> = self.in_flight.drain().map(|(_, f)| f).collect();
        for flight in flights {
            flight.cancel.cancel();
            if let Some(agent) = flight.agent {
                self.control_agent(&agent, AgentControl::Kill);
            }
        }
        self.cancel.cancel();
        let open = self.state.ids_with(|s| {
            matches!(
                s,
                NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running | NodeStatus::Paused
            )
        });
        for id in open {
            self.set_status(&id, NodeStatus::Cancelled);
        }
    }

    fn cancel_run(&mut self) {
        if self.halted {
            return;
        }
        info!(run_id = %self.run_id, "Cancelling run");
        self.state.cancelled = true;
        self.publish(EngineEvent::RunCancelled {
            run_id: self.run_id.clone(),
        });
        self.halt();
    }

    /// Re-evaluate pending nodes until nothing changes. Condition and merge
    /// nodes resolve here; agent and tool nodes are queued for dispatch.
    fn settle(&mut self, seeds: impl IntoIterator<Item = String>) {
        let mut work: VecDeque<String> = seeds.into_iter().collect();
        while let Some(id) = work.pop_front() {
            if self.halted {
                return;
            }
            if self.state.status(&id) != Some(&NodeStatus::Pending) {
                continue;
            }
            match self.state.readiness(&id) {
                Readiness::Wait => {}
                Readiness::Ready => {
                    let kind = self.graph.node(&id).map(|n| n.kind());
                    if kind == Some(NodeKind::Condition) {
                        if let Some(next) = self.resolve_condition(&id) {
                            work.extend(next);
                        }
                    } else {
                        self.set_status(&id, NodeStatus::Ready);
                        self.ready.push_back(id);
                    }
                }
                Readiness::Blocked { upstream } => {
                    self.set_status(&id, NodeStatus::Blocked { upstream });
                    work.extend(self.state.successors(&id));
                }
                Readiness::Pruned => {
                    self.set_status(&id, NodeStatus::Pruned);
                    work.extend(self.state.successors(&id));
                }
                Readiness::QuorumMet => {
                    if !self.activate(&id) {
                        return;
                    }
                    debug!(run_id = %self.run_id, node_id = %id, "Merge quorum met");
                    self.set_status(&id, NodeStatus::Succeeded);
                    work.extend(self.after_success(&id));
                }
                Readiness::QuorumUnreachable {
                    succeeded,
                    required,
                } => {
                    if !self.activate(&id) {
                        return;
                    }
                    warn!(run_id = %self.run_id, node_id = %id, succeeded, required, "Merge quorum unreachable");
                    self.set_status(
                        &id,
                        NodeStatus::Failed {
                            reason: NodeFailure::QuorumUnreachable {
                                succeeded,
                                required,
                            },
                        },
                    );
                    if self.graph.is_sink(&id) {
                        self.state.failure = Some(RunFailure::QuorumUnreachable { node: id.clone() });
                    }
                    work.extend(self.state.successors(&id));
                }
            }
        }
    }

    fn resolve_condition(&mut self, id: &str) -> Option<Vec<String>> {
        if !self.activate(id) {
            return None;
        }
        let value = self
            .graph
            .predicate(id)
            .is_some_and(|p| p.evaluate(&self.state.bindings));
        let branch = Branch::from_bool(value);
        debug!(run_id = %self.run_id, node_id = %id, %branch, "Condition resolved");
        self.state.set_branch(id, Some(branch));
        self.publish(EngineEvent::BranchSelected {
            run_id: self.run_id.clone(),
            node_id: id.to_string(),
            branch,
        });
        self.set_status(id, NodeStatus::Succeeded);
        Some(self.after_success(id))
    }

    /// Fire back edges or hand back forward successors to settle.
    fn after_success(&mut self, id: &str) -> Vec<String> {
        let targets = self.state.firing_back_edges(id);
        if targets.is_empty() {
            return self.state.successors(id);
        }
        for target in &targets {
            self.reenter(target);
        }
        targets
    }

    /// Reset `target` and everything forward-reachable from it.
    fn reenter(&mut self, target: &str) {
        let region = self.graph.forward_reachable(target);
        for id in &region {
            if let Some(flight) = self.in_flight.remove(id) {
                flight.cancel.cancel();
                if let Some(agent) = flight.agent {
                    self.control_agent(&agent, AgentControl::Kill);
                }
            }
        }
        self.ready.retain(|id| !region.contains(id));
        for id in self.state.reset(region) {
            self.publish(EngineEvent::NodeStatusChanged {
                run_id: self.run_id.clone(),
                node_id: id,
                status: NodeStatus::Pending,
            });
        }
        info!(run_id = %self.run_id, node_id = %target, dispatches = self.state.dispatches, "Re-entering loop");
        self.publish(EngineEvent::NodeReentered {
            run_id: self.run_id.clone(),
            node_id: target.to_string(),
            dispatches: self.state.dispatches,
        });
    }

    fn dispatch_ready(&mut self) {
        while !self.halted && self.in_flight.len() < self.deps.config.max_parallelism {
            let Some(id) = self.ready.pop_front() else { break };
            if self.state.status(&id) != Some(&NodeStatus::Ready) {
                continue;
            }
            self.dispatch(id);
        }
    }

    fn dispatch(&mut self, id: String) {
        let Some(node) = self.graph.node(&id).cloned() else {
            return;
        };
        if !self.activate(&id) {
            return;
        }

        let authority = self.authority.current();
        if let AuthDecision::Deny(error) = self.deps.gate.check(&self.run_id, &node, &authority) {
            self.fail_node(&id, NodeFailure::Denied { error });
            return;
        }

        self.attempts += 1;
        let attempt = self.attempts;
        let cancel = self.cancel.child_token();

        let agent = match &node.config {
            NodeConfig::Agent(cfg) => {
                let budget = cfg.budget.unwrap_or(self.deps.config.default_agent_budget);
                let agent = AgentInstance::new(&id, &cfg.agent_type, budget);
                let agent_id = agent.id().clone();
                self.agents.push(agent);
                self.control_agent(&agent_id, AgentControl::Start);
                Some(agent_id)
            }
            _ => None,
        };

        self.set_status(&id, NodeStatus::Running);
        info!(run_id = %self.run_id, node_id = %id, kind = %node.kind(), attempt, "Dispatching node");

        let invocation = Invocation {
            run_id: self.run_id.clone(),
            node_id: id.clone(),
            agent_id: agent.clone(),
            config: node.config.clone(),
            bindings: self.state.bindings.clone(),
        };
        let ctx = InvocationContext {
            cancel: cancel.clone(),
            progress: Some(ProgressReporter::new(&id, attempt, self.tick_tx.clone())),
        };
        self.in_flight.insert(
            id.clone(),
            InFlight {
                attempt,
                cancel: cancel.clone(),
                agent,
                held: None,
            },
        );

        let capability = self.deps.capability.clone();
        self.tasks.spawn(async move {
            let invoke = AssertUnwindSafe(capability.invoke(invocation, ctx)).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CapabilityError::Cancelled),
                r = invoke => r.unwrap_or_else(|_| Err(CapabilityError::failed("capability panicked"))),
            };
            TaskDone {
                node_id: id,
                attempt,
                result,
            }
        });
    }

    fn fail_node(&mut self, id: &str, reason: NodeFailure) {
        warn!(run_id = %self.run_id, node_id = %id, %reason, "Node failed");
        self.state
            .bindings
            .insert(format!("{}_status", id), "failure".into());
        self.set_status(id, NodeStatus::Failed { reason });
        let next = self.state.successors(id);
        self.settle(next);
    }

    fn on_task_done(&mut self, done: TaskDone) {
        let paused = self.state.status(&done.node_id) == Some(&NodeStatus::Paused);
        let Some(flight) = self.in_flight.get_mut(&done.node_id) else {
            debug!(run_id = %self.run_id, node_id = %done.node_id, "Dropping result for settled node");
            return;
        };
        if flight.attempt != done.attempt {
            debug!(run_id = %self.run_id, node_id = %done.node_id, "Dropping stale result");
            return;
        }
        if paused {
            debug!(run_id = %self.run_id, node_id = %done.node_id, "Holding result until resume");
            flight.held = Some(done.result);
            return;
        }
        self.apply_result(&done.node_id, done.result);
    }

    fn apply_result(&mut self, id: &str, result: std::result::Result<CapabilityOutput, CapabilityError>) {
        let Some(flight) = self.in_flight.remove(id) else {
            return;
        };
        match result {
            Ok(output) => {
                if let Some(agent) = &flight.agent {
                    self.control_agent(agent, AgentControl::Complete);
                }
                self.state.bindings.extend(output.bindings);
                self.state
                    .bindings
                    .insert(format!("{}_status", id), "success".into());
                self.set_status(id, NodeStatus::Succeeded);
                let next = self.after_success(id);
                self.settle(next);
            }
            Err(error) => {
                if let Some(agent) = &flight.agent {
                    self.control_agent(agent, AgentControl::Fail);
                }
                self.fail_node(id, NodeFailure::Capability { error });
            }
        }
    }

    fn on_tick(&mut self, tick: ProgressTick) {
        let Some(flight) = self.in_flight.get(&tick.node_id) else { return };
        if flight.attempt != tick.attempt {
            return;
        }
        let Some(agent_id) = flight.agent.clone() else { return };
        let run_id = self.run_id.clone();
        let Some(agent) = self.agent_mut(&agent_id) else { return };

        match agent.tick(tick.progress, tick.token_burn) {
            TickOutcome::Ignored => {}
            TickOutcome::Recorded {
                progress,
                token_burn,
            } => self.publish(EngineEvent::AgentProgress {
                run_id,
                agent_id,
                progress,
                token_burn,
            }),
            TickOutcome::BudgetExceeded { token_burn, budget } => {
                self.publish(EngineEvent::AgentStatusChanged {
                    run_id: run_id.clone(),
                    agent_id: agent_id.clone(),
                    node_id: tick.node_id.clone(),
                    from: AgentStatus::Running,
                    to: AgentStatus::Error,
                });
                self.publish(EngineEvent::BudgetExceeded {
                    run_id,
                    agent_id,
                    token_burn,
                    budget,
                });
                if let Some(flight) = self.in_flight.remove(&tick.node_id) {
                    flight.cancel.cancel();
                }
                self.fail_node(&tick.node_id, NodeFailure::BudgetExceeded { token_burn, budget });
            }
        }
    }

    fn agent_node(&self, id: &AgentId) -> Result<String> {
        self.agents
            .iter()
            .find(|a| a.id() == id)
            .map(|a| a.node_id().to_string())
            .ok_or_else(|| OraError::AgentNotFound {
                run: self.run_id.to_string(),
                agent: id.to_string(),
            })
    }

    fn on_control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Pause(agent) => {
                let node = self.agent_node(&agent)?;
                if self.control_agent(&agent, AgentControl::Pause) {
                    self.set_status(&node, NodeStatus::Paused);
                }
            }
            Control::Resume(agent) => {
                let node = self.agent_node(&agent)?;
                if self.control_agent(&agent, AgentControl::Resume) {
                    self.set_status(&node, NodeStatus::Running);
                    let held = self.in_flight.get_mut(&node).and_then(|f| f.held.take());
                    if let Some(result) = held {
                        self.apply_result(&node, result);
                    }
                }
            }
            Control::Kill(agent) => {
                let node = self.agent_node(&agent)?;
                if self.control_agent(&agent, AgentControl::Kill) {
                    info!(run_id = %self.run_id, agent_id = %agent, node_id = %node, "Agent killed");
                    if let Some(flight) = self.in_flight.remove(&node) {
                        flight.cancel.cancel();
                    }
                    self.fail_node(&node, NodeFailure::Killed);
                }
            }
            Control::Cancel => self.cancel_run(),
            Control::Retry(node) => self.retry(&node)?,
        }
        Ok(())
    }

    /// Re-dispatch a failed node and reset what its failure blocked.
    fn retry(&mut self, id: &str) -> Result<()> {
        let Some(status) = self.state.status(id).cloned() else {
            return Err(OraError::NodeNotFound {
                run: self.run_id.to_string(),
                node: id.to_string(),
            });
        };
        let retryable = matches!(
            &status,
            NodeStatus::Failed { reason } if !matches!(
                reason,
                NodeFailure::QuorumUnreachable { .. } | NodeFailure::IterationLimitExceeded { .. }
            )
        );
        if self.halted || !retryable {
            warn!(run_id = %self.run_id, node_id = %id, %status, "Ignoring retry");
            return Ok(());
        }

        let mut reset = vec![id.to_string()];
        for downstream in self.graph.forward_reachable(id) {
            let blocked = matches!(
                self.state.status(&downstream),
                Some(NodeStatus::Blocked { .. })
                    | Some(NodeStatus::Failed {
                        reason: NodeFailure::QuorumUnreachable { .. }
                    })
            );
            if blocked {
                if matches!(&self.state.failure, Some(RunFailure::QuorumUnreachable { node }) if *node == downstream) {
                    self.state.failure = None;
                }
                reset.push(downstream);
            }
        }
        info!(run_id = %self.run_id, node_id = %id, reset = reset.len(), "Retrying node");
        for node in self.state.reset(reset.clone()) {
            self.publish(EngineEvent::NodeStatusChanged {
                run_id: self.run_id.clone(),
                node_id: node,
                status: NodeStatus::Pending,
            });
        }
        self.settle(reset);
        Ok(())
    }

    fn finish(self) -> RunReport {
        let outcome = self.state.outcome();
        if let Some(store) = &self.deps.snapshots {
            let authority = self.authority.current();
            let snapshot = self
                .state
                .snapshot(&self.run_id, &authority, Some(outcome.clone()));
            if let Err(e) = store.save(&snapshot) {
                error!(run_id = %self.run_id, error = %e, "Failed to save run snapshot");
            }
        }

        let report = RunReport {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id().to_string(),
            outcome: outcome.clone(),
            nodes: self.state.statuses(),
            bindings: self.state.bindings.clone(),
            dispatches: self.state.dispatches,
            agents: self.agents.iter().map(AgentInstance::snapshot).collect(),
        };
        info!(run_id = %self.run_id, %outcome, dispatches = self.state.dispatches, "Run completed");
        self.publish_view(Some(report.clone()));
        self.publish(EngineEvent::RunCompleted {
            run_id: self.run_id.clone(),
            outcome,
            dispatches: self.state.dispatches,
        });
        report
    }
}
