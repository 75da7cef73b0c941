use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use ora_core::config::AppConfig;
use ora_core::graph::{validate, Branch, Edge, Graph, GraphViolation, Node, Quorum};
use ora_core::security::{AuthorityContext, AuthorityLevel, AuthorizationError, SecurityMonitor};
use ora_core::traits::SecurityProvider;
use ora_core::types::{
    AgentId, AgentStatus, Bindings, EngineEvent, NodeFailure, NodeStatus, RunFailure, RunId,
    RunOutcome,
};
use ora_engine::{verify_chain, AuditRecord, AuditSink, Orchestrator};
use ora_test_utils::{
    fan_out_graph, locked_security, open_security, review_graph, wait_for_event, wait_for_status,
    Script, ScriptedCapability,
};

fn orchestrator(cap: Arc<ScriptedCapability>, security: Arc<dyn SecurityProvider>) -> Orchestrator {
    Orchestrator::new(&AppConfig::default(), cap, security)
}

async fn running_agent(rx: &mut broadcast::Receiver<EngineEvent>, run: &RunId, node: &str) -> AgentId {
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

#[test]
fn workflow_file_validates_or_lists_violations() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("review.json");
    std::fs::write(&good, serde_json::to_string(&review_graph()).unwrap()).unwrap();
    let graph = Graph::load(&good).unwrap();
    let valid = validate(&graph).unwrap();
    assert_eq!(valid.entries(), vec!["build"]);

    // a cycle with no condition to break it, plus a dangling edge
    let bad = dir.path().join("bad.toml");
    std::fs::write(
        &bad,
        r#"
id = "bad"

[[nodes]]
id = "a"
kind = "tool"
tool_id = "filesystem.read"

[[nodes]]
id = "b"
kind = "tool"
tool_id = "filesystem.write"

[[edges]]
from = "a"
to = "b"

[[edges]]
from = "b"
to = "a"

[[edges]]
from = "b"
to = "nowhere"
"#,
    )
    .unwrap();
    let err = validate(&Graph::load(&bad).unwrap()).unwrap_err();
    assert!(err.violations.len() >= 2);
    assert!(err
        .violations
        .iter()
        .any(|v| matches!(v, GraphViolation::DanglingEdge { .. })));
}

#[tokio::test]
async fn true_condition_runs_only_the_yes_branch() {
    let cap = ScriptedCapability::new()
        .script("test", Script::ok().bind("tests_pass", json!(true)))
        .into_arc();
    let orch = orchestrator(cap.clone(), open_security());
    let mut rx = orch.subscribe();
    let run = orch
        .submit_run(&review_graph(), AuthorityContext::for_level(AuthorityLevel::A2), Bindings::new())
        .await
        .unwrap();

    let selected = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::BranchSelected { .. })).await;
    assert!(matches!(selected, EngineEvent::BranchSelected { branch: Branch::Yes, .. }));

    let report = orch.wait(&run).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.nodes["audit"], NodeStatus::Succeeded);
    assert_eq!(report.nodes["consensus"], NodeStatus::Succeeded);
    assert_eq!(cap.calls(), vec!["build", "test", "audit"]);
}

#[tokio::test]
async fn false_condition_prunes_review_and_merge_still_completes() {
    let cap = ScriptedCapability::new()
        .script("test", Script::ok().bind("tests_pass", json!(false)))
        .into_arc();
    let orch = orchestrator(cap.clone(), open_security());
    let run = orch
        .submit_run(&review_graph(), AuthorityContext::for_level(AuthorityLevel::A2), Bindings::new())
        .await
        .unwrap();
    let report = orch.wait(&run).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.nodes["audit"], NodeStatus::Pruned);
    assert_eq!(report.nodes["consensus"], NodeStatus::Succeeded);
    assert_eq!(cap.call_count("audit"), 0);
    assert_eq!(report.bindings["test_status"], "success");
}

#[tokio::test]
async fn quorum_met_before_slowest_branch_finishes() {
    let cap = ScriptedCapability::new()
        .script("w3", Script::ok().hang())
        .into_arc();
    let orch = orchestrator(cap, open_security());
    let mut rx = orch.subscribe();
    let run = orch
        .submit_run(
            &fan_out_graph(Quorum::AtLeast(2)),
            AuthorityContext::for_level(AuthorityLevel::A1),
            Bindings::new(),
        )
        .await
        .unwrap();

    wait_for_status(&mut rx, &run, "join", "succeeded").await;
    let statuses = orch.node_statuses(&run).await.unwrap();
    assert_eq!(statuses["w3"], NodeStatus::Running);

    orch.cancel_run(&run).await.unwrap();
    let report = orch.wait(&run).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.nodes["join"], NodeStatus::Succeeded);
    assert_eq!(report.nodes["w3"], NodeStatus::Cancelled);
}

#[tokio::test]
async fn killing_a_branch_makes_full_quorum_unreachable() {
    let cap = ScriptedCapability::new()
        .script("w1", Script::ok().hang())
        .into_arc();
    let orch = orchestrator(cap, open_security());
    let mut rx = orch.subscribe();
    let run = orch
        .submit_run(
            &fan_out_graph(Quorum::All),
            AuthorityContext::for_level(AuthorityLevel::A1),
            Bindings::new(),
        )
        .await
        .unwrap();

    let agent = running_agent(&mut rx, &run, "w1").await;
    orch.kill_agent(&run, &agent).await.unwrap();
    let report = orch.wait(&run).await.unwrap();

    assert_eq!(
        report.nodes["w1"],
        NodeStatus::Failed {
            reason: NodeFailure::Killed
        }
    );
    assert_eq!(report.nodes["w2"], NodeStatus::Succeeded);
    assert_eq!(
        report.nodes["join"],
        NodeStatus::Failed {
            reason: NodeFailure::QuorumUnreachable {
                succeeded: 2,
                required: 3
            }
        }
    );
    assert_eq!(
        report.outcome,
        RunOutcome::Failed {
            reason: RunFailure::QuorumUnreachable {
                node: "join".into()
            }
        }
    );
    let killed = report.agents.iter().find(|a| a.id == agent).unwrap();
    assert_eq!(killed.status, AgentStatus::Killed);
}

#[tokio::test]
async fn missing_permission_denies_only_that_branch() {
    let graph = Graph::new("mixed")
        .node(Node::tool("fetch", "filesystem.read"))
        .node(Node::tool("run", "terminal.execute"))
        .node(Node::tool("list", "filesystem.list"))
        .edge(Edge::new("fetch", "run"))
        .edge(Edge::new("fetch", "list"));
    let cap = ScriptedCapability::new().into_arc();
    let orch = orchestrator(cap.clone(), open_security());
    let mut rx = orch.subscribe();
    let run = orch
        .submit_run(&graph, AuthorityContext::for_level(AuthorityLevel::A1), Bindings::new())
        .await
        .unwrap();

    let denied = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::AuthorizationDenied { .. })).await;
    match denied {
        EngineEvent::AuthorizationDenied { node_id, error, .. } => {
            assert_eq!(node_id, "run");
            assert!(matches!(
                error,
                AuthorizationError::InsufficientAuthority { ref required, level: AuthorityLevel::A1, .. }
                    if required == "execute"
            ));
        }
        _ => unreachable!(),
    }

    let report = orch.wait(&run).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::PartiallyFailed);
    assert_eq!(report.nodes["list"], NodeStatus::Succeeded);
    assert!(matches!(
        report.nodes["run"],
        NodeStatus::Failed {
            reason: NodeFailure::Denied { .. }
        }
    ));
    assert_eq!(report.bindings["run_status"], "failure");
    assert_eq!(cap.call_count("run"), 0);
}

#[tokio::test]
async fn locked_vault_denial_needs_explicit_retry() {
    let graph = Graph::new("vaulted")
        .node(Node::tool("fetch", "filesystem.read"))
        .node(Node::tool("call", "api.request"))
        .node(Node::tool("store", "filesystem.write"))
        .node(Node::agent("slow", "planner", "summarise"))
        .edge(Edge::new("fetch", "call"))
        .edge(Edge::new("call", "store"))
        .edge(Edge::new("fetch", "slow"));
    let cap = ScriptedCapability::new()
        .script("slow", Script::ok().delay_ms(800))
        .into_arc();
    let security: Arc<SecurityMonitor> = locked_security();
    let orch = orchestrator(cap.clone(), security.clone());
    let mut rx = orch.subscribe();
    let run = orch
        .submit_run(&graph, AuthorityContext::for_level(AuthorityLevel::A1), Bindings::new())
        .await
        .unwrap();

    let denied = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::AuthorizationDenied { .. })).await;
    assert!(matches!(
        denied,
        EngineEvent::AuthorizationDenied {
            error: AuthorizationError::VaultLocked,
            ..
        }
    ));
    wait_for_status(&mut rx, &run, "store", "blocked").await;

    // unlocking alone does not revive the failed node
    security.unlock_vault();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let statuses = orch.node_statuses(&run).await.unwrap();
    assert!(statuses["call"].is_failure());
    assert_eq!(cap.call_count("call"), 0);

    orch.retry_node(&run, "call").await.unwrap();
    let report = orch.wait(&run).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.nodes["call"], NodeStatus::Succeeded);
    assert_eq!(report.nodes["store"], NodeStatus::Succeeded);
    assert_eq!(cap.call_count("call"), 1);
}

#[tokio::test]
async fn audit_trail_records_a_run_as_an_intact_chain() {
    let dir = tempfile::tempdir().unwrap();
    let cap = ScriptedCapability::new()
        .script("test", Script::ok().bind("tests_pass", json!(true)))
        .into_arc();
    let orch = orchestrator(cap, open_security());
    let shutdown = CancellationToken::new();
    let sink = AuditSink::new(dir.path().to_path_buf(), 2, 64).spawn(&orch.event_bus(), shutdown.clone());

    let run = orch
        .submit_run(&review_graph(), AuthorityContext::for_level(AuthorityLevel::A2), Bindings::new())
        .await
        .unwrap();
    orch.wait(&run).await.unwrap();
    shutdown.cancel();
    sink.await.unwrap();

    let path = dir.path().join(format!("{}.jsonl", run));
    let count = verify_chain(&path).unwrap();
    assert!(count > 5);

    let content = std::fs::read_to_string(&path).unwrap();
    let records: Vec<AuditRecord> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.first().unwrap().kind, "run_started");
    assert_eq!(records.last().unwrap().kind, "run_completed");
    assert!(records.iter().any(|r| r.kind == "authorization_granted"));
}
