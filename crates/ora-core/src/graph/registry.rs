//! Fixed tool registry and agent type table.

use crate::security::{permission, Action, GateName};

use super::node::{AgentConfig, NodeConfig, ToolConfig};

/// A registered tool and what invoking it requires.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub id: &'static str,
    pub permission: &'static str,
    pub credentials: bool,
    pub gates: &'static [GateName],
}

const fn spec(
    id: &'static str,
    permission: &'static str,
    credentials: bool,
    gates: &'static [GateName],
) -> ToolSpec {
    ToolSpec {
        id,
        permission,
        credentials,
        gates,
    }
}

use GateName::*;

pub const TOOLS: &[ToolSpec] = &[
    spec("filesystem.read", permission::READ, false, &[Workspace]),
    spec("filesystem.list", permission::READ, false, &[Workspace]),
    spec("filesystem.write", permission::WRITE, false, &[Workspace]),
    spec("filesystem.delete", permission::WRITE, false, &[Workspace, Sandbox]),
    spec("terminal.execute", permission::EXECUTE, false, &[ShellSanitizer, Sandbox]),
    spec("web_search.search", permission::NETWORK, false, &[Network, PromptInjection]),
    spec("browser.navigate", permission::NETWORK, false, &[Network, PromptInjection]),
    spec("code_analyzer.analyze", permission::READ, false, &[Workspace]),
    spec("code_analyzer.execute", permission::EXECUTE, false, &[Sandbox]),
    spec("api.request", permission::NETWORK, true, &[Network, Credentials]),
    spec("git.push", permission::WRITE, true, &[Network, Credentials, Workspace]),
];

/// Known agent types and the permissions each implies.
pub const AGENT_TYPES: &[(&str, &[&str])] = &[
    ("planner", &[permission::READ]),
    ("researcher", &[permission::READ, permission::NETWORK]),
    ("builder", &[permission::READ, permission::WRITE]),
    ("tester", &[permission::READ, permission::EXECUTE]),
    ("integrator", &[permission::WRITE, permission::EXECUTE]),
    ("security", &[permission::READ, permission::AUDIT]),
    ("selfdev", &[permission::READ, permission::WRITE]),
];

pub fn tool(id: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.id == id)
}

pub fn agent_permissions(agent_type: &str) -> Option<&'static [&'static str]> {
    AGENT_TYPES
        .iter()
        .find(|(name, _)| *name == agent_type)
        .map(|(_, perms)| *perms)
}

/// Gates a permission implies for agent actions.
fn implied_gates(permission: &str) -> &'static [GateName] {
    match permission {
        permission::WRITE => &[Workspace],
        permission::EXECUTE => &[ShellSanitizer, Sandbox],
        permission::NETWORK => &[Network],
        _ => &[],
    }
}

fn agent_action(cfg: &AgentConfig) -> Option<Action> {
    let implied = agent_permissions(&cfg.agent_type)?;
    let mut action = Action::new().consult(PromptInjection);
    for perm in implied.iter().copied().chain(cfg.requires.iter().map(String::as_str)) {
        action = action.require(perm);
        for gate in implied_gates(perm) {
            action = action.consult(*gate);
        }
    }
    if cfg.credentials {
        action = action.with_credentials();
    }
    Some(action)
}

fn tool_action(cfg: &ToolConfig) -> Option<Action> {
    let spec = tool(&cfg.tool_id)?;
    let mut action = Action::new().require(spec.permission);
    for gate in spec.gates {
        action = action.consult(*gate);
    }
    if spec.credentials {
        action = action.with_credentials();
    }
    Some(action)
}

/// The action a dispatched node must be authorized for.
///
/// `None` for condition and merge nodes, and for unknown tools or agent types
/// (which validation rejects).
pub fn action_for(config: &NodeConfig) -> Option<Action> {
    match config {
        NodeConfig::Agent(cfg) => agent_action(cfg),
        NodeConfig::Tool(cfg) => tool_action(cfg),
        NodeConfig::Condition(_) | NodeConfig::Merge(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    #[test]
    fn registry_lookup() {
        assert_eq!(TOOLS.len(), 11);
        let t = tool("terminal.execute").unwrap();
        assert_eq!(t.permission, "execute");
        assert!(tool("terminal.nuke").is_none());
        assert!(agent_permissions("planner").is_some());
        assert!(agent_permissions("wizard").is_none());
    }

    #[test]
    fn tool_action_uses_table() {
        let action = action_for(&Node::tool("p", "git.push").config).unwrap();
        assert!(action.permissions.contains("write"));
        assert!(action.requires_credentials);
        assert!(action.gates.contains(&Credentials));
        assert!(action.gates.contains(&Network));
        assert!(!action.gates.contains(&PromptInjection));
    }

    #[test]
    fn agent_action_implies_gates() {
        let node = Node::agent("t", "tester", "run tests");
        let action = action_for(&node.config).unwrap();
        assert!(action.permissions.contains("execute"));
        assert!(action.gates.contains(&PromptInjection));
        assert!(action.gates.contains(&Sandbox));
        assert!(action.gates.contains(&ShellSanitizer));
        assert!(!action.requires_credentials);
    }

    #[test]
    fn agent_requires_and_credentials() {
        let node = Node::agent("r", "planner", "plan")
            .with_requires("network")
            .with_credentials();
        let action = action_for(&node.config).unwrap();
        assert!(action.permissions.contains("network"));
        assert!(action.gates.contains(&Network));
        assert!(action.requires_credentials);
        assert!(action.gates.contains(&Credentials));
    }

    #[test]
    fn condition_and_unknown_have_no_action() {
        assert!(action_for(&Node::condition("c", "x").config).is_none());
        assert!(action_for(&Node::agent("a", "wizard", "").config).is_none());
    }
}
