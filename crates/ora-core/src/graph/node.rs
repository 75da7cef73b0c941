use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub config: NodeConfig,
}

/// Kind-specific node configuration, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Agent(AgentConfig),
    Tool(ToolConfig),
    Condition(ConditionConfig),
    Merge(MergeConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_type: String,
    #[serde(default)]
    pub task: String,
    /// Permissions required on top of those the agent type implies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Whether the agent needs vault-held credentials.
    #[serde(default)]
    pub credentials: bool,
    /// USD ceiling overriding the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool_id: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub predicate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub quorum: Quorum,
}

/// How many inbound branches a merge needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quorum {
    /// Every inbound branch that was not pruned.
    #[default]
    All,
    AtLeast(usize),
}

impl Serialize for Quorum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::AtLeast(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Quorum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct QuorumVisitor;

        impl<'de> Visitor<'de> for QuorumVisitor {
            type Value = Quorum;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"all\" or a positive integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Quorum, E> {
                if v.eq_ignore_ascii_case("all") {
                    return Ok(Quorum::All);
                }
                v.parse::<u64>()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
                    .and_then(|n| self.visit_u64(n))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quorum, E> {
                if v == 0 {
                    return Err(E::invalid_value(de::Unexpected::Unsigned(v), &self));
                }
                Ok(Quorum::AtLeast(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quorum, E> {
                if v <= 0 {
                    return Err(E::invalid_value(de::Unexpected::Signed(v), &self));
                }
                self.visit_u64(v as u64)
            }
        }

        deserializer.deserialize_any(QuorumVisitor)
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::AtLeast(n) => write!(f, "{}", n),
        }
    }
}

/// Discriminant of [`NodeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Agent,
    Tool,
    Condition,
    Merge,
}

impl NodeKind {
    /// Agent and tool nodes invoke a capability; the rest resolve inside the engine.
    pub fn is_dispatched(self) -> bool {
        matches!(self, Self::Agent | Self::Tool)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Condition => "condition",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Agent(_) => NodeKind::Agent,
            Self::Tool(_) => NodeKind::Tool,
            Self::Condition(_) => NodeKind::Condition,
            Self::Merge(_) => NodeKind::Merge,
        }
    }
}

impl Node {
    fn with_config(id: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            config,
        }
    }

    /// Create an agent node.
    pub fn agent(id: impl Into<String>, agent_type: impl Into<String>, task: impl Into<String>) -> Self {
        Self::with_config(
            id,
            NodeConfig::Agent(AgentConfig {
                agent_type: agent_type.into(),
                task: task.into(),
                requires: vec![],
                credentials: false,
                budget: None,
            }),
        )
    }

    /// Create a tool node with no arguments.
    pub fn tool(id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self::with_config(
            id,
            NodeConfig::Tool(ToolConfig {
                tool_id: tool_id.into(),
                args: serde_json::Value::Null,
            }),
        )
    }

    /// Create a condition node.
    pub fn condition(id: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self::with_config(
            id,
            NodeConfig::Condition(ConditionConfig {
                predicate: predicate.into(),
            }),
        )
    }

    /// Create a merge node.
    pub fn merge(id: impl Into<String>, quorum: Quorum) -> Self {
        Self::with_config(id, NodeConfig::Merge(MergeConfig { quorum }))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a required permission (agent nodes only).
    pub fn with_requires(mut self, permission: impl Into<String>) -> Self {
        if let NodeConfig::Agent(cfg) = &mut self.config {
            cfg.requires.push(permission.into());
        }
        self
    }

    /// Mark the agent as needing credentials.
    pub fn with_credentials(mut self) -> Self {
        if let NodeConfig::Agent(cfg) = &mut self.config {
            cfg.credentials = true;
        }
        self
    }

    /// Override the agent's budget ceiling.
    pub fn with_budget(mut self, budget: f64) -> Self {
        if let NodeConfig::Agent(cfg) = &mut self.config {
            cfg.budget = Some(budget);
        }
        self
    }

    /// Set tool arguments.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        if let NodeConfig::Tool(cfg) = &mut self.config {
            cfg.args = args;
        }
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
