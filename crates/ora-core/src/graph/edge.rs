use std::fmt;

use serde::{Deserialize, Serialize};

/// A directed edge between two nodes.
///
/// Edges leaving a condition node carry a branch label; all other edges are
/// unlabeled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Create an unlabeled edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }

    /// Create a condition branch edge.
    pub fn branch(from: impl Into<String>, to: impl Into<String>, branch: Branch) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: Some(branch.as_str().to_string()),
        }
    }

    /// The branch this edge's label names, if it names one.
    pub fn branch_label(&self) -> Option<Branch> {
        self.label.as_deref().and_then(Branch::parse)
    }
}

/// Outcome of a condition node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Yes,
    No,
}

impl Branch {
    /// Parse a branch label. `true`/`false` are accepted as aliases.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(Self::Yes),
            "no" | "false" => Some(Self::No),
            _ => None,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
