use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ora_core::types::{AgentId, AgentStatus};

/// Control operations on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentControl {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Kill,
}

impl AgentControl {
    fn target(self) -> AgentStatus {
        match self {
            Self::Start | Self::Resume => AgentStatus::Running,
            Self::Pause => AgentStatus::Paused,
            Self::Complete => AgentStatus::Completed,
            Self::Fail => AgentStatus::Error,
            Self::Kill => AgentStatus::Killed,
        }
    }

    fn allowed_from(self) -> &'static [AgentStatus] {
        use AgentStatus::*;
        match self {
            Self::Start => &[Idle],
            Self::Pause => &[Running],
            Self::Resume => &[Paused],
            Self::Complete | Self::Fail => &[Running],
            Self::Kill => &[Idle, Running, Paused],
        }
    }
}

/// A status change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Result of applying a progress tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Agent not running; nothing recorded.
    Ignored,
    Recorded { progress: u8, token_burn: f64 },
    /// Spend passed the ceiling. The agent is now in `error`.
    BudgetExceeded { token_burn: f64, budget: f64 },
}

/// Copy of an agent's state for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub agent_type: String,
    pub node_id: String,
    pub status: AgentStatus,
    pub progress: u8,
    pub token_burn: f64,
    pub budget: Option<f64>,
}

/// One agent instance: lifecycle, progress and token budget.
///
/// Created per dispatch and never reused. Terminal states (`completed`,
/// `error`, `killed`) accept no further transitions.
#[derive(Debug, Clone)]
pub struct AgentInstance {
    id: AgentId,
    agent_type: String,
    node_id: String,
    status: AgentStatus,
    progress: u8,
    token_burn: f64,
    budget: Option<f64>,
}

impl AgentInstance {
    /// `budget` of zero or less means unlimited.
    pub fn new(node_id: impl Into<String>, agent_type: impl Into<String>, budget: f64) -> Self {
        Self {
            id: AgentId::new(),
            agent_type: agent_type.into(),
            node_id: node_id.into(),
            status: AgentStatus::Idle,
            progress: 0,
            token_burn: 0.0,
            budget: (budget > 0.0).then_some(budget),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn token_burn(&self) -> f64 {
        self.token_burn
    }

    pub fn budget(&self) -> Option<f64> {
        self.budget
    }

    /// Apply a control operation. Returns `None`, logging a warning, when the
    /// current state does not allow it.
    pub fn apply(&mut self, control: AgentControl) -> Option<Transition> {
        if !control.allowed_from().contains(&self.status) {
            warn!(
                agent_id = %self.id,
                node_id = %self.node_id,
                status = %self.status,
                ?control,
                "Ignoring agent control in current state"
            );
            return None;
        }
        let from = self.status;
        self.status = control.target();
        debug!(agent_id = %self.id, %from, to = %self.status, "Agent transition");
        Some(Transition {
            from,
            to: self.status,
        })
    }

    /// Record a progress report. Ticks are only honoured while running;
    /// negative spend is ignored.
    pub fn tick(&mut self, progress: u8, token_delta: f64) -> TickOutcome {
        if self.status != AgentStatus::Running {
            return TickOutcome::Ignored;
        }
        if token_delta.is_finite() && token_delta > 0.0 {
            self.token_burn += token_delta;
        }
        self.progress = progress.min(100);

        if let Some(budget) = self.budget {
            if self.token_burn > budget {
                self.status = AgentStatus::Error;
                warn!(
                    agent_id = %self.id,
                    node_id = %self.node_id,
                    token_burn = self.token_burn,
                    budget,
                    "Agent exceeded token budget"
                );
                return TickOutcome::BudgetExceeded {
                    token_burn: self.token_burn,
                    budget,
                };
            }
        }
        TickOutcome::Recorded {
            progress: self.progress,
            token_burn: self.token_burn,
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            node_id: self.node_id.clone(),
            status: self.status,
            progress: self.progress,
            token_burn: self.token_burn,
            budget: self.budget,
        }
    }
}
