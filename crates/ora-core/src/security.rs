use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::traits::SecurityProvider;
use crate::types::RunId;

/// Well-known permission names.
pub mod permission {
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const NETWORK: &str = "network";
    pub const EXECUTE: &str = "execute";
    pub const ESCALATE: &str = "escalate";
    pub const CREDENTIALS: &str = "credentials";
    pub const AUDIT: &str = "audit";
    pub const SYSTEM: &str = "system";
}

/// Authority level A0 (guest) through A5 (root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthorityLevel {
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
}

impl AuthorityLevel {
    pub const ALL: [AuthorityLevel; 6] = [
        Self::A0,
        Self::A1,
        Self::A2,
        Self::A3,
        Self::A4,
        Self::A5,
    ];

    /// Role name for display.
    pub fn role(self) -> &'static str {
        match self {
            Self::A0 => "guest",
            Self::A1 => "user",
            Self::A2 => "developer",
            Self::A3 => "senior",
            Self::A4 => "admin",
            Self::A5 => "root",
        }
    }

    /// Default permission set granted at this level. Each level includes the one below.
    pub fn default_permissions(self) -> BTreeSet<String> {
        use permission::*;
        let mut perms: Vec<&str> = vec![READ];
        if self >= Self::A1 {
            perms.extend([WRITE, NETWORK]);
        }
        if self >= Self::A2 {
            perms.push(EXECUTE);
        }
        if self >= Self::A3 {
            perms.push(ESCALATE);
        }
        if self >= Self::A4 {
            perms.extend([CREDENTIALS, AUDIT]);
        }
        if self >= Self::A5 {
            perms.push(SYSTEM);
        }
        perms.into_iter().map(String::from).collect()
    }
}

impl fmt::Display for AuthorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A0 => "A0",
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::A3 => "A3",
            Self::A4 => "A4",
            Self::A5 => "A5",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AuthorityLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "a0" | "guest" => Ok(Self::A0),
            "a1" | "user" => Ok(Self::A1),
            "a2" | "developer" => Ok(Self::A2),
            "a3" | "senior" => Ok(Self::A3),
            "a4" | "admin" => Ok(Self::A4),
            "a5" | "root" => Ok(Self::A5),
            other => Err(format!("unknown authority level: {}", other)),
        }
    }
}

/// The permission set a run executes under.
///
/// Contexts are immutable once handed to a run; escalation builds a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityContext {
    pub level: AuthorityLevel,
    pub permissions: BTreeSet<String>,
}

impl AuthorityContext {
    /// Context holding exactly the level's default permissions.
    pub fn for_level(level: AuthorityLevel) -> Self {
        Self {
            level,
            permissions: level.default_permissions(),
        }
    }

    /// Grant an extra permission.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Revoke a permission the level would otherwise grant.
    pub fn without_permission(mut self, permission: &str) -> Self {
        self.permissions.remove(permission);
        self
    }

    pub fn has(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// Build the context that replaces this one after escalating to `target`.
    /// Explicit grants survive; revocations are lifted by the new level's defaults.
    pub fn escalated_to(&self, target: AuthorityLevel) -> Self {
        let mut permissions = target.default_permissions();
        permissions.extend(self.permissions.iter().cloned());
        Self {
            level: target,
            permissions,
        }
    }
}

/// The six process-wide security gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateName {
    PromptInjection,
    ShellSanitizer,
    Sandbox,
    Credentials,
    Network,
    Workspace,
}

impl GateName {
    pub const ALL: [GateName; 6] = [
        Self::PromptInjection,
        Self::ShellSanitizer,
        Self::Sandbox,
        Self::Credentials,
        Self::Network,
        Self::Workspace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptInjection => "prompt-injection",
            Self::ShellSanitizer => "shell-sanitizer",
            Self::Sandbox => "sandbox",
            Self::Credentials => "credentials",
            Self::Network => "network",
            Self::Workspace => "workspace",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GateName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        GateName::ALL
            .into_iter()
            .find(|g| g.as_str() == s.trim())
            .ok_or_else(|| format!("unknown security gate: {}", s))
    }
}

/// Health of a security gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Secure,
    Warning,
    Breach,
}

/// A named security checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGate {
    pub name: GateName,
    pub status: GateStatus,
    pub last_check: DateTime<Utc>,
    pub threat_count: u32,
}

impl SecurityGate {
    pub fn secure(name: GateName) -> Self {
        Self {
            name,
            status: GateStatus::Secure,
            last_check: Utc::now(),
            threat_count: 0,
        }
    }
}

/// Point-in-time copy of every gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSnapshot {
    pub gates: BTreeMap<GateName, SecurityGate>,
}

impl GateSnapshot {
    /// All six gates reporting secure.
    pub fn all_secure() -> Self {
        let gates = GateName::ALL
            .into_iter()
            .map(|name| (name, SecurityGate::secure(name)))
            .collect();
        Self { gates }
    }

    pub fn get(&self, name: GateName) -> Option<&SecurityGate> {
        self.gates.get(&name)
    }

    /// Set a gate's status, bumping its threat count on anything but secure.
    pub fn set_status(&mut self, name: GateName, status: GateStatus) {
        let gate = self
            .gates
            .entry(name)
            .or_insert_with(|| SecurityGate::secure(name));
        if status != GateStatus::Secure {
            gate.threat_count += 1;
        }
        gate.status = status;
        gate.last_check = Utc::now();
    }

    /// Builder-style variant of [`set_status`](Self::set_status).
    pub fn with_status(mut self, name: GateName, status: GateStatus) -> Self {
        self.set_status(name, status);
        self
    }
}

/// Lock state of the credential vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub is_locked: bool,
    pub tier: String,
    #[serde(default)]
    pub last_unlocked: Option<DateTime<Utc>>,
}

impl VaultStatus {
    pub fn locked() -> Self {
        Self {
            is_locked: true,
            tier: "standard".to_string(),
            last_unlocked: None,
        }
    }

    pub fn unlocked() -> Self {
        Self {
            is_locked: false,
            tier: "standard".to_string(),
            last_unlocked: Some(Utc::now()),
        }
    }
}

/// What a node dispatch needs in order to proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    pub permissions: BTreeSet<String>,
    pub requires_credentials: bool,
    pub gates: BTreeSet<GateName>,
}

impl Action {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn consult(mut self, gate: GateName) -> Self {
        self.gates.insert(gate);
        self
    }

    pub fn with_credentials(mut self) -> Self {
        self.requires_credentials = true;
        self.gates.insert(GateName::Credentials);
        self
    }
}

/// Reason the gate refused an action.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorizationError {
    #[error("security gate {gate} reports a breach")]
    SecurityBreach { gate: GateName },

    #[error("insufficient authority: requires '{required}' (have {level}: {})", .have.join(", "))]
    InsufficientAuthority {
        required: String,
        level: AuthorityLevel,
        have: Vec<String>,
    },

    #[error("credential vault is locked")]
    VaultLocked,
}

/// Decision from the authority gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(AuthorizationError),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decide whether `action` may run. Rules apply in order; the first failure wins:
/// breached gate, missing permission, locked vault.
///
/// A consulted gate that is absent from the snapshot counts as breached.
pub fn authorize(
    action: &Action,
    authority: &AuthorityContext,
    gates: &GateSnapshot,
    vault: &VaultStatus,
) -> AuthDecision {
    for gate in &action.gates {
        let breached = gates
            .get(*gate)
            .map_or(true, |g| g.status == GateStatus::Breach);
        if breached {
            return AuthDecision::Deny(AuthorizationError::SecurityBreach { gate: *gate });
        }
    }

    if let Some(missing) = action.permissions.iter().find(|p| !authority.has(p)) {
        return AuthDecision::Deny(AuthorizationError::InsufficientAuthority {
            required: missing.clone(),
            level: authority.level,
            have: authority.permissions.iter().cloned().collect(),
        });
    }

    if action.requires_credentials && vault.is_locked {
        return AuthDecision::Deny(AuthorizationError::VaultLocked);
    }

    AuthDecision::Allow
}

/// A pending escalation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    pub run_id: RunId,
    pub from: AuthorityLevel,
    pub to: AuthorityLevel,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Decision on an escalation request.
#[derive(Debug, Clone)]
pub enum EscalationDecision {
    Approved,
    Denied { reason: String },
}

/// Publishes gate and vault state to the engine.
///
/// The security subsystem owns the sender side and is the only writer; the
/// engine reads through [`SecurityProvider`].
pub struct SecurityMonitor {
    gates: watch::Sender<GateSnapshot>,
    vault: watch::Sender<VaultStatus>,
}

impl SecurityMonitor {
    pub fn new(gates: GateSnapshot, vault: VaultStatus) -> Self {
        let (gates, _) = watch::channel(gates);
        let (vault, _) = watch::channel(vault);
        Self { gates, vault }
    }

    pub fn set_gate(&self, name: GateName, status: GateStatus) {
        self.gates.send_modify(|snapshot| snapshot.set_status(name, status));
    }

    pub fn lock_vault(&self) {
        self.vault.send_modify(|v| v.is_locked = true);
    }

    pub fn unlock_vault(&self) {
        self.vault.send_modify(|v| {
            v.is_locked = false;
            v.last_unlocked = Some(Utc::now());
        });
    }

    pub fn subscribe_gates(&self) -> watch::Receiver<GateSnapshot> {
        self.gates.subscribe()
    }

    pub fn subscribe_vault(&self) -> watch::Receiver<VaultStatus> {
        self.vault.subscribe()
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new(GateSnapshot::all_secure(), VaultStatus::locked())
    }
}

impl SecurityProvider for SecurityMonitor {
    fn current_vault_status(&self) -> VaultStatus {
        self.vault.borrow().clone()
    }

    fn current_gate_snapshot(&self) -> GateSnapshot {
        self.gates.borrow().clone()
    }
}
