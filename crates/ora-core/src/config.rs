use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OraError, Result};
use crate::security::{AuthorityLevel, VaultStatus};

/// Top-level Ora configuration (`ora.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent agent/tool dispatches per run.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Node activations allowed per run before it fails.
    #[serde(default = "default_max_dispatches")]
    pub max_dispatches: u32,
    /// USD ceiling applied to agents without an override. 0 = unlimited.
    #[serde(default)]
    pub default_agent_budget: f64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Finished runs kept queryable; older ones are forgotten.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            max_dispatches: default_max_dispatches(),
            default_agent_budget: 0.0,
            event_capacity: default_event_capacity(),
            retained_runs: default_retained_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Highest level granted without an external decision.
    #[serde(default = "default_auto_approve_up_to")]
    pub auto_approve_up_to: AuthorityLevel,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            auto_approve_up_to: default_auto_approve_up_to(),
            approval_timeout_secs: default_approval_timeout(),
        }
    }
}

/// Audit sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_audit_dir")]
    pub log_dir: String,
    /// 1 = run and security events, 2 = + node/agent transitions, 3 = + progress.
    #[serde(default = "default_audit_level")]
    pub level: u8,
    #[serde(default = "default_audit_buffer")]
    pub buffer_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            log_dir: default_audit_dir(),
            level: default_audit_level(),
            buffer_capacity: default_audit_buffer(),
        }
    }
}

impl AuditConfig {
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_snapshot_path")]
    pub path: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_snapshot_path(),
        }
    }
}

impl SnapshotConfig {
    pub fn path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// Initial vault state for processes that own the security subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_locked")]
    pub locked: bool,
    #[serde(default = "default_vault_tier")]
    pub tier: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            locked: default_vault_locked(),
            tier: default_vault_tier(),
        }
    }
}

impl VaultConfig {
    pub fn initial_status(&self) -> VaultStatus {
        VaultStatus {
            is_locked: self.locked,
            tier: self.tier.clone(),
            last_unlocked: None,
        }
    }
}

fn default_max_parallelism() -> usize { 4 }
fn default_max_dispatches() -> u32 { 256 }
fn default_event_capacity() -> usize { 1024 }
fn default_retained_runs() -> usize { 32 }
fn default_auto_approve_up_to() -> AuthorityLevel { AuthorityLevel::A2 }
fn default_approval_timeout() -> u64 { 60 }
fn default_audit_enabled() -> bool { true }
fn default_audit_dir() -> String { "~/.ora/audit".to_string() }
fn default_audit_level() -> u8 { 2 }
fn default_audit_buffer() -> usize { 1024 }
fn default_snapshot_path() -> String { "~/.ora/snapshots.db".to_string() }
fn default_vault_locked() -> bool { true }
fn default_vault_tier() -> String { "standard".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OraError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded).map_err(|e| OraError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_parallelism == 0 {
            return Err(OraError::Config("engine.max_parallelism must be at least 1".into()));
        }
        if self.engine.max_dispatches == 0 {
            return Err(OraError::Config("engine.max_dispatches must be at least 1".into()));
        }
        if self.engine.retained_runs == 0 {
            return Err(OraError::Config("engine.retained_runs must be at least 1".into()));
        }
        if self.engine.default_agent_budget < 0.0 {
            return Err(OraError::Config("engine.default_agent_budget cannot be negative".into()));
        }
        if !(1..=3).contains(&self.audit.level) {
            return Err(OraError::Config(format!(
                "audit.level must be 1, 2 or 3 (got {})",
                self.audit.level
            )));
        }
        Ok(())
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => {
                    tracing::warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
