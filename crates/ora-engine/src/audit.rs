//! Tamper-evident JSONL audit trail.
//!
//! Subscribes to the event bus and appends one record per event to
//! `{log_dir}/{run_id}.jsonl`. Each record carries the SHA-256 of its
//! predecessor, so editing or deleting a line breaks the chain.
//! Events not tied to a run go to `global.jsonl`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ora_core::event::EventBus;
use ora_core::types::EngineEvent;

/// `prev_hash` of the first record in a file.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const GLOBAL_LOG: &str = "global";

/// One line of an audit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Hash of this record with the `hash` field blanked.
    pub fn compute_hash(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.hash.clear();
        let json = serde_json::to_string(&unsigned).unwrap_or_default();
        format!("{:x}", Sha256::digest(json.as_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to read audit file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: not an audit record")]
    Malformed { line: usize },

    #[error("line {line}: prev_hash does not match the preceding record")]
    Broken { line: usize },

    #[error("line {line}: record hash mismatch")]
    Tampered { line: usize },
}

/// Check every link of an audit file. Returns the number of records.
pub fn verify_chain(path: &Path) -> Result<usize, ChainError> {
    let content = std::fs::read_to_string(path)?;
    let mut prev = GENESIS_HASH.to_string();
    let mut count = 0;
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = i + 1;
        let record: AuditRecord =
            serde_json::from_str(line).map_err(|_| ChainError::Malformed { line: line_no })?;
        if record.prev_hash != prev {
            return Err(ChainError::Broken { line: line_no });
        }
        if record.compute_hash() != record.hash {
            return Err(ChainError::Tampered { line: line_no });
        }
        prev = record.hash;
        count += 1;
    }
    Ok(count)
}

/// Event fields extracted for a record, before chaining.
struct Entry {
    log: String,
    run_id: Option<String>,
    node_id: Option<String>,
    agent_id: Option<String>,
    kind: &'static str,
    detail: serde_json::Value,
}

/// Chain position of one open audit file.
struct Chain {
    seq: u64,
    prev_hash: String,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

/// Background audit writer.
///
/// `level` controls verbosity: 1 = run and security events, 2 = + node and
/// agent transitions, 3 = + progress ticks.
pub struct AuditSink {
    log_dir: PathBuf,
    level: u8,
    buffer_capacity: usize,
    chains: HashMap<String, Chain>,
    /// Lines that failed to write, retried before the next record.
    backlog: VecDeque<(String, String)>,
}

impl AuditSink {
    pub fn new(log_dir: PathBuf, level: u8, buffer_capacity: usize) -> Self {
        Self {
            log_dir,
            level,
            buffer_capacity: buffer_capacity.max(1),
            chains: HashMap::new(),
            backlog: VecDeque::new(),
        }
    }

    pub fn path_for(&self, log: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", log))
    }

    /// Subscribe now and write in a background task until cancelled or the
    /// bus closes. No event published after this call is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.consume(rx, cancel))
    }

    async fn consume(mut self, mut rx: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, dir = %self.log_dir.display(), "Failed to create audit directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "Audit sink started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Audit sink cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => self.record(&event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Audit sink lagged, events lost");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, audit sink stopping");
                        break;
                    }
                },
            }
        }

        // Drain whatever is still queued before shutting down
        while let Ok(event) = rx.try_recv() {
            self.record(&event).await;
        }
        self.flush_backlog().await;
        for chain in self.chains.values_mut() {
            if let Some(w) = chain.writer.as_mut() {
                w.flush().await.ok();
            }
        }
        debug!("Audit sink finished");
    }

    /// Append one event, if the level admits it.
    pub async fn record(&mut self, event: &EngineEvent) {
        let Some(entry) = self.entry_for(event) else { return };
        let closes_run = matches!(event, EngineEvent::RunCompleted { .. });
        let log = entry.log.clone();

        self.flush_backlog().await;
        let line = match self.chain_record(entry).await {
            Some(line) => line,
            None => return,
        };
        if self.backlog.iter().any(|(l, _)| *l == log) {
            // Earlier records for this log are still queued
            self.enqueue(log.clone(), line);
        } else if let Err(e) = self.write_line(&log, &line).await {
            error!(log = %log, error = %e, "Failed to write audit record");
            self.enqueue(log.clone(), line);
        }

        if closes_run && self.backlog.iter().all(|(l, _)| *l != log) {
            if let Some(mut chain) = self.chains.remove(&log) {
                if let Some(w) = chain.writer.as_mut() {
                    w.flush().await.ok();
                }
            }
        }
    }

    fn enqueue(&mut self, log: String, line: String) {
        if self.backlog.len() >= self.buffer_capacity {
            if let Some((dropped, _)) = self.backlog.pop_front() {
                warn!(log = %dropped, "Audit backlog full, dropping oldest record");
            }
        }
        self.backlog.push_back((log, line));
    }

    async fn flush_backlog(&mut self) {
        while let Some((log, line)) = self.backlog.pop_front() {
            if let Err(e) = self.write_line(&log, &line).await {
                debug!(log = %log, error = %e, "Audit backlog still failing");
                self.backlog.push_front((log, line));
                return;
            }
        }
    }

    /// Assign sequence and hashes, returning the serialized line.
    async fn chain_record(&mut self, entry: Entry) -> Option<String> {
        let chain = self.chain(&entry.log).await;
        let mut record = AuditRecord {
            seq: chain.seq,
            timestamp: Utc::now().to_rfc3339(),
            run_id: entry.run_id,
            node_id: entry.node_id,
            agent_id: entry.agent_id,
            kind: entry.kind.to_string(),
            detail: entry.detail,
            prev_hash: chain.prev_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        match serde_json::to_string(&record) {
            Ok(json) => {
                chain.seq += 1;
                chain.prev_hash = record.hash;
                Some(json)
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize audit record");
                None
            }
        }
    }

    /// Chain state for a log, recovered from the file's last line if it
    /// already exists.
    async fn chain(&mut self, log: &str) -> &mut Chain {
        if !self.chains.contains_key(log) {
            let path = self.path_for(log);
            let last = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|content| {
                    content
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .and_then(|l| serde_json::from_str::<AuditRecord>(l).ok())
                });
            let chain = match last {
                Some(record) => Chain {
                    seq: record.seq + 1,
                    prev_hash: record.hash,
                    writer: None,
                },
                None => Chain {
                    seq: 0,
                    prev_hash: GENESIS_HASH.to_string(),
                    writer: None,
                },
            };
            self.chains.insert(log.to_string(), chain);
        }
        self.chains
            .entry(log.to_string())
            .or_insert_with(|| Chain {
                seq: 0,
                prev_hash: GENESIS_HASH.to_string(),
                writer: None,
            })
    }

    async fn write_line(&mut self, log: &str, line: &str) -> std::io::Result<()> {
        let path = self.path_for(log);
        let chain = self.chain(log).await;
        if chain.writer.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            chain.writer = Some(tokio::io::BufWriter::new(file));
        }
        let Some(writer) = chain.writer.as_mut() else {
            return Ok(());
        };
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            // Reopen on the next attempt
            chain.writer = None;
        }
        result
    }

    fn entry_for(&self, event: &EngineEvent) -> Option<Entry> {
        let run = event.run_id().map(|r| r.to_string());
        let log = run.clone().unwrap_or_else(|| GLOBAL_LOG.to_string());
        let entry = |kind, node_id: Option<&String>, agent_id: Option<String>, detail| Entry {
            log: log.clone(),
            run_id: run.clone(),
            node_id: node_id.cloned(),
            agent_id,
            kind,
            detail,
        };

        match event {
            // Level 1: run and security events
            EngineEvent::RunStarted { graph_id, .. } => Some(entry(
                "run_started",
                None,
                None,
                serde_json::json!({ "graph_id": graph_id }),
            )),
            EngineEvent::RunCompleted {
                outcome,
                dispatches,
                ..
            } => Some(entry(
                "run_completed",
                None,
                None,
                serde_json::json!({ "outcome": outcome, "dispatches": dispatches }),
            )),
            EngineEvent::RunCancelled { .. } => {
                Some(entry("run_cancelled", None, None, serde_json::Value::Null))
            }
            EngineEvent::AuthorizationGranted { node_id, level, .. } => Some(entry(
                "authorization_granted",
                Some(node_id),
                None,
                serde_json::json!({ "level": level }),
            )),
            EngineEvent::AuthorizationDenied { node_id, error, .. } => Some(entry(
                "authorization_denied",
                Some(node_id),
                None,
                serde_json::json!({ "error": error, "message": error.to_string() }),
            )),
            EngineEvent::EscalationRequested { request } => Some(entry(
                "escalation_requested",
                None,
                None,
                serde_json::json!({
                    "request_id": request.id,
                    "from": request.from,
                    "to": request.to,
                    "reason": request.reason,
                }),
            )),
            EngineEvent::EscalationResolved {
                request_id,
                approved,
            } => Some(entry(
                "escalation_resolved",
                None,
                None,
                serde_json::json!({ "request_id": request_id, "approved": approved }),
            )),
            EngineEvent::AuthorityEscalated { from, to, .. } => Some(entry(
                "authority_escalated",
                None,
                None,
                serde_json::json!({ "from": from, "to": to }),
            )),

            // Level 2: node and agent transitions
            EngineEvent::NodeStatusChanged {
                node_id, status, ..
            } if self.level >= 2 => Some(entry(
                "node_status",
                Some(node_id),
                None,
                serde_json::json!({ "status": status }),
            )),
            EngineEvent::BranchSelected {
                node_id, branch, ..
            } if self.level >= 2 => Some(entry(
                "branch_selected",
                Some(node_id),
                None,
                serde_json::json!({ "branch": branch }),
            )),
            EngineEvent::NodeReentered {
                node_id,
                dispatches,
                ..
            } if self.level >= 2 => Some(entry(
                "node_reentered",
                Some(node_id),
                None,
                serde_json::json!({ "dispatches": dispatches }),
            )),
            EngineEvent::AgentStatusChanged {
                agent_id,
                node_id,
                from,
                to,
                ..
            } if self.level >= 2 => Some(entry(
                "agent_status",
                Some(node_id),
                Some(agent_id.to_string()),
                serde_json::json!({ "from": from, "to": to }),
            )),
            EngineEvent::BudgetExceeded {
                agent_id,
                token_burn,
                budget,
                ..
            } if self.level >= 2 => Some(entry(
                "budget_exceeded",
                None,
                Some(agent_id.to_string()),
                serde_json::json!({ "token_burn": token_burn, "budget": budget }),
            )),

            // Level 3: progress ticks
            EngineEvent::AgentProgress {
                agent_id,
                progress,
                token_burn,
                ..
            } if self.level >= 3 => Some(entry(
                "agent_progress",
                None,
                Some(agent_id.to_string()),
                serde_json::json!({ "progress": progress, "token_burn": token_burn }),
            )),

            _ => None,
        }
    }
}
