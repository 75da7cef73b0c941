pub mod agent;
pub mod approval;
pub mod audit;
pub mod executor;
pub mod gate;
pub mod orchestrator;
pub mod run;
pub mod snapshot;

pub use agent::{AgentControl, AgentInstance, AgentSnapshot, TickOutcome};
pub use approval::EscalationBroker;
pub use audit::{verify_chain, AuditRecord, AuditSink, ChainError};
pub use executor::{RunReport, RunView, SharedAuthority};
pub use gate::AuthorityGate;
pub use orchestrator::Orchestrator;
pub use run::{NodeState, RunSnapshot, RunState};
pub use snapshot::{SnapshotEntry, SnapshotStore};
