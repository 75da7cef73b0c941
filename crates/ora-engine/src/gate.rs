use std::sync::Arc;

use tracing::{debug, warn};

use ora_core::event::EventBus;
use ora_core::graph::{action_for, Node};
use ora_core::security::{authorize, AuthDecision, AuthorityContext};
use ora_core::traits::SecurityProvider;
use ora_core::types::{EngineEvent, RunId};

/// Checks every dispatch against fresh gate and vault readings.
pub struct AuthorityGate {
    security: Arc<dyn SecurityProvider>,
    event_bus: Arc<EventBus>,
}

impl AuthorityGate {
    pub fn new(security: Arc<dyn SecurityProvider>, event_bus: Arc<EventBus>) -> Self {
        Self {
            security,
            event_bus,
        }
    }

    /// Decide whether `node` may be dispatched under `authority`.
    ///
    /// Condition and merge nodes need no authorization and always pass
    /// without an event.
    pub fn check(&self, run_id: &RunId, node: &Node, authority: &AuthorityContext) -> AuthDecision {
        let Some(action) = action_for(&node.config) else {
            return AuthDecision::Allow;
        };

        let gates = self.security.current_gate_snapshot();
        let vault = self.security.current_vault_status();
        let decision = authorize(&action, authority, &gates, &vault);

        match &decision {
            AuthDecision::Allow => {
                debug!(run_id = %run_id, node_id = %node.id, level = %authority.level, "Dispatch authorized");
                self.event_bus.publish(EngineEvent::AuthorizationGranted {
                    run_id: run_id.clone(),
                    node_id: node.id.clone(),
                    level: authority.level,
                });
            }
            AuthDecision::Deny(error) => {
                warn!(run_id = %run_id, node_id = %node.id, %error, "Dispatch denied");
                self.event_bus.publish(EngineEvent::AuthorizationDenied {
                    run_id: run_id.clone(),
                    node_id: node.id.clone(),
                    error: error.clone(),
                });
            }
        }
        decision
    }
}
