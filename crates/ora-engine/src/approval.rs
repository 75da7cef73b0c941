use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use ora_core::error::{OraError, Result};
use ora_core::event::EventBus;
use ora_core::security::{EscalationDecision, EscalationRequest};
use ora_core::types::EngineEvent;

/// An escalation waiting for an operator.
struct Waiting {
    request: EscalationRequest,
    reply: oneshot::Sender<EscalationDecision>,
}

/// Routes escalation requests to whoever answers them out of band.
///
/// A request is registered before it is published, so a responder reacting to
/// `EscalationRequested` always finds it.
pub struct EscalationBroker {
    waiting: Mutex<HashMap<String, Waiting>>,
    event_bus: Arc<EventBus>,
}

impl EscalationBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Publish `request` and wait for its decision.
    ///
    /// Resolves to `Ok(())` on approval, `EscalationDenied` on denial, and
    /// `EscalationTimeout` when nobody answers in time.
    pub async fn decide(&self, request: EscalationRequest, timeout: Duration) -> Result<()> {
        let id = request.id.clone();
        let target = request.to;
        info!(request_id = %id, run_id = %request.run_id, from = %request.from, to = %target, "Escalation requested");

        let (reply, decision) = oneshot::channel();
        self.waiting.lock().await.insert(
            id.clone(),
            Waiting {
                request: request.clone(),
                reply,
            },
        );
        self.event_bus
            .publish(EngineEvent::EscalationRequested { request });

        match tokio::time::timeout(timeout, decision).await {
            Ok(Ok(EscalationDecision::Approved)) => Ok(()),
            Ok(Ok(EscalationDecision::Denied { reason })) => {
                Err(OraError::EscalationDenied { target, reason })
            }
            Ok(Err(_)) | Err(_) => {
                // A late answer must not find the request
                self.waiting.lock().await.remove(&id);
                warn!(request_id = %id, "Escalation timed out");
                Err(OraError::EscalationTimeout {
                    target,
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Answer a waiting request. Returns false if it is unknown or already
    /// answered or expired.
    pub async fn respond(&self, request_id: &str, decision: EscalationDecision) -> bool {
        let Some(waiting) = self.waiting.lock().await.remove(request_id) else {
            debug!(request_id, "No escalation waiting under this id");
            return false;
        };
        let approved = matches!(decision, EscalationDecision::Approved);
        info!(request_id, run_id = %waiting.request.run_id, to = %waiting.request.to, approved, "Escalation resolved");
        self.event_bus.publish(EngineEvent::EscalationResolved {
            request_id: request_id.to_string(),
            approved,
        });
        // The requester may have timed out in the meantime
        let _ = waiting.reply.send(decision);
        true
    }

    /// Requests still waiting for a decision.
    pub async fn outstanding(&self) -> Vec<EscalationRequest> {
        self.waiting
            .lock()
            .await
            .values()
            .map(|w| w.request.clone())
            .collect()
    }
}
