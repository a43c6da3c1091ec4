//! Agent-to-agent handoffs.
//!
//! A handoff moves control of a workflow from one agent to another while
//! carrying the conversation and relevant context across. The engine
//! enforces the handoff graph declared by the
//! [`AgentDescriptor`](crate::pipewise::descriptor::AgentDescriptor)s,
//! records every transfer in both memory tiers, and fires instrumentation
//! callbacks around the transfer.
//!
//! Context transfer and instrumentation are deliberately separate concerns:
//! the carried context is the return value of
//! [`perform_handoff`](HandoffEngine::perform_handoff); the callbacks exist
//! only to observe. A callback failure is logged and never aborts the
//! handoff.

use crate::pipewise::client_wrapper::Message;
use crate::pipewise::clock::Clock;
use crate::pipewise::descriptor::{AgentDescriptor, AgentRegistry};
use crate::pipewise::event::{emit, EventHandler, WorkflowEvent};
use crate::pipewise::memory::{MemoryManager, MemoryQuery};
use crate::pipewise::workflow::{HandoffChainEntry, Workflow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How many of the source agent's most recent memory records ride along
/// with a handoff.
const CARRIED_MEMORY_LIMIT: usize = 5;

/// Urgency attached to a handoff request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffPriority {
    Low,
    Normal,
    High,
}

impl Default for HandoffPriority {
    fn default() -> Self {
        HandoffPriority::Normal
    }
}

/// A request to transfer control, emitted by the runner when the model
/// invokes a synthetic `handoff_to_<agent>` tool.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub from_agent: String,
    pub to_agent: String,
    /// Short free-text justification from the model.
    pub reason: String,
    pub priority: HandoffPriority,
    /// Opaque JSON the source agent wants the target to see.
    pub additional_context: Value,
}

/// The engine's answer to a legal handoff.
#[derive(Debug)]
pub struct HandoffOutcome {
    pub next_agent: Arc<AgentDescriptor>,
    /// Conversation the target agent starts from: the prior conversation,
    /// the request's additional context, and the source agent's most
    /// recent memory records.
    pub carried_context: Vec<Message>,
}

/// Instrumentation hooks around a handoff.
///
/// Callbacks run inline with the workflow, so they must not block
/// indefinitely. Failures (panics excepted) are the implementor's to
/// signal via logs; the engine proceeds regardless.
#[async_trait]
pub trait HandoffCallback: Send + Sync {
    /// Fired after the transfer is recorded, before the target agent runs.
    async fn before_handoff(&self, _request: &HandoffRequest) {}

    /// Fired after the target agent finishes its contribution.
    async fn after_handoff(&self, _request: &HandoffRequest, _success: bool, _elapsed: Duration) {}
}

/// Errors surfaced by [`HandoffEngine::perform_handoff`].
#[derive(Debug)]
pub enum HandoffError {
    /// The target is not in the source agent's allowed-handoff set.
    IllegalHandoff { from: String, to: String },
    /// The target agent id is not registered at all.
    UnknownAgent(String),
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::IllegalHandoff { from, to } => {
                write!(f, "agent {} may not hand off to {}", from, to)
            }
            HandoffError::UnknownAgent(id) => write!(f, "unknown agent: {}", id),
        }
    }
}

impl Error for HandoffError {}

/// Executes context-carrying transfers between agents.
pub struct HandoffEngine {
    agents: Arc<AgentRegistry>,
    memory: Arc<MemoryManager>,
    clock: Arc<dyn Clock>,
    callbacks: HashMap<(String, String), Arc<dyn HandoffCallback>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl HandoffEngine {
    pub fn new(
        agents: Arc<AgentRegistry>,
        memory: Arc<MemoryManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents,
            memory,
            clock,
            callbacks: HashMap::new(),
            events: None,
        }
    }

    /// Attach a telemetry handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register an instrumentation callback for one `(from, to)` agent
    /// pair. Later registrations for the same pair replace earlier ones.
    pub fn register_callback(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        callback: Arc<dyn HandoffCallback>,
    ) {
        self.callbacks.insert((from.into(), to.into()), callback);
    }

    /// Whether `from` may hand off to `to`.
    pub fn can_handoff(&self, from: &str, to: &str) -> bool {
        self.agents.can_handoff(from, to)
    }

    /// Execute a handoff.
    ///
    /// On success the workflow's chain has a new entry, both memory tiers
    /// carry a `handoff` record, the pre-handoff callback has fired, and
    /// the returned outcome names the next agent and its starting
    /// conversation.
    pub async fn perform_handoff(
        &self,
        workflow: &mut Workflow,
        request: &HandoffRequest,
        conversation: &[Message],
    ) -> Result<HandoffOutcome, HandoffError> {
        let next_agent = self
            .agents
            .get(&request.to_agent)
            .ok_or_else(|| HandoffError::UnknownAgent(request.to_agent.clone()))?;
        if !self.can_handoff(&request.from_agent, &request.to_agent) {
            return Err(HandoffError::IllegalHandoff {
                from: request.from_agent.clone(),
                to: request.to_agent.clone(),
            });
        }

        let started_at = self.clock.now();
        workflow.chain.push(HandoffChainEntry {
            from: request.from_agent.clone(),
            to: request.to_agent.clone(),
            at: started_at,
            reason: request.reason.clone(),
        });
        workflow.current_agent = request.to_agent.clone();

        let handoff_content = json!({
            "from": request.from_agent,
            "to": request.to_agent,
            "reason": request.reason,
            "priority": request.priority,
            "additional_context": request.additional_context,
            "started_at": started_at.to_rfc3339(),
        });
        if let Err(e) = self
            .memory
            .save_both(
                &request.from_agent,
                workflow.id,
                &workflow.tenant,
                handoff_content,
                &["handoff"],
                Value::Null,
                None,
            )
            .await
        {
            // The transfer itself still proceeds; the record is telemetry.
            log::error!("failed to record handoff {} -> {}: {}",
                request.from_agent, request.to_agent, e);
        }

        if let Some(callback) = self
            .callbacks
            .get(&(request.from_agent.clone(), request.to_agent.clone()))
        {
            callback.before_handoff(request).await;
        }

        emit(
            &self.events,
            WorkflowEvent::HandoffPerformed {
                workflow_id: workflow.id,
                from_agent: request.from_agent.clone(),
                to_agent: request.to_agent.clone(),
                reason: request.reason.clone(),
            },
        )
        .await;

        let carried_context = self.carry_context(workflow, request, conversation).await;
        Ok(HandoffOutcome {
            next_agent,
            carried_context,
        })
    }

    /// Fire the post-handoff callback after the target agent finished its
    /// contribution.
    pub async fn complete_handoff(
        &self,
        request: &HandoffRequest,
        success: bool,
        elapsed: Duration,
    ) {
        if let Some(callback) = self
            .callbacks
            .get(&(request.from_agent.clone(), request.to_agent.clone()))
        {
            callback.after_handoff(request, success, elapsed).await;
        }
    }

    async fn carry_context(
        &self,
        workflow: &Workflow,
        request: &HandoffRequest,
        conversation: &[Message],
    ) -> Vec<Message> {
        let mut carried = conversation.to_vec();

        let mut briefing = format!(
            "Control transferred from agent '{}'. Reason: {}",
            request.from_agent, request.reason
        );
        if !request.additional_context.is_null() {
            briefing.push_str(&format!(
                "\nAdditional context: {}",
                request.additional_context
            ));
        }

        let recent = self.memory.volatile().query(
            &MemoryQuery::new()
                .agent(&request.from_agent)
                .workflow(workflow.id)
                .tenant(&workflow.tenant.tenant_id),
        );
        if !recent.is_empty() {
            let notes: Vec<&Value> = recent
                .iter()
                .take(CARRIED_MEMORY_LIMIT)
                .map(|record| &record.content)
                .collect();
            briefing.push_str(&format!(
                "\nRecent notes from '{}': {}",
                request.from_agent,
                Value::Array(notes.into_iter().cloned().collect())
            ));
        }

        carried.push(Message::user(briefing));
        carried
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipewise::clock::ManualClock;
    use crate::pipewise::descriptor::AgentDescriptor;
    use crate::pipewise::memory::{InMemoryPersistentBackend, VolatileMemoryStore};
    use crate::pipewise::tool_protocol::ToolRegistry;
    use crate::pipewise::workflow::{TenantContext, Workflow, WorkflowId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> (Arc<MemoryManager>, HandoffEngine) {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::starting_now());
        let volatile = Arc::new(VolatileMemoryStore::new(
            clock.clone(),
            Duration::from_secs(3600),
        ));
        let persistent = Arc::new(InMemoryPersistentBackend::new());
        let memory = Arc::new(MemoryManager::new(volatile, persistent, clock.clone()));

        let tools = ToolRegistry::new();
        let mut agents = AgentRegistry::new();
        agents
            .register(
                AgentDescriptor::new("coordinator", "Coordinator", "Route messages.")
                    .with_handoff("lead_qualifier"),
                &tools,
            )
            .unwrap();
        agents
            .register(
                AgentDescriptor::new("lead_qualifier", "Lead Qualifier", "Qualify leads."),
                &tools,
            )
            .unwrap();
        agents.validate_handoffs().unwrap();

        let engine = HandoffEngine::new(Arc::new(agents), memory.clone(), clock);
        (memory, engine)
    }

    fn workflow() -> Workflow {
        Workflow::new(
            WorkflowId::new(),
            TenantContext::new("tenant-a", "user-1"),
            "coordinator",
            chrono::Utc::now(),
        )
    }

    fn request(from: &str, to: &str) -> HandoffRequest {
        HandoffRequest {
            from_agent: from.into(),
            to_agent: to.into(),
            reason: "needs qualification".into(),
            priority: HandoffPriority::Normal,
            additional_context: json!({"lead_id": "L-001"}),
        }
    }

    #[tokio::test]
    async fn legal_handoff_updates_chain_and_memory() {
        let (memory, engine) = engine();
        let mut wf = workflow();
        let conversation = vec![Message::user("hola")];

        let outcome = engine
            .perform_handoff(&mut wf, &request("coordinator", "lead_qualifier"), &conversation)
            .await
            .unwrap();

        assert_eq!(outcome.next_agent.id, "lead_qualifier");
        assert_eq!(wf.current_agent, "lead_qualifier");
        assert_eq!(wf.chain.len(), 1);
        assert_eq!(wf.chain[0].to, "lead_qualifier");
        // Conversation plus the carried briefing.
        assert_eq!(outcome.carried_context.len(), 2);
        let briefing = outcome.carried_context.last().unwrap();
        assert!(briefing.content.contains("lead_id"));

        let snapshot = memory
            .workflow_context(wf.id, &wf.tenant)
            .await
            .unwrap();
        assert!(snapshot
            .volatile
            .iter()
            .any(|r| r.tags.contains("handoff")));
        assert!(snapshot
            .persistent
            .iter()
            .any(|r| r.tags.contains("handoff")));
    }

    #[tokio::test]
    async fn illegal_handoff_is_rejected() {
        let (_memory, engine) = engine();
        let mut wf = workflow();
        let err = engine
            .perform_handoff(&mut wf, &request("lead_qualifier", "coordinator"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::IllegalHandoff { .. }));
        assert!(wf.chain.is_empty());
    }

    #[tokio::test]
    async fn callbacks_fire_around_the_transfer() {
        struct Counter {
            before: AtomicUsize,
            after: AtomicUsize,
        }

        #[async_trait]
        impl HandoffCallback for Counter {
            async fn before_handoff(&self, _request: &HandoffRequest) {
                self.before.fetch_add(1, Ordering::SeqCst);
            }
            async fn after_handoff(
                &self,
                _request: &HandoffRequest,
                success: bool,
                _elapsed: Duration,
            ) {
                assert!(success);
                self.after.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_memory, mut engine) = engine();
        let counter = Arc::new(Counter {
            before: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
        });
        engine.register_callback("coordinator", "lead_qualifier", counter.clone());

        let mut wf = workflow();
        let req = request("coordinator", "lead_qualifier");
        engine.perform_handoff(&mut wf, &req, &[]).await.unwrap();
        assert_eq!(counter.before.load(Ordering::SeqCst), 1);
        assert_eq!(counter.after.load(Ordering::SeqCst), 0);

        engine
            .complete_handoff(&req, true, Duration::from_millis(5))
            .await;
        assert_eq!(counter.after.load(Ordering::SeqCst), 1);
    }
}
