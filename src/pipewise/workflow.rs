//! Workflow orchestration.
//!
//! The [`Orchestrator`] is the top-level entry point of the runtime: it
//! accepts a typed [`IncomingEvent`] plus the caller's [`TenantContext`],
//! mints a workflow id, dispatches the initial agent, and follows the
//! handoff chain until a terminal agent produces a typed final result (or
//! a cap, failure, or cancellation ends the workflow first).
//!
//! Each workflow is one logical task; many run concurrently within a
//! process and share the agent registry, tool registry, MCP pool, and
//! memory manager as read-only or internally synchronized collaborators.
//! Within one workflow, message order and handoff order are strictly
//! sequential; across workflows no ordering is guaranteed.
//!
//! # Cancellation
//!
//! Cancellation is cooperative and idempotent: [`Orchestrator::cancel`]
//! trips the workflow's token, the running agent stops after its in-flight
//! LLM response arrives (the result is discarded), remote MCP calls are
//! abandoned, local tools finish, and the workflow is marked `cancelled`
//! and archived. The workflow deadline uses the same mechanism and marks
//! the result `failed(deadline)` instead.

use crate::pipewise::client_wrapper::{LlmClient, Message};
use crate::pipewise::clock::Clock;
use crate::pipewise::config::PipeWiseConfig;
use crate::pipewise::descriptor::AgentRegistry;
use crate::pipewise::event::{emit, EventHandler, WorkflowEvent};
use crate::pipewise::handoff::{HandoffEngine, HandoffError, HandoffRequest};
use crate::pipewise::mcp_client::McpClientPool;
use crate::pipewise::memory::MemoryManager;
use crate::pipewise::runner::{AgentRunner, FailureKind, RunOutcome};
use crate::pipewise::tool_protocol::ToolRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known agent ids wired by the default bootstrap.
pub mod agent_ids {
    pub const COORDINATOR: &str = "coordinator";
    pub const LEAD_QUALIFIER: &str = "lead_qualifier";
    pub const MEETING_SCHEDULER: &str = "meeting_scheduler";
    pub const OUTBOUND_CONTACT: &str = "outbound_contact";
}

/// Opaque workflow identifier, minted at orchestration start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "dm-twitter")]
    TwitterDm,
    #[serde(rename = "dm-instagram")]
    InstagramDm,
    #[serde(rename = "web-form")]
    WebForm,
    #[serde(rename = "chat")]
    Chat,
}

/// Explicit routing intent supplied by the caller, overriding the
/// channel-based default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIntent {
    /// Route straight to the meeting scheduler.
    Schedule,
    /// Route straight to the lead qualifier.
    Qualify,
}

/// A single inbound message or command that starts a workflow.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub channel: Channel,
    /// Sender identifier in the channel's namespace (email address,
    /// handle, session id).
    pub sender: String,
    /// Raw message text.
    pub text: String,
    /// Optional structured lead payload supplied by the ingestion layer.
    pub lead: Option<Value>,
    /// Prior conversation id, when the channel threads messages.
    pub conversation_id: Option<String>,
    /// Explicit routing override.
    pub intent: Option<EventIntent>,
}

impl IncomingEvent {
    pub fn new(channel: Channel, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel,
            sender: sender.into(),
            text: text.into(),
            lead: None,
            conversation_id: None,
            intent: None,
        }
    }

    pub fn with_lead(mut self, lead: Value) -> Self {
        self.lead = Some(lead);
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_intent(mut self, intent: EventIntent) -> Self {
        self.intent = Some(intent);
        self
    }
}

/// Caller identity and entitlements, carried read-only through the entire
/// workflow.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
    pub premium: bool,
    /// Enabled feature tags for this tenant.
    pub features: BTreeSet<String>,
    /// Per-tenant API quotas by quota name.
    pub quotas: BTreeMap<String, u64>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            premium: false,
            features: BTreeSet::new(),
            quotas: BTreeMap::new(),
        }
    }

    pub fn with_premium(mut self, premium: bool) -> Self {
        self.premium = premium;
        self
    }

    pub fn with_feature(mut self, tag: impl Into<String>) -> Self {
        self.features.insert(tag.into());
        self
    }

    pub fn with_quota(mut self, name: impl Into<String>, limit: u64) -> Self {
        self.quotas.insert(name.into(), limit);
        self
    }

    pub fn has_feature(&self, tag: &str) -> bool {
        self.features.contains(tag)
    }

    pub fn quota(&self, name: &str) -> Option<u64> {
        self.quotas.get(name).copied()
    }
}

/// One link in a workflow's handoff chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffChainEntry {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

/// Machine-readable failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFailure {
    InvalidInput,
    UnknownAgent,
    IllegalHandoff,
    HandoffLimit,
    IterationLimit,
    UpstreamError,
    DecodeError,
    Deadline,
}

impl WorkflowFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowFailure::InvalidInput => "invalid_input",
            WorkflowFailure::UnknownAgent => "unknown_agent",
            WorkflowFailure::IllegalHandoff => "illegal_handoff",
            WorkflowFailure::HandoffLimit => "handoff_limit",
            WorkflowFailure::IterationLimit => "iteration_limit",
            WorkflowFailure::UpstreamError => "upstream_error",
            WorkflowFailure::DecodeError => "decode_error",
            WorkflowFailure::Deadline => "deadline",
        }
    }
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity entity tracking one workflow's progress. Owned and mutated by
/// the orchestrator and the handoff engine only.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant: TenantContext,
    pub current_agent: String,
    pub chain: Vec<HandoffChainEntry>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        id: WorkflowId,
        tenant: TenantContext,
        initial_agent: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant,
            current_agent: initial_agent.into(),
            chain: Vec::new(),
            status: WorkflowStatus::Running,
            started_at,
            finished_at: None,
        }
    }
}

/// What the caller gets back from [`Orchestrator::run`]. Never a stack
/// trace: terminal failures carry a machine-readable reason tag.
#[derive(Debug)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    /// The terminal agent's typed output, present iff `status` is
    /// `Completed`.
    pub output: Option<Value>,
    /// Failure reason, present iff `status` is `Failed`.
    pub reason: Option<WorkflowFailure>,
    pub handoff_chain: Vec<HandoffChainEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Top-level workflow engine. One per process; constructor-injected
/// collaborators keep it testable without process-wide state.
pub struct Orchestrator {
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    mcp: Arc<McpClientPool>,
    memory: Arc<MemoryManager>,
    handoffs: Arc<HandoffEngine>,
    llm: Arc<dyn LlmClient>,
    config: Arc<PipeWiseConfig>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<dyn EventHandler>>,
    active: Mutex<HashMap<WorkflowId, CancellationToken>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<AgentRegistry>,
        tools: Arc<ToolRegistry>,
        mcp: Arc<McpClientPool>,
        memory: Arc<MemoryManager>,
        handoffs: Arc<HandoffEngine>,
        llm: Arc<dyn LlmClient>,
        config: Arc<PipeWiseConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents,
            tools,
            mcp,
            memory,
            handoffs,
            llm,
            config,
            clock,
            events: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a telemetry handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Borrow the memory manager (used by hosts to pre-seed lead records).
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Request cancellation of a running workflow. Idempotent; unknown or
    /// already-terminal ids are a no-op.
    pub fn cancel(&self, workflow_id: WorkflowId) {
        if let Some(token) = self.active.lock().unwrap().get(&workflow_id) {
            token.cancel();
        }
    }

    /// Run a workflow to a terminal status.
    pub async fn run(&self, event: IncomingEvent, tenant: TenantContext) -> WorkflowResult {
        self.run_with_cancel(event, tenant, CancellationToken::new())
            .await
    }

    /// Run a workflow with a caller-supplied cancellation token.
    pub async fn run_with_cancel(
        &self,
        event: IncomingEvent,
        tenant: TenantContext,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let workflow_id = WorkflowId::new();
        let started_at = self.clock.now();
        let started = Instant::now();

        if event.sender.trim().is_empty() || event.text.trim().is_empty() {
            return self
                .finish_early(workflow_id, started_at, WorkflowFailure::InvalidInput)
                .await;
        }

        let initial_agent = self.initial_agent(&event);
        if !self.agents.contains(initial_agent) {
            return self
                .finish_early(workflow_id, started_at, WorkflowFailure::UnknownAgent)
                .await;
        }

        self.active
            .lock()
            .unwrap()
            .insert(workflow_id, cancel.clone());
        emit(
            &self.events,
            WorkflowEvent::WorkflowStarted {
                workflow_id,
                tenant_id: tenant.tenant_id.clone(),
                initial_agent: initial_agent.to_string(),
            },
        )
        .await;

        // Deadline watchdog: trips the same cooperative token as a caller
        // cancel, with a flag to tell the two apart at finalization.
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let cancel = cancel.clone();
            let flag = deadline_hit.clone();
            let deadline = self.config.workflow_deadline;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                flag.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let mut workflow = Workflow::new(workflow_id, tenant.clone(), initial_agent, started_at);
        if let Err(e) = self
            .memory
            .save_both(
                initial_agent,
                workflow_id,
                &tenant,
                json!({
                    "channel": event.channel,
                    "sender": event.sender,
                    "text": event.text,
                    "lead": event.lead,
                    "started_at": started_at.to_rfc3339(),
                }),
                &["workflow-start"],
                Value::Null,
                None,
            )
            .await
        {
            log::error!("workflow {}: failed to record start: {}", workflow_id, e);
        }

        let mut conversation = vec![Self::initial_message(&event)];
        let mut pending_post: Option<(HandoffRequest, Instant)> = None;

        let (status, output, reason) = loop {
            let descriptor = match self.agents.get(&workflow.current_agent) {
                Some(descriptor) => descriptor,
                None => break (WorkflowStatus::Failed, None, Some(WorkflowFailure::UnknownAgent)),
            };

            let runner = AgentRunner::new(
                descriptor,
                self.llm.clone(),
                self.tools.clone(),
                self.mcp.clone(),
                self.memory.clone(),
                self.config.clone(),
                self.events.clone(),
            );
            let result = runner
                .run(
                    std::mem::take(&mut conversation),
                    &tenant,
                    workflow_id,
                    &cancel,
                )
                .await;
            conversation = result.conversation;

            if let Some((request, handoff_started)) = pending_post.take() {
                let success = !matches!(result.outcome, RunOutcome::Failed(_));
                self.handoffs
                    .complete_handoff(&request, success, handoff_started.elapsed())
                    .await;
            }

            match result.outcome {
                RunOutcome::Final(value) => {
                    break (WorkflowStatus::Completed, Some(value), None)
                }
                RunOutcome::HandoffPending(request) => {
                    if workflow.chain.len() >= self.config.max_handoffs {
                        break (
                            WorkflowStatus::Failed,
                            None,
                            Some(WorkflowFailure::HandoffLimit),
                        );
                    }
                    match self
                        .handoffs
                        .perform_handoff(&mut workflow, &request, &conversation)
                        .await
                    {
                        Ok(outcome) => {
                            conversation = outcome.carried_context;
                            pending_post = Some((request, Instant::now()));
                        }
                        Err(HandoffError::IllegalHandoff { from, to }) => {
                            log::warn!(
                                "workflow {}: illegal handoff {} -> {}",
                                workflow_id,
                                from,
                                to
                            );
                            break (
                                WorkflowStatus::Failed,
                                None,
                                Some(WorkflowFailure::IllegalHandoff),
                            );
                        }
                        Err(HandoffError::UnknownAgent(_)) => {
                            break (
                                WorkflowStatus::Failed,
                                None,
                                Some(WorkflowFailure::UnknownAgent),
                            )
                        }
                    }
                }
                RunOutcome::Failed(FailureKind::Cancelled) => {
                    if deadline_hit.load(Ordering::SeqCst) {
                        break (
                            WorkflowStatus::Failed,
                            None,
                            Some(WorkflowFailure::Deadline),
                        );
                    }
                    break (WorkflowStatus::Cancelled, None, None);
                }
                RunOutcome::Failed(kind) => {
                    let reason = match kind {
                        FailureKind::IterationLimit => WorkflowFailure::IterationLimit,
                        FailureKind::UpstreamError => WorkflowFailure::UpstreamError,
                        FailureKind::DecodeFailed => WorkflowFailure::DecodeError,
                        FailureKind::Cancelled => unreachable!("handled above"),
                    };
                    break (WorkflowStatus::Failed, None, Some(reason));
                }
            }
        };
        watchdog.abort();

        workflow.status = status;
        let finished_at = self.clock.now();
        workflow.finished_at = Some(finished_at);

        if status == WorkflowStatus::Completed {
            if let Err(e) = self
                .memory
                .save_both(
                    &workflow.current_agent,
                    workflow_id,
                    &tenant,
                    json!({
                        "output": output,
                        "finished_at": finished_at.to_rfc3339(),
                    }),
                    &["workflow-end"],
                    Value::Null,
                    None,
                )
                .await
            {
                log::error!("workflow {}: failed to record end: {}", workflow_id, e);
            }
        }

        // Every exit path archives: volatile records move to the
        // persistent tier and the workflow's volatile footprint is gone.
        if let Err(e) = self.memory.archive(workflow_id).await {
            log::error!("workflow {}: archive failed: {}", workflow_id, e);
        }

        self.active.lock().unwrap().remove(&workflow_id);
        emit(
            &self.events,
            WorkflowEvent::WorkflowCompleted {
                workflow_id,
                status: status.as_str().to_string(),
                reason: reason.map(|r| r.as_str().to_string()),
                duration: started.elapsed(),
            },
        )
        .await;

        WorkflowResult {
            workflow_id,
            status,
            output,
            reason,
            handoff_chain: workflow.chain,
            started_at,
            finished_at,
        }
    }

    /// A failure determined before the workflow ever started an agent.
    async fn finish_early(
        &self,
        workflow_id: WorkflowId,
        started_at: DateTime<Utc>,
        reason: WorkflowFailure,
    ) -> WorkflowResult {
        let finished_at = self.clock.now();
        emit(
            &self.events,
            WorkflowEvent::WorkflowCompleted {
                workflow_id,
                status: WorkflowStatus::Failed.as_str().to_string(),
                reason: Some(reason.as_str().to_string()),
                duration: std::time::Duration::from_secs(0),
            },
        )
        .await;
        WorkflowResult {
            workflow_id,
            status: WorkflowStatus::Failed,
            output: None,
            reason: Some(reason),
            handoff_chain: Vec::new(),
            started_at,
            finished_at,
        }
    }

    /// Initial agent selection: explicit intent wins, otherwise every
    /// inbound channel lands on the coordinator.
    fn initial_agent(&self, event: &IncomingEvent) -> &'static str {
        match event.intent {
            Some(EventIntent::Schedule) => agent_ids::MEETING_SCHEDULER,
            Some(EventIntent::Qualify) => agent_ids::LEAD_QUALIFIER,
            None => match event.channel {
                Channel::Email
                | Channel::Chat
                | Channel::TwitterDm
                | Channel::InstagramDm
                | Channel::WebForm => agent_ids::COORDINATOR,
            },
        }
    }

    /// Render the event into the opening user message, with any structured
    /// lead payload attached as JSON.
    fn initial_message(event: &IncomingEvent) -> Message {
        let mut text = event.text.clone();
        if let Some(lead) = &event.lead {
            text.push_str("\n\nLead payload: ");
            text.push_str(&lead.to_string());
        }
        if let Some(conversation_id) = &event.conversation_id {
            text.push_str("\n\nPrior conversation: ");
            text.push_str(conversation_id);
        }
        Message::user(text)
    }
}
