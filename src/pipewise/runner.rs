//! The agent tool-calling loop.
//!
//! An [`AgentRunner`] drives one agent through `think → call tool → observe`
//! cycles against the LLM until a typed final answer or a handoff request
//! is produced. The runner composes every request itself (system prompt
//! from the descriptor, the conversation so far, the tool schemas the agent
//! is scoped to, plus one synthetic `handoff_to_<id>` tool per allowed
//! handoff target) and resolves the model's tool calls through the tool
//! registry (local) or the MCP pool (remote).
//!
//! # Ordering
//!
//! Tool calls within one assistant message are dispatched concurrently but
//! their results are appended to the conversation **in the order the model
//! emitted them**, regardless of which completed first. Every tool call is
//! answered by exactly one tool-role message before the next assistant
//! message is requested.
//!
//! # Determinism
//!
//! Given identical inputs and a deterministic LLM, the runner produces the
//! same tool-call sequence: it introduces no ordering or sampling choices
//! of its own beyond I/O failure handling.

use crate::pipewise::client_wrapper::{
    LlmClient, LlmError, LlmRequest, Message, ToolCallRequest, ToolDefinition,
};
use crate::pipewise::config::PipeWiseConfig;
use crate::pipewise::descriptor::AgentDescriptor;
use crate::pipewise::event::{emit, EventHandler, WorkflowEvent};
use crate::pipewise::handoff::{HandoffPriority, HandoffRequest};
use crate::pipewise::mcp_client::{McpCallError, McpClientPool};
use crate::pipewise::memory::MemoryManager;
use crate::pipewise::output::OutputDecoder;
use crate::pipewise::tool_protocol::{
    error_kind, ToolCallContext, ToolLocality, ToolRegistry, ToolResult,
};
use crate::pipewise::workflow::{TenantContext, WorkflowId};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Name prefix of the synthetic handoff tools.
pub const HANDOFF_TOOL_PREFIX: &str = "handoff_to_";

/// Marker appended to tool results that were cut at the size limit.
const TRUNCATION_MARKER: &str = "...[truncated]";

/// Why a run ended without a final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The loop hit the descriptor's iteration cap.
    IterationLimit,
    /// The LLM failed permanently (or kept failing after retries).
    UpstreamError,
    /// The final answer failed schema validation twice.
    DecodeFailed,
    /// Cooperative cancellation stopped the run.
    Cancelled,
}

/// Terminal state of one agent run.
#[derive(Debug)]
pub enum RunOutcome {
    /// A typed final answer, validated against the descriptor's schema.
    Final(Value),
    /// The model invoked a handoff tool; the orchestrator takes over.
    HandoffPending(HandoffRequest),
    Failed(FailureKind),
}

/// Outcome plus the conversation as it stood when the run ended (the last
/// assistant message is preserved on failure paths).
#[derive(Debug)]
pub struct RunnerResult {
    pub outcome: RunOutcome,
    pub conversation: Vec<Message>,
}

/// Executes one agent's loop. Cheap to construct per workflow step.
pub struct AgentRunner {
    descriptor: Arc<AgentDescriptor>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    mcp: Arc<McpClientPool>,
    memory: Arc<MemoryManager>,
    config: Arc<PipeWiseConfig>,
    events: Option<Arc<dyn EventHandler>>,
}

impl AgentRunner {
    pub fn new(
        descriptor: Arc<AgentDescriptor>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        mcp: Arc<McpClientPool>,
        memory: Arc<MemoryManager>,
        config: Arc<PipeWiseConfig>,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Self {
        Self {
            descriptor,
            llm,
            tools,
            mcp,
            memory,
            config,
            events,
        }
    }

    /// Run the loop to completion.
    pub async fn run(
        &self,
        conversation_prefix: Vec<Message>,
        tenant: &TenantContext,
        workflow_id: WorkflowId,
        cancel: &CancellationToken,
    ) -> RunnerResult {
        let mut conversation = conversation_prefix;
        let tool_definitions = self.compose_tool_definitions();
        let decoder = match OutputDecoder::new(&self.descriptor.output_schema) {
            Ok(decoder) => decoder,
            Err(e) => {
                // Unreachable through the registry, which compiles the
                // schema at registration.
                log::error!("agent {}: output schema rejected: {}", self.descriptor.id, e);
                return RunnerResult {
                    outcome: RunOutcome::Failed(FailureKind::UpstreamError),
                    conversation,
                };
            }
        };
        let ctx = ToolCallContext {
            tenant: tenant.clone(),
            workflow_id,
            agent_id: self.descriptor.id.clone(),
            memory: self.memory.clone(),
        };

        let max_iterations = self.descriptor.model.max_iterations;
        let mut decode_retry_used = false;

        for _iteration in 0..max_iterations {
            if cancel.is_cancelled() {
                return RunnerResult {
                    outcome: RunOutcome::Failed(FailureKind::Cancelled),
                    conversation,
                };
            }

            let request = LlmRequest {
                system: self.descriptor.instructions.clone(),
                messages: conversation.clone(),
                tools: tool_definitions.clone(),
                model: self.descriptor.model.model.clone(),
                temperature: self.descriptor.model.temperature,
                max_tokens: None,
            };

            let assistant = match self.generate_with_retry(&request).await {
                Ok(message) => message,
                Err(()) => {
                    return RunnerResult {
                        outcome: RunOutcome::Failed(FailureKind::UpstreamError),
                        conversation,
                    }
                }
            };

            // A cancellation that raced the LLM call: the in-flight
            // response completed, its result is discarded.
            if cancel.is_cancelled() {
                return RunnerResult {
                    outcome: RunOutcome::Failed(FailureKind::Cancelled),
                    conversation,
                };
            }

            conversation.push(assistant.clone());

            if assistant.tool_calls.is_empty() {
                match decoder.decode(&assistant.content) {
                    Ok(output) => {
                        return RunnerResult {
                            outcome: RunOutcome::Final(output),
                            conversation,
                        }
                    }
                    Err(e) if !decode_retry_used => {
                        decode_retry_used = true;
                        conversation.push(Message::user(format!(
                            "Your last response did not match the required schema at {}; \
                             please re-emit valid JSON.",
                            e.path
                        )));
                        continue;
                    }
                    Err(e) => {
                        log::warn!(
                            "agent {}: output rejected twice: {}",
                            self.descriptor.id,
                            e
                        );
                        return RunnerResult {
                            outcome: RunOutcome::Failed(FailureKind::DecodeFailed),
                            conversation,
                        };
                    }
                }
            }

            // A handoff tool terminates the loop immediately; no other
            // call from this assistant message is executed. Every call
            // still gets a tool-role answer so the conversation stays
            // well-formed for the receiving agent.
            if let Some(handoff) = assistant
                .tool_calls
                .iter()
                .find_map(|call| self.parse_handoff_call(call))
            {
                let handoff_tool = format!("{}{}", HANDOFF_TOOL_PREFIX, handoff.to_agent);
                for call in &assistant.tool_calls {
                    let text = if call.name == handoff_tool {
                        format!("Transferring control to '{}'.", handoff.to_agent)
                    } else {
                        format!(
                            "not executed: superseded by handoff to '{}'",
                            handoff.to_agent
                        )
                    };
                    conversation.push(Message::tool(call.id.clone(), text));
                }
                return RunnerResult {
                    outcome: RunOutcome::HandoffPending(handoff),
                    conversation,
                };
            }

            let results = self
                .dispatch_tool_calls(&assistant.tool_calls, &ctx, workflow_id, cancel)
                .await;
            for result in results {
                let text = truncate_to_bytes(
                    result.to_conversation_text(),
                    self.config.tool_result_max_bytes,
                );
                conversation.push(Message::tool(result.call_id.clone(), text));
            }

            if cancel.is_cancelled() {
                return RunnerResult {
                    outcome: RunOutcome::Failed(FailureKind::Cancelled),
                    conversation,
                };
            }
        }

        RunnerResult {
            outcome: RunOutcome::Failed(FailureKind::IterationLimit),
            conversation,
        }
    }

    /// Local and remote schemas the agent may see, plus one synthetic
    /// handoff tool per allowed target.
    fn compose_tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .schemas_for(self.descriptor.allowed_tools.iter().map(|s| s.as_str()))
            .into_iter()
            .map(|spec| ToolDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters_schema: spec.parameters_schema.clone(),
            })
            .collect();

        for target in &self.descriptor.allowed_handoffs {
            definitions.push(ToolDefinition {
                name: format!("{}{}", HANDOFF_TOOL_PREFIX, target),
                description: format!(
                    "Transfer this conversation to the '{}' agent, carrying the context \
                     you provide. Use when the request falls under that agent's duties.",
                    target
                ),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Short justification for the transfer",
                        },
                        "priority": {
                            "type": "string",
                            "enum": ["low", "normal", "high"],
                        },
                        "context": {
                            "type": "object",
                            "description": "Structured context for the receiving agent",
                        },
                    },
                    "required": ["reason"],
                }),
            });
        }
        definitions
    }

    /// Interpret a tool call as a handoff request if it names a synthetic
    /// handoff tool for an allowed target.
    fn parse_handoff_call(&self, call: &ToolCallRequest) -> Option<HandoffRequest> {
        let target = call.name.strip_prefix(HANDOFF_TOOL_PREFIX)?;
        if !self.descriptor.allowed_handoffs.contains(target) {
            return None;
        }
        let reason = call
            .arguments
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified")
            .to_string();
        let priority = match call.arguments.get("priority").and_then(|v| v.as_str()) {
            Some("low") => HandoffPriority::Low,
            Some("high") => HandoffPriority::High,
            _ => HandoffPriority::Normal,
        };
        let additional_context = call
            .arguments
            .get("context")
            .cloned()
            .unwrap_or(Value::Null);
        Some(HandoffRequest {
            from_agent: self.descriptor.id.clone(),
            to_agent: target.to_string(),
            reason,
            priority,
            additional_context,
        })
    }

    /// Dispatch every call concurrently; the returned results are in
    /// emission order because `join_all` preserves input order.
    async fn dispatch_tool_calls(
        &self,
        calls: &[ToolCallRequest],
        ctx: &ToolCallContext,
        workflow_id: WorkflowId,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let futures = calls
            .iter()
            .map(|call| self.dispatch_one(call, ctx, workflow_id, cancel));
        join_all(futures).await
    }

    async fn dispatch_one(
        &self,
        call: &ToolCallRequest,
        ctx: &ToolCallContext,
        workflow_id: WorkflowId,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let started = Instant::now();
        let result = match self.tools.resolve(&call.name) {
            Ok(spec) => match spec.locality.clone() {
                // Local tools run to completion even under cancellation.
                ToolLocality::Local => {
                    self.tools
                        .invoke_local(&call.id, &call.name, call.arguments.clone(), ctx)
                        .await
                }
                ToolLocality::Mcp { server } => {
                    self.dispatch_remote(call, &server, cancel).await
                }
            },
            Err(e) => ToolResult::failure(&call.id, error_kind::EXECUTION, e.to_string()),
        };

        emit(
            &self.events,
            WorkflowEvent::ToolInvoked {
                workflow_id,
                agent_id: self.descriptor.id.clone(),
                tool: call.name.clone(),
                duration: started.elapsed(),
                success: result.success,
            },
        )
        .await;
        result
    }

    /// Invoke a remote tool, abandoning the call if the workflow is
    /// cancelled while it is in flight (the late response is dropped by
    /// request-id mismatch inside the pool).
    async fn dispatch_remote(
        &self,
        call: &ToolCallRequest,
        server: &str,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let remote_name = call
            .name
            .strip_prefix(&format!("{}.", server))
            .unwrap_or(&call.name);
        tokio::select! {
            outcome = self.mcp.invoke(server, remote_name, call.arguments.clone()) => {
                match outcome {
                    Ok(value) => ToolResult::success(&call.id, value),
                    Err(e) => ToolResult::failure(&call.id, mcp_error_kind(&e), e.to_string()),
                }
            }
            _ = cancel.cancelled() => ToolResult::failure(
                &call.id,
                error_kind::UNAVAILABLE,
                "call abandoned by cancellation",
            ),
        }
    }

    /// One LLM round-trip with transient-failure retries (0.5 s then 2 s)
    /// and rate-limit hints honored.
    async fn generate_with_retry(&self, request: &LlmRequest) -> Result<Message, ()> {
        let max_retries = self.config.llm_transient_attempts;
        let backoff = [Duration::from_millis(500), Duration::from_secs(2)];
        let mut attempt = 0usize;
        loop {
            let outcome =
                tokio::time::timeout(self.config.llm_timeout, self.llm.generate(request)).await;
            let error = match outcome {
                Ok(Ok(message)) => return Ok(message),
                Ok(Err(LlmError::Permanent(detail))) => {
                    log::error!(
                        "agent {}: permanent LLM failure: {}",
                        self.descriptor.id,
                        detail
                    );
                    return Err(());
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => LlmError::Transient("llm call timed out".into()),
            };

            if attempt >= max_retries {
                log::error!(
                    "agent {}: LLM still failing after {} retries: {}",
                    self.descriptor.id,
                    max_retries,
                    error
                );
                return Err(());
            }
            attempt += 1;
            emit(
                &self.events,
                WorkflowEvent::LlmRetry {
                    agent_id: self.descriptor.id.clone(),
                    attempt,
                    reason: error.to_string(),
                },
            )
            .await;
            let delay = match &error {
                LlmError::RateLimited { retry_after } => *retry_after,
                _ => backoff[(attempt - 1).min(backoff.len() - 1)],
            };
            tokio::time::sleep(delay).await;
        }
    }
}

fn mcp_error_kind(error: &McpCallError) -> &'static str {
    match error {
        McpCallError::Timeout { .. } => error_kind::TIMEOUT,
        McpCallError::Remote { .. } | McpCallError::Protocol { .. } => error_kind::REMOTE,
        McpCallError::Unavailable { .. } | McpCallError::NoSuchServer(_) => {
            error_kind::UNAVAILABLE
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, leaving room for
/// the truncation marker.
fn truncate_to_bytes(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let budget = max.saturating_sub(TRUNCATION_MARKER.len());
    let mut end = budget;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
