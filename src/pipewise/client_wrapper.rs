//! Shared primitives for provider-agnostic LLM clients.
//!
//! The agent runner interacts with language models exclusively through the
//! [`LlmClient`] trait and the lightweight data types defined here. The trait
//! abstracts over concrete vendor implementations while the supporting
//! structs describe chat messages, native tool calls, and token accounting.
//!
//! The surface is deliberately narrow: one `generate` call that maps a fully
//! composed request (system prompt, ordered messages, tool schemas, model
//! parameters) to a single assistant [`Message`]. Implementations that
//! support streaming must buffer chunks until a complete assistant message
//! (including all tool calls) is assembled before returning.
//!
//! # Failure taxonomy
//!
//! Adapters classify failures into [`LlmError`] so the runner can decide
//! what to retry: `Transient` (network, 5xx) and `RateLimited` (with a
//! retry-after hint) are retried with backoff; `Permanent` (auth, invalid
//! request) surfaces immediately as an upstream error.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A single tool call returned by the LLM in a native function-calling
/// response.
///
/// Providers assign an opaque [`id`](ToolCallRequest::id) to each call so
/// that the tool result can be correlated back in a follow-up
/// [`Role::Tool`] message.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
///
/// Serialized as an OpenAI-compatible `tools` array entry before
/// transmission.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant
    /// behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// A tool-result message correlating with a prior assistant
    /// [`ToolCallRequest`].
    ///
    /// Serializes as `{"role": "tool", "tool_call_id": "<call_id>", ...}` in
    /// the OpenAI wire format.
    Tool { call_id: String },
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Clone, Debug)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Represents a generic message exchanged with an LLM.
///
/// The `tool_calls` field is populated by [`LlmClient::generate`] when the
/// provider returns native function-calling results. It is empty for all
/// other message kinds.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body. Stored as `Arc<str>` so that conversation
    /// histories can be cheaply cloned across handoffs.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant. Non-empty only on
    /// assistant messages returned by [`LlmClient::generate`].
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    /// Build a plain message with no tool calls.
    pub fn new(role: Role, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build a system message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self::new(Role::System, content)
    }

    /// Build a user message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self::new(Role::User, content)
    }

    /// Build an assistant message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Build a tool-result message correlated to a prior assistant call.
    pub fn tool(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self::new(
            Role::Tool {
                call_id: call_id.into(),
            },
            content,
        )
    }
}

/// A fully composed chat-completion request.
///
/// The runner owns request composition; adapters only translate this shape
/// into the provider's wire format.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// System prompt. Sent as the first message.
    pub system: String,
    /// Ordered conversation, excluding the system prompt.
    pub messages: Vec<Message>,
    /// Tool schemas the model may call. Empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
    /// Provider model identifier, e.g. `"gpt-4o"`.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional completion-token cap.
    pub max_tokens: Option<u32>,
}

/// Failure classes surfaced by [`LlmClient::generate`].
#[derive(Debug, Clone)]
pub enum LlmError {
    /// Network failures and 5xx responses. Retried with backoff.
    Transient(String),
    /// Auth failures and invalid requests. Never retried.
    Permanent(String),
    /// The provider throttled the request. Retried after the hint elapses.
    RateLimited {
        /// How long the provider asked us to wait before retrying.
        retry_after: Duration,
    },
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transient(msg) => write!(f, "transient LLM failure: {}", msg),
            LlmError::Permanent(msg) => write!(f, "permanent LLM failure: {}", msg),
            LlmError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {:?}", retry_after)
            }
        }
    }
}

impl Error for LlmError {}

/// Trait-driven abstraction over a chat-completion-with-tools provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between workflow tasks. Where a provider exposes token accounting,
/// adapters should capture it and make it visible via
/// [`LlmClient::get_last_usage`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// On success the returned [`Message`] has role `Assistant` and may
    /// carry non-empty [`Message::tool_calls`] when the model selected one
    /// or more tools. Streaming implementations buffer until the complete
    /// message (including every tool call) is assembled.
    async fn generate(&self, request: &LlmRequest) -> Result<Message, LlmError>;

    /// Return the identifier used to select the upstream model when the
    /// request does not name one.
    fn model_name(&self) -> &str;

    /// Hook to retrieve usage from the most recent
    /// [`generate`](LlmClient::generate) call.
    ///
    /// Adapters that propagate token accounting should override
    /// [`LlmClient::usage_slot`].
    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    /// Expose a shared mutable slot where the implementation can persist
    /// token usage. By default adapters report no usage data.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}
