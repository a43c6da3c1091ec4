//! OpenAI-compatible chat-completions adapter.
//!
//! Implements [`LlmClient`] against any endpoint that speaks the
//! `/chat/completions` wire format (OpenAI, Azure OpenAI, Groq, local
//! relays). Native function calling is mapped into
//! [`ToolCallRequest`]s; streaming responses are buffered into a single
//! complete assistant message before returning, per the adapter contract.
//!
//! # Example
//!
//! ```rust,no_run
//! use pipewise::pipewise::clients::openai::OpenAIClient;
//! use pipewise::{LlmClient, LlmRequest, Message};
//!
//! # async {
//! let client = OpenAIClient::new("sk-...", "gpt-4o");
//! let request = LlmRequest {
//!     system: "You are a sales assistant.".into(),
//!     messages: vec![Message::user("Hello")],
//!     tools: vec![],
//!     model: "gpt-4o".into(),
//!     temperature: 0.2,
//!     max_tokens: None,
//! };
//! let reply = client.generate(&request).await.unwrap();
//! println!("{}", reply.content);
//! # };
//! ```

use crate::pipewise::client_wrapper::{
    LlmClient, LlmError, LlmRequest, Message, Role, TokenUsage, ToolCallRequest,
};
use crate::pipewise::clients::get_shared_http_client;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// [`LlmClient`] implementation for OpenAI-compatible providers.
pub struct OpenAIClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
    streaming: bool,
    usage: Mutex<Option<TokenUsage>>,
}

impl OpenAIClient {
    /// Create an adapter for api.openai.com with the given model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new_with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Create an adapter against a custom OpenAI-compatible base URL
    /// (e.g. an Azure deployment or a local relay).
    pub fn new_with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            http: get_shared_http_client().clone(),
            streaming: false,
            usage: Mutex::new(None),
        }
    }

    /// Request SSE streaming from the provider. Chunks are buffered into a
    /// complete assistant message before [`generate`](LlmClient::generate)
    /// returns, so callers see no behavioural difference.
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn request_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            self.model.as_str()
        } else {
            request.model.as_str()
        };

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(json!({"role": "system", "content": request.system}));
        for msg in &request.messages {
            messages.push(wire_message(msg));
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post_completion(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(5));
            return Err(LlmError::RateLimited { retry_after });
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(LlmError::Transient(format!("{}: {}", status, detail)))
        } else {
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAIClient::generate(...): provider rejected request: {} {}",
                    status,
                    detail
                );
            }
            Err(LlmError::Permanent(format!("{}: {}", status, detail)))
        }
    }

    async fn generate_blocking(&self, request: &LlmRequest) -> Result<Message, LlmError> {
        let body = self.request_body(request, false);
        let response = self.post_completion(&body).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transient(format!("malformed completion body: {}", e)))?;

        if let Some(usage) = &parsed.usage {
            *self.usage.lock().await = Some(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Permanent("completion carried no choices".into()))?;

        Ok(assistant_message(
            choice.message.content.unwrap_or_default(),
            choice.message.tool_calls.unwrap_or_default(),
        ))
    }

    async fn generate_streaming(&self, request: &LlmRequest) -> Result<Message, LlmError> {
        let body = self.request_body(request, true);
        let response = self.post_completion(&body).await?;

        let mut content = String::new();
        // Streaming deltas identify tool calls by index; arguments arrive as
        // string fragments that must be concatenated before parsing.
        let mut partial_calls: BTreeMap<usize, PartialToolCall> = BTreeMap::new();

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| LlmError::Transient(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let chunk: ChatCompletionChunk = serde_json::from_str(&event.data)
                .map_err(|e| LlmError::Transient(format!("malformed stream chunk: {}", e)))?;

            if let Some(usage) = &chunk.usage {
                *self.usage.lock().await = Some(TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                });
            }

            for choice in chunk.choices {
                if let Some(delta_content) = choice.delta.content {
                    content.push_str(&delta_content);
                }
                for delta_call in choice.delta.tool_calls.unwrap_or_default() {
                    let slot = partial_calls.entry(delta_call.index).or_default();
                    if let Some(id) = delta_call.id {
                        slot.id = id;
                    }
                    if let Some(function) = delta_call.function {
                        if let Some(name) = function.name {
                            slot.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            slot.arguments.push_str(&arguments);
                        }
                    }
                }
            }
        }

        let tool_calls = partial_calls
            .into_values()
            .map(|partial| WireToolCall {
                id: partial.id,
                function: WireFunctionCall {
                    name: partial.name,
                    arguments: partial.arguments,
                },
            })
            .collect();

        Ok(assistant_message(content, tool_calls))
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn generate(&self, request: &LlmRequest) -> Result<Message, LlmError> {
        if self.streaming {
            self.generate_streaming(request).await
        } else {
            self.generate_blocking(request).await
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

/// Render a [`Message`] into the OpenAI wire shape.
fn wire_message(msg: &Message) -> Value {
    match &msg.role {
        Role::System => json!({"role": "system", "content": msg.content.as_ref()}),
        Role::User => json!({"role": "user", "content": msg.content.as_ref()}),
        Role::Assistant => {
            let mut wire = json!({"role": "assistant", "content": msg.content.as_ref()});
            if !msg.tool_calls.is_empty() {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                wire["tool_calls"] = json!(calls);
            }
            wire
        }
        Role::Tool { call_id } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": msg.content.as_ref(),
        }),
    }
}

fn assistant_message(content: String, wire_calls: Vec<WireToolCall>) -> Message {
    let tool_calls = wire_calls
        .into_iter()
        .map(|call| {
            // Providers ship arguments as a JSON-encoded string; a model that
            // emits invalid JSON still gets its text surfaced to the tool
            // layer, which rejects it against the schema.
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments.clone()));
            ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();
    Message {
        role: Role::Assistant,
        content: Arc::from(content.as_str()),
        tool_calls,
    }
}

// ---- wire shapes ----

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireAssistantMessage,
}

#[derive(Debug, Deserialize)]
struct WireAssistantMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}
