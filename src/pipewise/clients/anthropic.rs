//! Anthropic messages-API adapter.
//!
//! Implements [`LlmClient`] against the native Anthropic `/v1/messages`
//! endpoint. Tool definitions map to `input_schema` entries, assistant
//! `tool_use` blocks map to [`ToolCallRequest`]s, and tool-role messages
//! are sent back as `tool_result` content blocks.
//!
//! Anthropic requires strictly alternating user/assistant turns, so
//! consecutive tool results are merged into a single user message before
//! transmission.

use crate::pipewise::client_wrapper::{
    LlmClient, LlmError, LlmRequest, Message, Role, TokenUsage, ToolCallRequest,
};
use crate::pipewise::clients::get_shared_http_client;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// [`LlmClient`] implementation for Anthropic models.
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
    usage: Mutex<Option<TokenUsage>>,
}

impl AnthropicClient {
    /// Create an adapter for api.anthropic.com with the given model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new_with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Create an adapter against a custom base URL (proxy or gateway).
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
            usage: Mutex::new(None),
        }
    }

    fn request_body(&self, request: &LlmRequest) -> Value {
        let model = if request.model.is_empty() {
            self.model.as_str()
        } else {
            request.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
            "messages": wire_messages(&request.messages),
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn generate(&self, request: &LlmRequest) -> Result<Message, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
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
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            // 529 is Anthropic's "overloaded"; treat like any 5xx.
            return if status.is_server_error() {
                Err(LlmError::Transient(format!("{}: {}", status, detail)))
            } else {
                if log::log_enabled!(log::Level::Error) {
                    log::error!(
                        "AnthropicClient::generate(...): provider rejected request: {} {}",
                        status,
                        detail
                    );
                }
                Err(LlmError::Permanent(format!("{}: {}", status, detail)))
            };
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transient(format!("malformed messages body: {}", e)))?;

        if let Some(usage) = parsed.get("usage") {
            let input = usage["input_tokens"].as_u64().unwrap_or(0) as usize;
            let output = usage["output_tokens"].as_u64().unwrap_or(0) as usize;
            *self.usage.lock().await = Some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            });
        }

        Ok(parse_content_blocks(
            parsed.get("content").and_then(|v| v.as_array()),
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

/// Render the conversation into Anthropic's alternating message shape,
/// merging consecutive tool results into one user turn.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |wire: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            wire.push(json!({"role": "user", "content": std::mem::take(pending)}));
        }
    };

    for msg in messages {
        match &msg.role {
            Role::Tool { call_id } => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": msg.content.as_ref(),
                }));
            }
            Role::User | Role::System => {
                flush(&mut wire, &mut pending_results);
                wire.push(json!({"role": "user", "content": msg.content.as_ref()}));
            }
            Role::Assistant => {
                flush(&mut wire, &mut pending_results);
                let mut blocks: Vec<Value> = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content.as_ref()}));
                }
                for call in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                wire.push(json!({"role": "assistant", "content": blocks}));
            }
        }
    }
    flush(&mut wire, &mut pending_results);
    wire
}

/// Assemble the assistant message from the response's content blocks.
fn parse_content_blocks(blocks: Option<&Vec<Value>>) -> Message {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = blocks {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    content.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }
    Message {
        role: Role::Assistant,
        content: Arc::from(content.as_str()),
        tool_calls,
    }
}
