//! Shared fixtures for the integration suite: a scripted LLM client and a
//! recording event handler.
#![allow(dead_code)]

use async_trait::async_trait;
use pipewise::pipewise::client_wrapper::{
    LlmClient, LlmError, LlmRequest, Message, Role, ToolCallRequest,
};
use pipewise::pipewise::event::{EventHandler, WorkflowEvent};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Scripted {
    Reply {
        message: Message,
        delay: Option<Duration>,
    },
    Error(LlmError),
}

/// An [`LlmClient`] that replays a fixed script of assistant turns.
///
/// Responses pop in order across all agents of a workflow (execution is
/// sequential, so one queue suffices). Every request is captured for
/// assertions. An exhausted script fails permanently so a runaway loop
/// shows up as `upstream_error` instead of hanging the test.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<LlmRequest>>,
    call_counter: Mutex<usize>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text assistant reply.
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.push(Scripted::Reply {
            message: Message::assistant(text.into()),
            delay: None,
        });
        self
    }

    /// Queue an assistant reply that makes the given tool calls, ids
    /// assigned as `call_1`, `call_2`, … in order.
    pub fn reply_tool_calls(self, calls: Vec<(&str, Value)>) -> Self {
        let tool_calls = {
            let mut counter = self.call_counter.lock().unwrap();
            calls
                .into_iter()
                .map(|(name, arguments)| {
                    *counter += 1;
                    ToolCallRequest {
                        id: format!("call_{}", counter),
                        name: name.to_string(),
                        arguments,
                    }
                })
                .collect()
        };
        self.push(Scripted::Reply {
            message: Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls,
            },
            delay: None,
        });
        self
    }

    /// Queue a reply that arrives only after `delay`.
    pub fn reply_text_after(self, text: impl Into<String>, delay: Duration) -> Self {
        self.push(Scripted::Reply {
            message: Message::assistant(text.into()),
            delay: Some(delay),
        });
        self
    }

    /// Queue an error outcome.
    pub fn reply_error(self, error: LlmError) -> Self {
        self.push(Scripted::Error(error));
        self
    }

    fn push(&self, entry: Scripted) {
        self.script.lock().unwrap().push_back(entry);
    }

    /// Requests observed so far.
    pub fn captured_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// How many script entries were never consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(&self, request: &LlmRequest) -> Result<Message, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let entry = self.script.lock().unwrap().pop_front();
        match entry {
            Some(Scripted::Reply { message, delay }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(message)
            }
            Some(Scripted::Error(error)) => Err(error),
            None => Err(LlmError::Permanent("script exhausted".into())),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// An [`EventHandler`] that records everything it sees.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, predicate: impl Fn(&WorkflowEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }
}

#[async_trait]
impl EventHandler for RecordingEvents {
    async fn on_event(&self, event: &WorkflowEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
