//! Workflow telemetry surface.
//!
//! PipeWise emits structured events at every observable boundary of a
//! workflow: lifecycle transitions, handoffs, tool invocations, MCP
//! connection health, memory writes, and LLM retries. Implement
//! [`EventHandler`] and attach it during bootstrap to receive them; the
//! default implementation is a no-op so handlers only override what they
//! care about.
//!
//! Nothing in the crate ingests these events; they are an emission surface
//! for the host application's logging, metrics, or audit pipeline.
//!
//! # Example
//!
//! ```rust
//! use pipewise::pipewise::event::{EventHandler, WorkflowEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &WorkflowEvent) {
//!         if let WorkflowEvent::ToolInvoked { tool, success, .. } = event {
//!             println!("tool {} -> success={}", tool, success);
//!         }
//!     }
//! }
//! ```

use crate::pipewise::workflow::WorkflowId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Which memory tier a record landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    Volatile,
    Persistent,
}

/// Events emitted by the runtime.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A workflow was accepted and its initial agent selected.
    WorkflowStarted {
        workflow_id: WorkflowId,
        tenant_id: String,
        initial_agent: String,
    },

    /// A workflow reached a terminal status.
    WorkflowCompleted {
        workflow_id: WorkflowId,
        /// Terminal status tag: `completed`, `failed`, or `cancelled`.
        status: String,
        /// Machine-readable failure reason, absent on success.
        reason: Option<String>,
        duration: Duration,
    },

    /// Control moved from one agent to another.
    HandoffPerformed {
        workflow_id: WorkflowId,
        from_agent: String,
        to_agent: String,
        reason: String,
    },

    /// A local or remote tool finished executing.
    ToolInvoked {
        workflow_id: WorkflowId,
        agent_id: String,
        tool: String,
        duration: Duration,
        success: bool,
    },

    /// An MCP server's SSE stream dropped; the connection is degraded until
    /// the reconnect loop re-establishes it.
    McpDisconnected { server: String },

    /// A degraded MCP connection came back.
    McpReconnected { server: String },

    /// A memory record was written.
    MemoryRecordSaved {
        workflow_id: WorkflowId,
        agent_id: String,
        tier: MemoryTier,
        record_id: uuid::Uuid,
    },

    /// An LLM call failed transiently and is being retried.
    LlmRetry {
        agent_id: String,
        /// 1-based retry attempt about to be made.
        attempt: usize,
        reason: String,
    },
}

/// Receiver for [`WorkflowEvent`]s.
///
/// The handler is shared as `Arc<dyn EventHandler>` across every component
/// of a process. Handlers run inline on the emitting task, so they should
/// return quickly; ship slow sinks behind a channel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &WorkflowEvent) {}
}

/// An [`EventHandler`] that forwards events to the `log` crate.
///
/// Used as the bootstrap default so a process has observability before the
/// host wires a real sink.
#[derive(Debug, Default)]
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn on_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::McpDisconnected { server } => {
                log::warn!("mcp server '{}' disconnected", server);
            }
            WorkflowEvent::McpReconnected { server } => {
                log::info!("mcp server '{}' reconnected", server);
            }
            WorkflowEvent::LlmRetry {
                agent_id,
                attempt,
                reason,
            } => {
                log::warn!(
                    "llm retry #{} for agent '{}': {}",
                    attempt,
                    agent_id,
                    reason
                );
            }
            other => log::debug!("{:?}", other),
        }
    }
}

/// Emit an event through an optional handler.
///
/// Components hold `Option<Arc<dyn EventHandler>>`; this helper keeps the
/// "no handler registered" case a cheap no-op at every call site.
pub async fn emit(handler: &Option<Arc<dyn EventHandler>>, event: WorkflowEvent) {
    if let Some(handler) = handler {
        handler.on_event(&event).await;
    }
}
