//! CRM function tools.
//!
//! Lead records live in the memory subsystem: records tagged `lead` with a
//! `lead_id` metadata key, partitioned by tenant like everything else. The
//! tools here read and write those records through the per-call
//! [`ToolCallContext`], so they need no storage of their own.
//!
//! The meeting scheduler consults the `calendly` MCP server when its
//! connection is live and otherwise falls back to a locally minted booking
//! URL marked `fallback: true`, so a degraded scheduler still answers.

use crate::pipewise::mcp_client::McpClientPool;
use crate::pipewise::memory::MemoryQuery;
use crate::pipewise::tool_protocol::{
    error_kind, LocalTool, ToolCallContext, ToolResult,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Meeting types the scheduler can book.
pub const MEETING_EVENT_TYPES: [&str; 5] = [
    "Sales Call",
    "Demo",
    "Executive Consultation",
    "Discovery Call",
    "Technical Demo",
];

/// Metadata key under which the lead id is stored on lead records.
pub const LEAD_ID_METADATA_KEY: &str = "lead_id";

fn lead_id_arg(args: &Value) -> &str {
    // Required by every schema below; validation ran before dispatch.
    args.get("lead_id").and_then(|v| v.as_str()).unwrap_or("")
}

/// Look up a lead by id across both memory tiers.
pub struct GetLeadTool;

#[async_trait]
impl LocalTool for GetLeadTool {
    fn name(&self) -> &str {
        "get_lead_by_id"
    }

    fn description(&self) -> &str {
        "Fetch the stored profile and qualification state of a lead by its id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "lead_id": {"type": "string", "description": "Lead identifier, e.g. L-001"},
            },
            "required": ["lead_id"],
        })
    }

    async fn invoke(&self, call_id: &str, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let lead_id = lead_id_arg(&args);
        let query = MemoryQuery::new()
            .tag("lead")
            .metadata_eq(LEAD_ID_METADATA_KEY, json!(lead_id))
            .tenant(&ctx.tenant.tenant_id);

        // Freshest volatile record wins; fall back to the durable tier.
        if let Some(record) = ctx.memory.volatile().query(&query).into_iter().next() {
            return ToolResult::success(call_id, record.content);
        }
        match ctx.memory.persistent().query(&query).await {
            Ok(records) => match records.into_iter().next() {
                Some(record) => ToolResult::success(call_id, record.content),
                None => ToolResult::failure(
                    call_id,
                    error_kind::EXECUTION,
                    format!("no lead found with id {}", lead_id),
                ),
            },
            Err(e) => ToolResult::failure(call_id, error_kind::EXECUTION, e.to_string()),
        }
    }
}

/// Record a qualification decision for a lead.
pub struct UpdateLeadQualificationTool;

#[async_trait]
impl LocalTool for UpdateLeadQualificationTool {
    fn name(&self) -> &str {
        "update_lead_qualification"
    }

    fn description(&self) -> &str {
        "Record whether a lead is qualified, with the reasoning behind the decision."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "lead_id": {"type": "string"},
                "qualified": {"type": "boolean"},
                "reason": {"type": "string"},
            },
            "required": ["lead_id", "qualified"],
        })
    }

    async fn invoke(&self, call_id: &str, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let lead_id = lead_id_arg(&args).to_string();
        let qualified = args.get("qualified").and_then(|v| v.as_bool()).unwrap_or(false);
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let content = json!({
            "lead_id": lead_id,
            "qualified": qualified,
            "reason": reason,
        });
        let saved = ctx
            .memory
            .save_both(
                &ctx.agent_id,
                ctx.workflow_id,
                &ctx.tenant,
                content,
                &["lead", "qualification"],
                json!({ LEAD_ID_METADATA_KEY: lead_id }),
                None,
            )
            .await;
        match saved {
            Ok((record, _persisted)) => ToolResult::success(
                call_id,
                json!({
                    "lead_id": lead_id,
                    "qualified": qualified,
                    "record_id": record.id,
                }),
            ),
            Err(e) => ToolResult::failure(call_id, error_kind::EXECUTION, e.to_string()),
        }
    }
}

/// Book a meeting for a qualified lead.
pub struct ScheduleMeetingTool {
    mcp: Arc<McpClientPool>,
}

impl ScheduleMeetingTool {
    pub fn new(mcp: Arc<McpClientPool>) -> Self {
        Self { mcp }
    }

    fn fallback_url(lead_id: &str) -> String {
        format!(
            "https://meet.pipewise.app/book/{}-{}",
            lead_id,
            Uuid::new_v4().simple()
        )
    }
}

#[async_trait]
impl LocalTool for ScheduleMeetingTool {
    fn name(&self) -> &str {
        "schedule_meeting_for_lead"
    }

    fn description(&self) -> &str {
        "Create a meeting booking link for a lead. Books through Calendly when \
         available, otherwise returns a fallback booking URL."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "lead_id": {"type": "string"},
                "event_type": {"type": "string", "enum": MEETING_EVENT_TYPES},
                "duration_minutes": {"type": "integer", "minimum": 15, "maximum": 120},
            },
            "required": ["lead_id", "event_type"],
        })
    }

    async fn invoke(&self, call_id: &str, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let lead_id = lead_id_arg(&args).to_string();
        let event_type = args
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("Sales Call")
            .to_string();
        let duration = args
            .get("duration_minutes")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);

        let (meeting_url, fallback) = if self.mcp.is_available("calendly") {
            let booked = self
                .mcp
                .invoke(
                    "calendly",
                    "create_event",
                    json!({
                        "lead_id": lead_id,
                        "event_type": event_type,
                        "duration_minutes": duration,
                        "invitee": ctx.tenant.user_id,
                    }),
                )
                .await;
            match booked {
                Ok(result) => match result.get("url").and_then(|v| v.as_str()) {
                    Some(url) => (url.to_string(), false),
                    None => {
                        log::warn!("calendly returned no url, using fallback");
                        (Self::fallback_url(&lead_id), true)
                    }
                },
                Err(e) => {
                    log::warn!("calendly booking failed ({}), using fallback", e);
                    (Self::fallback_url(&lead_id), true)
                }
            }
        } else {
            (Self::fallback_url(&lead_id), true)
        };

        let content = json!({
            "lead_id": lead_id,
            "meeting_url": meeting_url,
            "event_type": event_type,
            "duration_minutes": duration,
            "fallback": fallback,
        });
        let saved = ctx
            .memory
            .save_volatile(
                &ctx.agent_id,
                ctx.workflow_id,
                &ctx.tenant,
                content.clone(),
                &["meeting_scheduled"],
                json!({ LEAD_ID_METADATA_KEY: lead_id }),
                None,
            )
            .await;
        if let Err(e) = saved {
            return ToolResult::failure(call_id, error_kind::EXECUTION, e.to_string());
        }
        ToolResult::success(call_id, content)
    }
}

/// Log an outreach attempt against a lead.
pub struct RecordContactAttemptTool;

#[async_trait]
impl LocalTool for RecordContactAttemptTool {
    fn name(&self) -> &str {
        "record_contact_attempt"
    }

    fn description(&self) -> &str {
        "Log an outbound contact attempt (channel and note) against a lead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "lead_id": {"type": "string"},
                "channel": {
                    "type": "string",
                    "enum": ["email", "dm-twitter", "dm-instagram", "phone", "chat"],
                },
                "note": {"type": "string"},
            },
            "required": ["lead_id", "channel"],
        })
    }

    async fn invoke(&self, call_id: &str, args: Value, ctx: &ToolCallContext) -> ToolResult {
        let lead_id = lead_id_arg(&args).to_string();
        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or("email")
            .to_string();
        let note = args
            .get("note")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let content = json!({
            "lead_id": lead_id,
            "channel": channel,
            "note": note,
        });
        let saved = ctx
            .memory
            .save_both(
                &ctx.agent_id,
                ctx.workflow_id,
                &ctx.tenant,
                content.clone(),
                &["contact_attempt"],
                json!({ LEAD_ID_METADATA_KEY: lead_id }),
                None,
            )
            .await;
        match saved {
            Ok(_) => ToolResult::success(call_id, content),
            Err(e) => ToolResult::failure(call_id, error_kind::EXECUTION, e.to_string()),
        }
    }
}
