//! Schedule a meeting for a pre-seeded lead, with a Calendly MCP server
//! attached. If the server is unreachable the scheduler falls back to a
//! locally minted booking link.
//!
//! ```sh
//! ANTHROPIC_API_KEY=sk-ant-... CALENDLY_MCP_URL=http://localhost:8080 \
//!     cargo run --example scheduling_with_mcp
//! ```

use pipewise::pipewise::bootstrap::{init_logging, Bootstrap};
use pipewise::pipewise::clients::anthropic::AnthropicClient;
use pipewise::pipewise::mcp_client::McpServerConfig;
use pipewise::pipewise::workflow::{
    agent_ids, Channel, EventIntent, IncomingEvent, TenantContext, WorkflowId,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let api_key = std::env::var("ANTHROPIC_API_KEY")?;
    let calendly_url = std::env::var("CALENDLY_MCP_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());

    let orchestrator = Bootstrap::new(Arc::new(AnthropicClient::new(
        api_key,
        "claude-sonnet-4-5",
    )))
    .with_mcp_server(
        McpServerConfig::new("calendly", calendly_url)
            .with_auth_token(std::env::var("CALENDLY_MCP_TOKEN").unwrap_or_default()),
    )
    .build()
    .await?;

    let tenant = TenantContext::new("acme", "demo-user").with_premium(true);

    // Seed the lead the scheduler will look up.
    orchestrator
        .memory()
        .save_persistent(
            agent_ids::LEAD_QUALIFIER,
            WorkflowId::new(),
            &tenant,
            json!({"lead_id": "L-002", "email": "vp@acme.io", "qualified": true}),
            &["lead"],
            json!({"lead_id": "L-002"}),
        )
        .await?;

    let event = IncomingEvent::new(Channel::Chat, "vp@acme.io", "Schedule a demo for lead L-002")
        .with_intent(EventIntent::Schedule);
    let result = orchestrator.run(event, tenant).await;

    println!("workflow {} finished: {}", result.workflow_id, result.status.as_str());
    if let Some(output) = result.output {
        println!(
            "meeting: {} ({}) fallback={}",
            output["meeting_url"], output["event_type"], output["fallback"]
        );
    }
    Ok(())
}
