//! Run one inbound chat message through the default agent set.
//!
//! ```sh
//! OPENAI_API_KEY=sk-... cargo run --example inbound_chat
//! ```

use pipewise::pipewise::bootstrap::{init_logging, Bootstrap};
use pipewise::pipewise::clients::openai::OpenAIClient;
use pipewise::pipewise::workflow::{Channel, IncomingEvent, TenantContext};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let api_key = std::env::var("OPENAI_API_KEY")?;
    let orchestrator = Bootstrap::new(Arc::new(OpenAIClient::new(api_key, "gpt-4o")))
        .build()
        .await?;

    let event = IncomingEvent::new(
        Channel::Chat,
        "c@techcorp.com",
        "Necesitamos automatizar nuestro proceso de ventas. Equipo de 25 personas.",
    )
    .with_lead(json!({"id": "L-001", "email": "c@techcorp.com"}));
    let tenant = TenantContext::new("techcorp", "demo-user");

    let result = orchestrator.run(event, tenant).await;

    println!("workflow {} finished: {}", result.workflow_id, result.status.as_str());
    for entry in &result.handoff_chain {
        println!("  handoff {} -> {} ({})", entry.from, entry.to, entry.reason);
    }
    if let Some(output) = result.output {
        println!("output: {}", serde_json::to_string_pretty(&output)?);
    }
    if let Some(reason) = result.reason {
        println!("failure reason: {}", reason);
    }
    Ok(())
}
