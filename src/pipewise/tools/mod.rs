//! Built-in local tools.
//!
//! These are the CRM operations the default agents work with. Each tool
//! implements [`LocalTool`](crate::pipewise::tool_protocol::LocalTool) and
//! is registered at bootstrap; custom deployments can add their own
//! alongside.

pub mod crm;

use crate::pipewise::mcp_client::McpClientPool;
use crate::pipewise::tool_protocol::{ToolError, ToolRegistry};
use std::sync::Arc;

/// Register every built-in CRM tool.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    mcp: Arc<McpClientPool>,
) -> Result<(), ToolError> {
    registry.register_local(Arc::new(crm::GetLeadTool))?;
    registry.register_local(Arc::new(crm::UpdateLeadQualificationTool))?;
    registry.register_local(Arc::new(crm::ScheduleMeetingTool::new(mcp)))?;
    registry.register_local(Arc::new(crm::RecordContactAttemptTool))?;
    Ok(())
}
