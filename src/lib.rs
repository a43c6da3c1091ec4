// src/lib.rs

// Import the top-level `pipewise` module.
pub mod pipewise;

// Re-exporting key items for easier external access.
pub use pipewise::client_wrapper::{LlmClient, LlmRequest, Message, Role};
pub use pipewise::config::PipeWiseConfig;
pub use pipewise::memory::MemoryManager;
pub use pipewise::workflow::{IncomingEvent, Orchestrator, TenantContext, WorkflowResult};
