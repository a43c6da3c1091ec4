//! Runtime configuration for PipeWise.
//!
//! [`PipeWiseConfig`] collects the knobs the orchestrator, runner, and memory
//! subsystem recognize. Users construct it manually; no file parsing
//! dependencies are introduced. Per-MCP-server options live on
//! [`McpServerConfig`](crate::pipewise::mcp_client::McpServerConfig);
//! per-agent iteration caps live on the
//! [`AgentDescriptor`](crate::pipewise::descriptor::AgentDescriptor).
//!
//! # Example
//!
//! ```rust
//! use pipewise::PipeWiseConfig;
//! use std::time::Duration;
//!
//! let config = PipeWiseConfig {
//!     max_handoffs: 4,
//!     workflow_deadline: Duration::from_secs(120),
//!     ..PipeWiseConfig::default()
//! };
//! assert_eq!(config.tool_result_max_bytes, 16 * 1024);
//! ```

use std::time::Duration;

/// Tunables for the agent runtime.
#[derive(Debug, Clone)]
pub struct PipeWiseConfig {
    /// Default expiry applied to volatile memory records saved without an
    /// explicit TTL.
    pub volatile_default_ttl: Duration,

    /// How often the volatile store's background sweeper removes expired
    /// records. Reads skip expired records regardless of sweeper timing.
    pub volatile_sweep_interval: Duration,

    /// Workflow-level cap on total handoffs. Exceeding it fails the workflow
    /// with `handoff_limit` rather than letting agents ping-pong forever.
    pub max_handoffs: usize,

    /// Iteration cap applied to agents whose descriptor does not override it.
    pub default_max_iterations: usize,

    /// Upper bound on a single LLM round-trip.
    pub llm_timeout: Duration,

    /// How many times a transient LLM failure is retried before the run
    /// fails with `upstream_error`.
    pub llm_transient_attempts: usize,

    /// Tool result text larger than this is truncated before it enters the
    /// conversation.
    pub tool_result_max_bytes: usize,

    /// Wall-clock budget for an entire workflow. On expiry the workflow is
    /// cancelled and marked `failed(deadline)`.
    pub workflow_deadline: Duration,
}

impl Default for PipeWiseConfig {
    fn default() -> Self {
        Self {
            volatile_default_ttl: Duration::from_secs(3600),
            volatile_sweep_interval: Duration::from_secs(60),
            max_handoffs: 8,
            default_max_iterations: 16,
            llm_timeout: Duration::from_secs(60),
            llm_transient_attempts: 2,
            tool_result_max_bytes: 16 * 1024,
            workflow_deadline: Duration::from_secs(600),
        }
    }
}
