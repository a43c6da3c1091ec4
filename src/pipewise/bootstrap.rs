//! Process wiring.
//!
//! The runtime's collaborators (memory stores, MCP pool, tool and agent
//! registries, handoff engine) are all constructor-injected so the
//! orchestrator stays testable. [`Bootstrap`] is the thin builder that
//! wires them once at startup, registers the default PipeWise agent set,
//! and hands back a ready [`Orchestrator`].
//!
//! Every default is swappable: hosts bring their own persistent backend,
//! clock, event handler, MCP servers, or an entirely different agent set
//! (descriptors are data).
//!
//! # Example
//!
//! ```rust,no_run
//! use pipewise::pipewise::bootstrap::Bootstrap;
//! use pipewise::pipewise::clients::openai::OpenAIClient;
//! use pipewise::pipewise::mcp_client::McpServerConfig;
//! use std::sync::Arc;
//!
//! # async {
//! let orchestrator = Bootstrap::new(Arc::new(OpenAIClient::new("sk-...", "gpt-4o")))
//!     .with_mcp_server(McpServerConfig::new("calendly", "https://mcp.calendly.internal"))
//!     .build()
//!     .await
//!     .unwrap();
//! # };
//! ```

use crate::pipewise::client_wrapper::LlmClient;
use crate::pipewise::clock::{Clock, SystemClock};
use crate::pipewise::config::PipeWiseConfig;
use crate::pipewise::descriptor::{AgentDescriptor, AgentRegistry, DescriptorError};
use crate::pipewise::event::{EventHandler, LogEventHandler};
use crate::pipewise::handoff::{HandoffCallback, HandoffEngine};
use crate::pipewise::mcp_client::{McpClientPool, McpServerConfig};
use crate::pipewise::memory::{
    InMemoryPersistentBackend, MemoryManager, PersistentMemoryBackend, VolatileMemoryStore,
};
use crate::pipewise::tool_protocol::{ToolError, ToolRegistry};
use crate::pipewise::tools::register_builtin_tools;
use crate::pipewise::workflow::{agent_ids, Orchestrator};
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Initialise env-filtered logging for binaries and demos.
///
/// Safe to call more than once; later calls are no-ops. Library users with
/// their own `log` backend simply skip this.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Errors raised while wiring the process.
#[derive(Debug)]
pub enum BootstrapError {
    Tool(ToolError),
    Descriptor(DescriptorError),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Tool(e) => write!(f, "tool registration failed: {}", e),
            BootstrapError::Descriptor(e) => write!(f, "agent registration failed: {}", e),
        }
    }
}

impl Error for BootstrapError {}

impl From<ToolError> for BootstrapError {
    fn from(e: ToolError) -> Self {
        BootstrapError::Tool(e)
    }
}

impl From<DescriptorError> for BootstrapError {
    fn from(e: DescriptorError) -> Self {
        BootstrapError::Descriptor(e)
    }
}

/// Builder that assembles an [`Orchestrator`] from its collaborators.
pub struct Bootstrap {
    config: PipeWiseConfig,
    llm: Arc<dyn LlmClient>,
    persistent: Arc<dyn PersistentMemoryBackend>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
    mcp_servers: Vec<McpServerConfig>,
    agents: Option<Vec<AgentDescriptor>>,
    callbacks: Vec<(String, String, Arc<dyn HandoffCallback>)>,
}

impl Bootstrap {
    /// Start a bootstrap around an LLM client. Everything else defaults:
    /// in-memory persistent backend, system clock, log-backed telemetry,
    /// no MCP servers, and the default agent set.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config: PipeWiseConfig::default(),
            llm,
            persistent: Arc::new(InMemoryPersistentBackend::new()),
            clock: Arc::new(SystemClock),
            events: Arc::new(LogEventHandler),
            mcp_servers: Vec::new(),
            agents: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: PipeWiseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_persistent_backend(mut self, backend: Arc<dyn PersistentMemoryBackend>) -> Self {
        self.persistent = backend;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Add a remote MCP tool server.
    pub fn with_mcp_server(mut self, server: McpServerConfig) -> Self {
        self.mcp_servers.push(server);
        self
    }

    /// Replace the default agent set entirely.
    pub fn with_agents(mut self, agents: Vec<AgentDescriptor>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Register a handoff instrumentation callback for an agent pair.
    pub fn with_handoff_callback(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        callback: Arc<dyn HandoffCallback>,
    ) -> Self {
        self.callbacks.push((from.into(), to.into(), callback));
        self
    }

    /// Wire everything and return the orchestrator.
    pub async fn build(self) -> Result<Orchestrator, BootstrapError> {
        let config = Arc::new(self.config);

        let volatile = Arc::new(VolatileMemoryStore::new(
            self.clock.clone(),
            config.volatile_default_ttl,
        ));
        let _sweeper = volatile.start_sweeper(config.volatile_sweep_interval);
        let memory = Arc::new(
            MemoryManager::new(volatile, self.persistent, self.clock.clone())
                .with_event_handler(self.events.clone()),
        );

        let mut mcp = McpClientPool::new().with_event_handler(self.events.clone());
        for server in self.mcp_servers {
            mcp.connect(server);
        }
        let mcp = Arc::new(mcp);

        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools, mcp.clone())?;
        let discovered = mcp.discover_tools(&mut tools).await;
        if discovered > 0 {
            log::info!("registered {} remote MCP tools", discovered);
        }
        let tools = Arc::new(tools);

        let mut agents = AgentRegistry::new();
        let descriptors = self
            .agents
            .unwrap_or_else(|| default_agents(&config));
        for descriptor in descriptors {
            agents.register(descriptor, &tools)?;
        }
        agents.validate_handoffs()?;
        let agents = Arc::new(agents);

        let mut handoffs =
            HandoffEngine::new(agents.clone(), memory.clone(), self.clock.clone())
                .with_event_handler(self.events.clone());
        for (from, to, callback) in self.callbacks {
            handoffs.register_callback(from, to, callback);
        }

        Ok(Orchestrator::new(
            agents,
            tools,
            mcp,
            memory,
            Arc::new(handoffs),
            self.llm,
            config,
            self.clock,
        )
        .with_event_handler(self.events))
    }
}

/// The default PipeWise agent set.
///
/// The Coordinator here is the reactive inbound variant: it triages
/// incoming messages and delegates. Proactive outreach is the Outbound
/// Contact agent's job.
pub fn default_agents(config: &PipeWiseConfig) -> Vec<AgentDescriptor> {
    let max_iterations = config.default_max_iterations;

    let coordinator = AgentDescriptor::new(
        agent_ids::COORDINATOR,
        "Coordinator",
        "You are the PipeWise coordinator, the first responder for every inbound \
         message (email, chat, social DMs, web forms).\n\
         \n\
         Triage each message:\n\
         - New prospects or anyone describing their company, team, or needs: hand \
           off to the lead qualifier with whatever context you gathered.\n\
         - Qualified leads asking for a meeting, demo, or call: hand off to the \
           meeting scheduler with the lead id.\n\
         - Leads that went quiet or need a follow-up touch: hand off to the \
           outbound contact agent.\n\
         - Anything you can answer directly (simple questions, acknowledgements): \
           answer it yourself.\n\
         \n\
         Use get_lead_by_id to check what we already know before deciding. When \
         you answer directly, reply with a JSON object: {\"summary\": \"...\", \
         \"action\": \"...\"}. Messages may arrive in any language; keep your \
         summary in English.",
    )
    .with_tool("get_lead_by_id")
    .with_tool("record_contact_attempt")
    .with_handoff(agent_ids::LEAD_QUALIFIER)
    .with_handoff(agent_ids::MEETING_SCHEDULER)
    .with_handoff(agent_ids::OUTBOUND_CONTACT)
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string", "minLength": 1},
            "action": {"type": "string"},
        },
        "required": ["summary"],
    }))
    .with_max_iterations(max_iterations);

    let lead_qualifier = AgentDescriptor::new(
        agent_ids::LEAD_QUALIFIER,
        "Lead Qualifier",
        "You qualify inbound leads for PipeWise.\n\
         \n\
         Assess the prospect against our ideal profile: company size, a concrete \
         sales-process pain, budget signals, and decision authority. Use \
         get_lead_by_id to pull anything we already know, and record your \
         verdict with update_lead_qualification before answering.\n\
         \n\
         If the lead is qualified and explicitly asked for a meeting, hand off \
         to the meeting scheduler. Otherwise finish with your verdict as a JSON \
         object: {\"qualified\": true|false, \"reason\": \"...\"}. The reason \
         must never be empty; gibberish or unintelligible messages are \
         unqualified with the reason stating why.",
    )
    .with_tool("get_lead_by_id")
    .with_tool("update_lead_qualification")
    .with_handoff(agent_ids::MEETING_SCHEDULER)
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "qualified": {"type": "boolean"},
            "reason": {"type": "string", "minLength": 1},
        },
        "required": ["qualified", "reason"],
    }))
    .with_max_iterations(max_iterations);

    let meeting_scheduler = AgentDescriptor::new(
        agent_ids::MEETING_SCHEDULER,
        "Meeting Scheduler",
        "You schedule meetings for qualified PipeWise leads.\n\
         \n\
         Pick the event type that fits the lead: 'Sales Call' for standard \
         prospects, 'Demo' or 'Technical Demo' for product-focused asks, \
         'Discovery Call' for early conversations, 'Executive Consultation' \
         for senior stakeholders. Book it with schedule_meeting_for_lead, which \
         returns the booking URL (a fallback URL when the calendar provider is \
         unreachable; that is fine, pass it along).\n\
         \n\
         Finish with a JSON object: {\"meeting_url\": \"...\", \"event_type\": \
         \"...\", \"fallback\": true|false}.",
    )
    .with_tool("get_lead_by_id")
    .with_tool("schedule_meeting_for_lead")
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "meeting_url": {"type": "string", "minLength": 1},
            "event_type": {
                "type": "string",
                "enum": crate::pipewise::tools::crm::MEETING_EVENT_TYPES,
            },
            "fallback": {"type": "boolean"},
        },
        "required": ["meeting_url", "event_type"],
    }))
    .with_max_iterations(max_iterations);

    let outbound_contact = AgentDescriptor::new(
        agent_ids::OUTBOUND_CONTACT,
        "Outbound Contact",
        "You handle outbound touches for PipeWise: follow-ups with quiet leads, \
         nudges after meetings, and first-touch messages to referred prospects.\n\
         \n\
         Keep messages short and personal; reference what the lead \
         actually said or did. Log every attempt with record_contact_attempt.\n\
         \n\
         Finish with a JSON object: {\"sent\": true|false, \"channel\": \"...\", \
         \"message\": \"...\"}.",
    )
    .with_tool("get_lead_by_id")
    .with_tool("record_contact_attempt")
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "sent": {"type": "boolean"},
            "channel": {"type": "string"},
            "message": {"type": "string"},
        },
        "required": ["sent"],
    }))
    .with_max_iterations(max_iterations);

    vec![
        coordinator,
        lead_qualifier,
        meeting_scheduler,
        outbound_contact,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agents_cover_the_product_surface() {
        let agents = default_agents(&PipeWiseConfig::default());
        let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                agent_ids::COORDINATOR,
                agent_ids::LEAD_QUALIFIER,
                agent_ids::MEETING_SCHEDULER,
                agent_ids::OUTBOUND_CONTACT,
            ]
        );

        let coordinator = &agents[0];
        assert!(coordinator
            .allowed_handoffs
            .contains(agent_ids::LEAD_QUALIFIER));
        let qualifier = &agents[1];
        assert!(qualifier
            .allowed_handoffs
            .contains(agent_ids::MEETING_SCHEDULER));
        // The scheduler is a terminal agent.
        assert!(agents[2].allowed_handoffs.is_empty());
    }
}
