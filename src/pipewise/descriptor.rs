//! Agent descriptors.
//!
//! An [`AgentDescriptor`] is the immutable definition of one agent:
//! identity, prompt instructions, the tools it may invoke, the agents it
//! may hand off to, its declared typed output schema, and model parameters.
//! Descriptors are data: deployments replace prompt text or tool scoping
//! at process start without code changes.
//!
//! The [`AgentRegistry`] validates each descriptor on registration (tools
//! must exist, output schema must compile, iteration cap must be sane) and
//! cross-checks the handoff graph once all agents are present.

use crate::pipewise::tool_protocol::ToolRegistry;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Model parameters carried by a descriptor.
#[derive(Debug, Clone)]
pub struct ModelParameters {
    /// Provider model identifier, e.g. `"gpt-4o"`. Empty defers to the
    /// adapter's configured default.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Cap on the agent's tool-calling loop.
    pub max_iterations: usize,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_iterations: 16,
        }
    }
}

/// Immutable definition of one agent.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Stable identifier, e.g. `"lead_qualifier"`.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Prompt body sent as the system message.
    pub instructions: String,
    /// Names of tools this agent may invoke.
    pub allowed_tools: BTreeSet<String>,
    /// Ids of agents this agent may hand off to.
    pub allowed_handoffs: BTreeSet<String>,
    /// JSON-schema the agent's final answer must satisfy.
    pub output_schema: Value,
    /// Model parameters.
    pub model: ModelParameters,
}

impl AgentDescriptor {
    /// Start a descriptor with identity and instructions. Everything else
    /// defaults to empty/none and is filled via the builder methods.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            allowed_tools: BTreeSet::new(),
            allowed_handoffs: BTreeSet::new(),
            output_schema: serde_json::json!({"type": "object"}),
            model: ModelParameters::default(),
        }
    }

    /// Grant access to a tool by name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.insert(tool.into());
        self
    }

    /// Permit handoffs to another agent.
    pub fn with_handoff(mut self, agent_id: impl Into<String>) -> Self {
        self.allowed_handoffs.insert(agent_id.into());
        self
    }

    /// Declare the typed output schema.
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Override the model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model.model = model.into();
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.model.temperature = temperature;
        self
    }

    /// Override the tool-calling iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.model.max_iterations = max_iterations;
        self
    }
}

/// Errors raised while registering descriptors.
#[derive(Debug)]
pub enum DescriptorError {
    DuplicateAgent(String),
    /// The descriptor references a tool the registry does not know.
    UnknownTool { agent: String, tool: String },
    /// The descriptor references a handoff target that was never
    /// registered.
    UnknownHandoffTarget { agent: String, target: String },
    /// The output schema does not compile as JSON-schema.
    InvalidOutputSchema { agent: String, detail: String },
    /// `max_iterations` must be at least 1.
    InvalidIterationCap { agent: String },
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::DuplicateAgent(id) => write!(f, "duplicate agent: {}", id),
            DescriptorError::UnknownTool { agent, tool } => {
                write!(f, "agent {} references unknown tool {}", agent, tool)
            }
            DescriptorError::UnknownHandoffTarget { agent, target } => {
                write!(f, "agent {} hands off to unknown agent {}", agent, target)
            }
            DescriptorError::InvalidOutputSchema { agent, detail } => {
                write!(f, "agent {} has invalid output schema: {}", agent, detail)
            }
            DescriptorError::InvalidIterationCap { agent } => {
                write!(f, "agent {} must allow at least one iteration", agent)
            }
        }
    }
}

impl Error for DescriptorError {}

/// Registered agent set, built at process start and shared read-only.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<AgentDescriptor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, validating everything that can be checked
    /// without the full agent set. Handoff targets are cross-checked by
    /// [`validate_handoffs`](AgentRegistry::validate_handoffs) once all
    /// agents are in.
    pub fn register(
        &mut self,
        descriptor: AgentDescriptor,
        tools: &ToolRegistry,
    ) -> Result<(), DescriptorError> {
        if self.agents.contains_key(&descriptor.id) {
            return Err(DescriptorError::DuplicateAgent(descriptor.id));
        }
        if descriptor.model.max_iterations == 0 {
            return Err(DescriptorError::InvalidIterationCap {
                agent: descriptor.id,
            });
        }
        for tool in &descriptor.allowed_tools {
            if !tools.contains(tool) {
                return Err(DescriptorError::UnknownTool {
                    agent: descriptor.id.clone(),
                    tool: tool.clone(),
                });
            }
        }
        if let Err(e) = jsonschema::validator_for(&descriptor.output_schema) {
            return Err(DescriptorError::InvalidOutputSchema {
                agent: descriptor.id.clone(),
                detail: e.to_string(),
            });
        }
        self.agents
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Cross-check that every handoff target names a registered agent.
    pub fn validate_handoffs(&self) -> Result<(), DescriptorError> {
        for descriptor in self.agents.values() {
            for target in &descriptor.allowed_handoffs {
                if !self.agents.contains_key(target) {
                    return Err(DescriptorError::UnknownHandoffTarget {
                        agent: descriptor.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<Arc<AgentDescriptor>> {
        self.agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All registered agent ids, alphabetical.
    pub fn agent_ids(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    /// Whether `from` may hand off to `to`.
    pub fn can_handoff(&self, from: &str, to: &str) -> bool {
        self.agents
            .get(from)
            .map(|agent| agent.allowed_handoffs.contains(to))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools() -> ToolRegistry {
        ToolRegistry::new()
    }

    #[test]
    fn register_rejects_unknown_tool() {
        let mut registry = AgentRegistry::new();
        let descriptor =
            AgentDescriptor::new("coordinator", "Coordinator", "Route inbound messages.")
                .with_tool("get_lead_by_id");
        let err = registry.register(descriptor, &tools()).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownTool { .. }));
    }

    #[test]
    fn register_rejects_zero_iterations() {
        let mut registry = AgentRegistry::new();
        let descriptor = AgentDescriptor::new("a", "A", "x").with_max_iterations(0);
        assert!(matches!(
            registry.register(descriptor, &tools()),
            Err(DescriptorError::InvalidIterationCap { .. })
        ));
    }

    #[test]
    fn handoff_cross_check_catches_dangling_target() {
        let mut registry = AgentRegistry::new();
        registry
            .register(
                AgentDescriptor::new("coordinator", "Coordinator", "x")
                    .with_handoff("lead_qualifier"),
                &tools(),
            )
            .unwrap();
        assert!(matches!(
            registry.validate_handoffs(),
            Err(DescriptorError::UnknownHandoffTarget { .. })
        ));

        registry
            .register(
                AgentDescriptor::new("lead_qualifier", "Lead Qualifier", "y")
                    .with_output_schema(json!({
                        "type": "object",
                        "properties": {"qualified": {"type": "boolean"}},
                        "required": ["qualified"],
                    })),
                &tools(),
            )
            .unwrap();
        registry.validate_handoffs().unwrap();
        assert!(registry.can_handoff("coordinator", "lead_qualifier"));
        assert!(!registry.can_handoff("lead_qualifier", "coordinator"));
    }
}
