//! Tool declaration and dispatch layer.
//!
//! Every callable tool, local CRM operations and remote MCP proxies alike,
//! is declared here as a [`ToolSpec`]: a name, a JSON-schema for its
//! parameters, and a locality that tells the runner where the invoker lives.
//! The [`ToolRegistry`] indexes specs by name and answers the two questions
//! the runner asks on every iteration: *which schemas may this agent see*
//! and *how do I execute this call*.
//!
//! # Architecture
//!
//! ```text
//! AgentRunner → ToolRegistry ── Local  → Arc<dyn LocalTool>.invoke(args, ctx)
//!                           └── Mcp    → McpClientPool.invoke(server, tool, args)
//! ```
//!
//! Local tools implement the [`LocalTool`] capability set
//! (`schema → invoke`); remote tools share that capability through proxy
//! specs registered by the MCP pool under `<server>.<tool>`.
//!
//! The registry is read-mostly: all registration happens at process start,
//! after which it is shared immutably (`Arc<ToolRegistry>`) and requires no
//! locking for reads.

use crate::pipewise::memory::MemoryManager;
use crate::pipewise::workflow::{TenantContext, WorkflowId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Error kind tag carried on failed [`ToolResult`]s.
///
/// These are data, not types: tool failures flow back into the conversation
/// so the model can recover, and the kind tells it (and telemetry) what
/// went wrong.
pub mod error_kind {
    /// The arguments did not match the tool's parameter schema.
    pub const INVALID_ARGUMENTS: &str = "invalid_arguments";
    /// A local tool raised or returned failure.
    pub const EXECUTION: &str = "execution";
    /// The remote MCP tool returned an error payload.
    pub const REMOTE: &str = "remote";
    /// The MCP call timed out.
    pub const TIMEOUT: &str = "timeout";
    /// The MCP server is degraded or unconfigured.
    pub const UNAVAILABLE: &str = "unavailable";
}

/// Where a tool's invoker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolLocality {
    /// In-process function tool.
    Local,
    /// Proxy for a tool exposed by a remote MCP server.
    Mcp {
        /// Configured server name, e.g. `"calendly"`.
        server: String,
    },
}

/// Immutable declaration of a callable tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Unique name within the registry. MCP proxies use `<server>.<tool>`.
    pub name: String,
    /// Human-readable description surfaced to the LLM.
    pub description: String,
    /// JSON-schema object describing the accepted parameters.
    pub parameters_schema: Value,
    /// Where the invoker lives.
    pub locality: ToolLocality,
}

/// The result of one tool execution, correlated to the assistant's call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Correlation id copied from the originating
    /// [`ToolCallRequest`](crate::pipewise::client_wrapper::ToolCallRequest).
    pub call_id: String,
    /// Whether the tool execution was successful.
    pub success: bool,
    /// The output data from the tool; `Null` on failure.
    pub output: Value,
    /// One of the [`error_kind`] tags when `success` is false.
    pub error_kind: Option<String>,
    /// Human-readable error message when `success` is false.
    pub error: Option<String>,
}

impl ToolResult {
    /// Convenience constructor for successful tool execution.
    pub fn success(call_id: impl Into<String>, output: Value) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output,
            error_kind: None,
            error: None,
        }
    }

    /// Convenience constructor for failed tool execution.
    pub fn failure(
        call_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: Value::Null,
            error_kind: Some(kind.into()),
            error: Some(message.into()),
        }
    }

    /// Render the result as the text body of a tool-role message.
    pub fn to_conversation_text(&self) -> String {
        if self.success {
            self.output.to_string()
        } else {
            format!(
                "ERROR[{}]: {}",
                self.error_kind.as_deref().unwrap_or("unknown"),
                self.error.as_deref().unwrap_or("tool failed")
            )
        }
    }
}

/// Per-call context handed to local tool invokers.
///
/// Carries the read-only tenant context and the memory manager handle so
/// tools can read and write workflow state without reaching for globals.
#[derive(Clone)]
pub struct ToolCallContext {
    pub tenant: TenantContext,
    pub workflow_id: WorkflowId,
    pub agent_id: String,
    pub memory: Arc<MemoryManager>,
}

/// Capability set implemented by in-process function tools.
///
/// Invokers receive arguments that were already validated against
/// [`LocalTool::parameters_schema`]; they return a [`ToolResult`]
/// synchronously with respect to the caller but may perform blocking I/O
/// behind `.await`.
#[async_trait]
pub trait LocalTool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Description surfaced to the LLM.
    fn description(&self) -> &str;

    /// JSON-schema object for the parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `call_id` must be echoed on the result.
    async fn invoke(&self, call_id: &str, args: Value, ctx: &ToolCallContext) -> ToolResult;
}

/// Error types for registry operations.
#[derive(Debug)]
pub enum ToolError {
    /// A tool with this name is already registered.
    DuplicateTool(String),
    /// The parameter schema is not a valid JSON-schema object.
    InvalidSchema { tool: String, detail: String },
    /// Requested tool is not registered.
    UnknownTool(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::DuplicateTool(name) => write!(f, "duplicate tool: {}", name),
            ToolError::InvalidSchema { tool, detail } => {
                write!(f, "invalid schema for tool {}: {}", tool, detail)
            }
            ToolError::UnknownTool(name) => write!(f, "unknown tool: {}", name),
        }
    }
}

impl Error for ToolError {}

struct RegisteredTool {
    spec: ToolSpec,
    validator: jsonschema::Validator,
    invoker: Option<Arc<dyn LocalTool>>,
}

/// Registry of every tool the process can dispatch.
///
/// Keyed by name; iteration surfaces (`schemas_for`, `list_tools`) are in
/// stable alphabetical order so prompt caching on the LLM side stays
/// effective across identical requests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry ready to accept registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process function tool.
    ///
    /// Fails with [`ToolError::DuplicateTool`] if the name exists and
    /// [`ToolError::InvalidSchema`] if the parameter schema does not compile
    /// as a JSON-schema object.
    pub fn register_local(&mut self, tool: Arc<dyn LocalTool>) -> Result<(), ToolError> {
        let spec = ToolSpec {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters_schema: tool.parameters_schema(),
            locality: ToolLocality::Local,
        };
        self.register_spec(spec, Some(tool))
    }

    /// Register a proxy spec for a remote MCP tool.
    ///
    /// The MCP pool calls this during manifest discovery; invocation routes
    /// through the pool, not the registry.
    pub fn register_proxy(&mut self, spec: ToolSpec) -> Result<(), ToolError> {
        debug_assert!(matches!(spec.locality, ToolLocality::Mcp { .. }));
        self.register_spec(spec, None)
    }

    fn register_spec(
        &mut self,
        spec: ToolSpec,
        invoker: Option<Arc<dyn LocalTool>>,
    ) -> Result<(), ToolError> {
        if self.tools.contains_key(&spec.name) {
            return Err(ToolError::DuplicateTool(spec.name));
        }
        if !spec.parameters_schema.is_object() {
            return Err(ToolError::InvalidSchema {
                tool: spec.name,
                detail: "parameter schema must be a JSON object".into(),
            });
        }
        let validator =
            jsonschema::validator_for(&spec.parameters_schema).map_err(|e| {
                ToolError::InvalidSchema {
                    tool: spec.name.clone(),
                    detail: e.to_string(),
                }
            })?;
        self.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec,
                validator,
                invoker,
            },
        );
        Ok(())
    }

    /// Look up a tool's spec by name.
    pub fn resolve(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        self.tools
            .get(name)
            .map(|t| &t.spec)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Whether the registry knows a tool by this name.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tool names, alphabetical.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// All registered specs, alphabetical by name.
    pub fn list_tools(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|t| &t.spec).collect()
    }

    /// The subset of specs an agent is permitted to see, in stable
    /// alphabetical order.
    pub fn schemas_for<'a>(
        &'a self,
        allowed: impl Iterator<Item = &'a str>,
    ) -> Vec<&'a ToolSpec> {
        let mut specs: Vec<&ToolSpec> = allowed
            .filter_map(|name| self.tools.get(name).map(|t| &t.spec))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Validate an argument object against a tool's parameter schema.
    ///
    /// Returns the offending path and message on the first violation.
    pub fn validate_arguments(&self, name: &str, args: &Value) -> Result<(), String> {
        let tool = match self.tools.get(name) {
            Some(tool) => tool,
            None => return Err(format!("unknown tool: {}", name)),
        };
        match tool.validator.validate(args) {
            Ok(()) => Ok(()),
            Err(violation) => Err(format!(
                "schema violation at {}: {}",
                violation.instance_path, violation
            )),
        }
    }

    /// Execute a local tool call: validate the arguments, then invoke.
    ///
    /// Schema violations are dropped before dispatch and surface as a failed
    /// result the model can react to. Calls that resolve to an MCP proxy are
    /// rejected here; the runner routes those through the pool.
    pub async fn invoke_local(
        &self,
        call_id: &str,
        name: &str,
        args: Value,
        ctx: &ToolCallContext,
    ) -> ToolResult {
        let tool = match self.tools.get(name) {
            Some(tool) => tool,
            None => {
                return ToolResult::failure(
                    call_id,
                    error_kind::EXECUTION,
                    format!("unknown tool: {}", name),
                )
            }
        };
        if let Err(violation) = self.validate_arguments(name, &args) {
            return ToolResult::failure(call_id, error_kind::INVALID_ARGUMENTS, violation);
        }
        match &tool.invoker {
            Some(invoker) => invoker.invoke(call_id, args, ctx).await,
            None => ToolResult::failure(
                call_id,
                error_kind::EXECUTION,
                format!("tool {} is remote and cannot be invoked locally", name),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl LocalTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })
        }

        async fn invoke(&self, call_id: &str, args: Value, _ctx: &ToolCallContext) -> ToolResult {
            ToolResult::success(call_id, json!({"echo": args["text"]}))
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register_local(Arc::new(EchoTool)).unwrap();
        let err = registry.register_local(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool(name) if name == "echo"));
    }

    #[test]
    fn non_object_schema_is_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register_proxy(ToolSpec {
                name: "bad".into(),
                description: "broken".into(),
                parameters_schema: json!("not a schema"),
                locality: ToolLocality::Mcp {
                    server: "calendly".into(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidSchema { .. }));
    }

    #[test]
    fn resolve_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(ToolError::UnknownTool(_))
        ));
    }

    #[test]
    fn schemas_for_is_alphabetical_and_scoped() {
        let mut registry = ToolRegistry::new();
        registry.register_local(Arc::new(EchoTool)).unwrap();
        registry
            .register_proxy(ToolSpec {
                name: "calendly.create_event".into(),
                description: "Create a calendar event".into(),
                parameters_schema: json!({"type": "object"}),
                locality: ToolLocality::Mcp {
                    server: "calendly".into(),
                },
            })
            .unwrap();
        registry
            .register_proxy(ToolSpec {
                name: "pipedrive.update_deal".into(),
                description: "Update a deal".into(),
                parameters_schema: json!({"type": "object"}),
                locality: ToolLocality::Mcp {
                    server: "pipedrive".into(),
                },
            })
            .unwrap();

        let allowed = vec!["pipedrive.update_deal", "echo", "not_registered"];
        let specs = registry.schemas_for(allowed.iter().copied());
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "pipedrive.update_deal"]);
    }

    #[test]
    fn argument_validation_reports_path() {
        let mut registry = ToolRegistry::new();
        registry.register_local(Arc::new(EchoTool)).unwrap();
        let err = registry
            .validate_arguments("echo", &json!({"text": 42}))
            .unwrap_err();
        assert!(err.contains("/text"), "unexpected violation text: {}", err);
    }
}
