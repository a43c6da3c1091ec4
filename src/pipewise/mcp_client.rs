//! SSE MCP client pool.
//!
//! Remote tool servers (Calendly, Pipedrive, Salesforce, Zoho, SendGrid,
//! Google Calendar) expose their tools over the Model Context Protocol:
//! JSON frames, request/response correlated by opaque ids, with the
//! server→client half carried on a long-lived SSE stream and the
//! client→server half POSTed to a message endpoint.
//!
//! One [`McpConnection`] exists per configured server and is shared by
//! every workflow in the process. Each connection runs a dedicated reader
//! task that demultiplexes response frames to pending callers by request
//! id; writes are independent HTTP POSTs, so many calls can be in flight
//! concurrently.
//!
//! # Degradation
//!
//! A lost stream marks the connection degraded: in-flight calls fail with
//! `unavailable`, new calls are refused, and a reconnect loop retries with
//! exponential backoff capped per server. An unconfigured server is a
//! "no such server" error; the system degrades, it does not fail.
//! Responses arriving for requests nobody is waiting on (cancelled
//! workflows, timed-out calls) are dropped by request-id mismatch.
//!
//! # Caching
//!
//! Tool manifests (`list-tools`) are cached for the process lifetime;
//! [`McpConnection::invalidate_manifest`] exists for manual refresh.
//! Individual tool invocations are never cached.

use crate::pipewise::event::{emit, EventHandler, WorkflowEvent};
use crate::pipewise::tool_protocol::{ToolLocality, ToolRegistry, ToolSpec};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

/// Per-server connection settings.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Registry name, e.g. `"calendly"`. Proxy tools register as
    /// `<name>.<tool>`.
    pub name: String,
    /// Server base URL. The SSE stream lives at `<base>/sse`, the message
    /// sink at `<base>/messages`.
    pub base_url: String,
    /// Bearer token sent on both halves of the transport.
    pub auth_token: Option<String>,
    /// Per-user identifier forwarded so the remote side can bind user
    /// state.
    pub user_id: Option<String>,
    /// Upper bound on one tool invocation.
    pub call_timeout: Duration,
    /// Cap on the reconnect backoff.
    pub reconnect_backoff_cap: Duration,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            auth_token: None,
            user_id: None,
            call_timeout: Duration::from_secs(30),
            reconnect_backoff_cap: Duration::from_secs(60),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff_cap(mut self, cap: Duration) -> Self {
        self.reconnect_backoff_cap = cap;
        self
    }
}

/// Failures surfaced by MCP invocation.
#[derive(Debug)]
pub enum McpCallError {
    /// The server name was never configured.
    NoSuchServer(String),
    /// The connection is degraded (or dropped mid-call).
    Unavailable { server: String, detail: String },
    /// No response arrived within the per-call timeout.
    Timeout { server: String, tool: String },
    /// The remote tool returned an error payload.
    Remote { server: String, message: String },
    /// The server sent a frame we could not interpret.
    Protocol { server: String, detail: String },
}

impl fmt::Display for McpCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpCallError::NoSuchServer(name) => write!(f, "no such MCP server: {}", name),
            McpCallError::Unavailable { server, detail } => {
                write!(f, "MCP server {} unavailable: {}", server, detail)
            }
            McpCallError::Timeout { server, tool } => {
                write!(f, "MCP call {}.{} timed out", server, tool)
            }
            McpCallError::Remote { server, message } => {
                write!(f, "MCP server {} returned error: {}", server, message)
            }
            McpCallError::Protocol { server, detail } => {
                write!(f, "MCP protocol error from {}: {}", server, detail)
            }
        }
    }
}

impl Error for McpCallError {}

// ---- wire frames ----

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ResponseFrame {
    id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorFrame>,
}

#[derive(Debug, Deserialize)]
struct ErrorFrame {
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<i64>,
}

/// One entry of a server's tool manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters_schema")]
    pub parameters: Value,
}

fn default_parameters_schema() -> Value {
    json!({"type": "object"})
}

/// Exponential backoff for reconnect attempt `attempt` (1-based), capped.
fn reconnect_backoff(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_secs(1).saturating_mul(1u32 << exp);
    delay.min(cap)
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<ResponseFrame>>>;

struct ConnectionShared {
    config: McpServerConfig,
    http: reqwest::Client,
    connected: AtomicBool,
    /// Whether a disconnect has been reported and not yet recovered.
    reported_down: AtomicBool,
    pending: PendingMap,
    manifest: RwLock<Option<Vec<RemoteToolDescriptor>>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl ConnectionShared {
    /// Route an inbound frame to its waiting caller. Frames without a
    /// pending entry (late responses for timed-out or abandoned calls)
    /// are dropped.
    async fn route(&self, frame: ResponseFrame) {
        let sender = self.pending.lock().await.remove(&frame.id);
        match sender {
            Some(sender) => {
                let _ = sender.send(frame);
            }
            None => {
                log::debug!(
                    "mcp {}: dropping uncorrelated response {}",
                    self.config.name,
                    frame.id
                );
            }
        }
    }

    /// Fail every in-flight call by dropping its completion channel.
    async fn fail_pending(&self) {
        self.pending.lock().await.clear();
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request;
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(user_id) = &self.config.user_id {
            request = request.header("x-mcp-user", user_id);
        }
        request
    }

    async fn post_frame(&self, frame: &RequestFrame<'_>) -> Result<(), McpCallError> {
        let url = format!("{}/messages", self.config.base_url);
        let response = self
            .apply_auth(self.http.post(&url))
            .json(frame)
            .send()
            .await
            .map_err(|e| McpCallError::Unavailable {
                server: self.config.name.clone(),
                detail: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(McpCallError::Unavailable {
                server: self.config.name.clone(),
                detail: format!("message endpoint returned {}", response.status()),
            });
        }
        Ok(())
    }

    /// Issue one correlated request and await its response frame.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpCallError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpCallError::Unavailable {
                server: self.config.name.clone(),
                detail: "connection degraded".into(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = RequestFrame {
            id: &id,
            method,
            params: &params,
        };
        if let Err(e) = self.post_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Err(_) => {
                // Late responses are dropped by id mismatch in route().
                self.pending.lock().await.remove(&id);
                Err(McpCallError::Timeout {
                    server: self.config.name.clone(),
                    tool: method.to_string(),
                })
            }
            Ok(Err(_closed)) => Err(McpCallError::Unavailable {
                server: self.config.name.clone(),
                detail: "connection lost while awaiting response".into(),
            }),
            Ok(Ok(frame)) => {
                if let Some(error) = frame.error {
                    return Err(McpCallError::Remote {
                        server: self.config.name.clone(),
                        message: error.message,
                    });
                }
                Ok(frame.result.unwrap_or(Value::Null))
            }
        }
    }
}

/// A long-lived connection to one MCP server.
pub struct McpConnection {
    shared: Arc<ConnectionShared>,
    reader: tokio::task::JoinHandle<()>,
}

impl McpConnection {
    /// Open a connection and start its reader task. Returns immediately;
    /// if the server is down the connection starts degraded and the reader
    /// keeps retrying with capped exponential backoff.
    pub fn open(config: McpServerConfig, events: Option<Arc<dyn EventHandler>>) -> Self {
        // A dedicated client: the shared one carries a whole-request
        // timeout that would sever long-lived SSE streams.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build MCP HTTP client");
        let shared = Arc::new(ConnectionShared {
            config,
            http,
            connected: AtomicBool::new(false),
            reported_down: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            manifest: RwLock::new(None),
            events,
        });
        let reader = tokio::spawn(reader_loop(shared.clone()));
        Self { shared, reader }
    }

    /// Server name from the config.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Whether the SSE stream is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The cached tool manifest, fetching it on first use.
    pub async fn manifest(&self) -> Result<Vec<RemoteToolDescriptor>, McpCallError> {
        if let Some(cached) = self.shared.manifest.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let result = self.shared.request("list-tools", json!({})).await?;
        let tools: Vec<RemoteToolDescriptor> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| McpCallError::Protocol {
            server: self.shared.config.name.clone(),
            detail: format!("malformed tool manifest: {}", e),
        })?;
        *self.shared.manifest.write().await = Some(tools.clone());
        Ok(tools)
    }

    /// Drop the cached manifest so the next read re-fetches it.
    pub async fn invalidate_manifest(&self) {
        *self.shared.manifest.write().await = None;
    }

    /// Invoke a remote tool by name.
    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, McpCallError> {
        self.shared
            .request(
                "call-tool",
                json!({"name": tool, "arguments": arguments}),
            )
            .await
            .map_err(|e| match e {
                // Attribute timeouts to the tool, not the wire method.
                McpCallError::Timeout { server, .. } => McpCallError::Timeout {
                    server,
                    tool: tool.to_string(),
                },
                other => other,
            })
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn reader_loop(shared: Arc<ConnectionShared>) {
    let mut attempt: u32 = 0;
    loop {
        match open_stream(&shared).await {
            Ok(mut stream) => {
                attempt = 0;
                shared.connected.store(true, Ordering::SeqCst);
                if shared.reported_down.swap(false, Ordering::SeqCst) {
                    emit(
                        &shared.events,
                        WorkflowEvent::McpReconnected {
                            server: shared.config.name.clone(),
                        },
                    )
                    .await;
                }
                log::info!("mcp {}: stream established", shared.config.name);

                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => match serde_json::from_str::<ResponseFrame>(&event.data) {
                            Ok(frame) => shared.route(frame).await,
                            Err(e) => log::warn!(
                                "mcp {}: unparseable frame: {}",
                                shared.config.name,
                                e
                            ),
                        },
                        Err(e) => {
                            log::warn!("mcp {}: stream error: {}", shared.config.name, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("mcp {}: connect failed: {}", shared.config.name, e);
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        shared.fail_pending().await;
        if !shared.reported_down.swap(true, Ordering::SeqCst) {
            emit(
                &shared.events,
                WorkflowEvent::McpDisconnected {
                    server: shared.config.name.clone(),
                },
            )
            .await;
        }

        attempt += 1;
        let delay = reconnect_backoff(attempt, shared.config.reconnect_backoff_cap);
        tokio::time::sleep(delay).await;
    }
}

async fn open_stream(
    shared: &ConnectionShared,
) -> Result<
    impl futures_util::Stream<
        Item = Result<
            eventsource_stream::Event,
            eventsource_stream::EventStreamError<reqwest::Error>,
        >,
    >,
    McpCallError,
> {
    let url = format!("{}/sse", shared.config.base_url);
    let response = shared
        .apply_auth(shared.http.get(&url))
        .header("accept", "text/event-stream")
        .send()
        .await
        .map_err(|e| McpCallError::Unavailable {
            server: shared.config.name.clone(),
            detail: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(McpCallError::Unavailable {
            server: shared.config.name.clone(),
            detail: format!("sse endpoint returned {}", response.status()),
        });
    }
    Ok(response.bytes_stream().eventsource())
}

/// The process-wide set of MCP connections.
///
/// Shared by all workflows; access is multiplexed by request id inside each
/// connection.
#[derive(Default)]
pub struct McpClientPool {
    servers: HashMap<String, Arc<McpConnection>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl McpClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a telemetry handler for connection-health events on servers
    /// connected after this call (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Open a connection to a server. The pool accepts the server even if
    /// it is currently unreachable; it will surface as degraded.
    pub fn connect(&mut self, config: McpServerConfig) {
        let name = config.name.clone();
        let connection = Arc::new(McpConnection::open(config, self.events.clone()));
        self.servers.insert(name, connection);
    }

    /// Names of every configured server.
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_configured(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    /// Whether a server is configured *and* currently connected.
    pub fn is_available(&self, server: &str) -> bool {
        self.servers
            .get(server)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Invoke `<server>.<tool>` with the given arguments.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpCallError> {
        let connection = self
            .servers
            .get(server)
            .ok_or_else(|| McpCallError::NoSuchServer(server.to_string()))?;
        connection.invoke(tool, arguments).await
    }

    /// Drop a server's cached manifest.
    pub async fn invalidate_manifest(&self, server: &str) -> Result<(), McpCallError> {
        let connection = self
            .servers
            .get(server)
            .ok_or_else(|| McpCallError::NoSuchServer(server.to_string()))?;
        connection.invalidate_manifest().await;
        Ok(())
    }

    /// Fetch every reachable server's manifest and register proxy specs in
    /// the tool registry under `<server>.<tool>`. Unreachable servers are
    /// skipped with a warning; their tools simply don't exist this
    /// process run (until a manifest fetch after reconnect).
    pub async fn discover_tools(&self, registry: &mut ToolRegistry) -> usize {
        let mut registered = 0;
        for (name, connection) in &self.servers {
            let manifest = match connection.manifest().await {
                Ok(manifest) => manifest,
                Err(e) => {
                    log::warn!("mcp {}: skipping tool discovery: {}", name, e);
                    continue;
                }
            };
            for tool in manifest {
                let spec = ToolSpec {
                    name: format!("{}.{}", name, tool.name),
                    description: tool.description,
                    parameters_schema: tool.parameters,
                    locality: ToolLocality::Mcp {
                        server: name.clone(),
                    },
                };
                match registry.register_proxy(spec) {
                    Ok(()) => registered += 1,
                    Err(e) => log::warn!("mcp {}: proxy registration failed: {}", name, e),
                }
            }
        }
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let cap = Duration::from_secs(60);
        assert_eq!(reconnect_backoff(1, cap), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2, cap), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(4, cap), Duration::from_secs(8));
        assert_eq!(reconnect_backoff(7, cap), Duration::from_secs(60));
        assert_eq!(reconnect_backoff(30, cap), Duration::from_secs(60));
    }

    #[test]
    fn frames_serialize_and_parse() {
        let params = json!({"name": "create_event", "arguments": {"lead_id": "L-2"}});
        let frame = RequestFrame {
            id: "req-1",
            method: "call-tool",
            params: &params,
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["id"], "req-1");
        assert_eq!(wire["params"]["name"], "create_event");

        let response: ResponseFrame = serde_json::from_str(
            r#"{"id": "req-1", "result": {"url": "https://calendly.com/x"}}"#,
        )
        .unwrap();
        assert_eq!(response.id, "req-1");
        assert!(response.error.is_none());

        let error: ResponseFrame =
            serde_json::from_str(r#"{"id": "req-2", "error": {"message": "boom", "code": 500}}"#)
                .unwrap();
        assert_eq!(error.error.unwrap().message, "boom");
    }

    #[test]
    fn manifest_entries_default_missing_fields() {
        let tools: Vec<RemoteToolDescriptor> =
            serde_json::from_value(json!([{"name": "create_event"}])).unwrap();
        assert_eq!(tools[0].name, "create_event");
        assert_eq!(tools[0].parameters, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn unconfigured_server_is_no_such_server() {
        let pool = McpClientPool::new();
        let err = pool
            .invoke("calendly", "create_event", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpCallError::NoSuchServer(_)));
        assert!(!pool.is_available("calendly"));
    }

    #[tokio::test]
    async fn uncorrelated_responses_are_dropped() {
        let shared = Arc::new(ConnectionShared {
            config: McpServerConfig::new("calendly", "http://127.0.0.1:0"),
            http: reqwest::Client::new(),
            connected: AtomicBool::new(true),
            reported_down: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            manifest: RwLock::new(None),
            events: None,
        });

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert("req-1".into(), tx);

        // A frame for a request nobody is waiting on vanishes.
        shared
            .route(ResponseFrame {
                id: "req-stale".into(),
                result: Some(json!(1)),
                error: None,
            })
            .await;

        shared
            .route(ResponseFrame {
                id: "req-1".into(),
                result: Some(json!({"ok": true})),
                error: None,
            })
            .await;

        let frame = rx.await.unwrap();
        assert_eq!(frame.result.unwrap()["ok"], true);
        assert!(shared.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn degraded_connection_fails_pending() {
        let shared = Arc::new(ConnectionShared {
            config: McpServerConfig::new("calendly", "http://127.0.0.1:0"),
            http: reqwest::Client::new(),
            connected: AtomicBool::new(true),
            reported_down: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            manifest: RwLock::new(None),
            events: None,
        });

        let (tx, rx) = oneshot::channel::<ResponseFrame>();
        shared.pending.lock().await.insert("req-1".into(), tx);
        shared.fail_pending().await;
        assert!(rx.await.is_err());
    }
}
