//! End-to-end MCP pool tests against a minimal in-process SSE server.
//!
//! The server speaks just enough HTTP/1.1 for the transport: `GET /sse`
//! opens the event stream, `POST /messages` accepts request frames and
//! answers them over the stream. Tests drive discovery, invocation,
//! per-call timeouts, and the degrade/reconnect cycle.

mod common;

use common::RecordingEvents;
use pipewise::pipewise::event::WorkflowEvent;
use pipewise::pipewise::mcp_client::{McpCallError, McpClientPool, McpServerConfig};
use pipewise::pipewise::tool_protocol::{ToolLocality, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Handle to the in-process MCP server.
struct TestMcpServer {
    base_url: String,
    /// Write half of the currently attached SSE client, if any.
    sse: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl TestMcpServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sse: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));

        let sse_for_server = sse.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let sse = sse_for_server.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, sse).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            sse,
        }
    }

    /// Drop the live SSE stream, simulating a connection loss.
    async fn kill_sse(&self) {
        *self.sse.lock().await = None;
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    sse: Arc<Mutex<Option<OwnedWriteHalf>>>,
) -> std::io::Result<()> {
    let (mut read, mut write) = stream.into_split();

    // Read the request head.
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = read.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let first_line = head.lines().next().unwrap_or_default().to_string();

    if first_line.starts_with("GET /sse") {
        write
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await?;
        write.flush().await?;
        // Park the write half; frames are pushed from POST handling. The
        // read half is dropped, which is fine for a one-way stream.
        *sse.lock().await = Some(write);
        return Ok(());
    }

    if first_line.starts_with("POST /messages") {
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let mut body = buffer[head_end + 4..].to_vec();
        while body.len() < content_length {
            let n = read.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        if let Ok(frame) = serde_json::from_slice::<Value>(&body) {
            if let Some(response) = answer_frame(&frame) {
                let sse = sse.clone();
                tokio::spawn(async move {
                    push_event(&sse, &response).await;
                });
            }
        }

        write
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
            )
            .await?;
        write.flush().await?;
    }
    Ok(())
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Compute the response frame for a request frame, or `None` for tools
/// that deliberately never answer.
fn answer_frame(frame: &Value) -> Option<Value> {
    let id = frame["id"].as_str()?;
    match frame["method"].as_str()? {
        "list-tools" => Some(json!({
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "create_event",
                        "description": "Create a calendar event",
                        "parameters": {
                            "type": "object",
                            "properties": {"lead_id": {"type": "string"}},
                        },
                    },
                    {"name": "sleepy"},
                ],
            },
        })),
        "call-tool" => {
            let name = frame["params"]["name"].as_str()?;
            if name == "sleepy" {
                return None;
            }
            Some(json!({
                "id": id,
                "result": {"url": format!("https://calendly.com/evt/{}", id)},
            }))
        }
        _ => Some(json!({"id": id, "error": {"message": "unknown method"}})),
    }
}

async fn push_event(sse: &Arc<Mutex<Option<OwnedWriteHalf>>>, frame: &Value) {
    if let Some(write) = sse.lock().await.as_mut() {
        let payload = format!("data: {}\n\n", frame);
        let _ = write.write_all(payload.as_bytes()).await;
        let _ = write.flush().await;
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn discovery_registers_proxies_and_invocation_round_trips() {
    let server = TestMcpServer::start().await;

    let mut pool = McpClientPool::new();
    pool.connect(McpServerConfig::new("calendly", &server.base_url));
    assert!(wait_until(|| pool.is_available("calendly"), Duration::from_secs(2)).await);

    let mut registry = ToolRegistry::new();
    let registered = pool.discover_tools(&mut registry).await;
    assert_eq!(registered, 2);

    let spec = registry.resolve("calendly.create_event").unwrap();
    assert_eq!(
        spec.locality,
        ToolLocality::Mcp {
            server: "calendly".into()
        }
    );

    let result = pool
        .invoke("calendly", "create_event", json!({"lead_id": "L-002"}))
        .await
        .unwrap();
    assert!(result["url"]
        .as_str()
        .unwrap()
        .starts_with("https://calendly.com/evt/"));

    // Several calls in flight at once all correlate correctly.
    let (a, b, c) = tokio::join!(
        pool.invoke("calendly", "create_event", json!({"lead_id": "1"})),
        pool.invoke("calendly", "create_event", json!({"lead_id": "2"})),
        pool.invoke("calendly", "create_event", json!({"lead_id": "3"})),
    );
    for result in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert!(result["url"].as_str().is_some());
    }
}

#[tokio::test]
async fn unanswered_calls_time_out_without_poisoning_the_stream() {
    let server = TestMcpServer::start().await;

    let mut pool = McpClientPool::new();
    pool.connect(
        McpServerConfig::new("calendly", &server.base_url)
            .with_call_timeout(Duration::from_millis(200)),
    );
    assert!(wait_until(|| pool.is_available("calendly"), Duration::from_secs(2)).await);

    let err = pool
        .invoke("calendly", "sleepy", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpCallError::Timeout { tool, .. } if tool == "sleepy"));

    // The connection still answers other calls afterwards.
    let result = pool
        .invoke("calendly", "create_event", json!({"lead_id": "L-1"}))
        .await
        .unwrap();
    assert!(result["url"].as_str().is_some());
}

#[tokio::test]
async fn disconnect_degrades_and_reconnect_recovers() {
    let server = TestMcpServer::start().await;
    let events = Arc::new(RecordingEvents::new());

    let mut pool = McpClientPool::new().with_event_handler(events.clone());
    pool.connect(
        McpServerConfig::new("calendly", &server.base_url)
            .with_reconnect_backoff_cap(Duration::from_secs(1)),
    );
    assert!(wait_until(|| pool.is_available("calendly"), Duration::from_secs(2)).await);

    server.kill_sse().await;
    assert!(wait_until(|| !pool.is_available("calendly"), Duration::from_secs(2)).await);
    assert!(events.contains(
        |e| matches!(e, WorkflowEvent::McpDisconnected { server } if server == "calendly")
    ));

    let err = pool
        .invoke("calendly", "create_event", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpCallError::Unavailable { .. }));

    // The server is still accepting; the reconnect loop comes back.
    assert!(wait_until(|| pool.is_available("calendly"), Duration::from_secs(5)).await);
    assert!(events.contains(
        |e| matches!(e, WorkflowEvent::McpReconnected { server } if server == "calendly")
    ));

    let result = pool
        .invoke("calendly", "create_event", json!({"lead_id": "L-1"}))
        .await
        .unwrap();
    assert!(result["url"].as_str().is_some());
}
