//! Manager tests for the legacy SSE transport against a small in-process server.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{ServerConfig, TransportKind};
use conduit_mcp::{AddServerError, CallError, ConnectionState, McpManager};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use common::{is_slow, reply, wait_for, SLOW_TOOL_DELAY};

const CLOSE_STREAM: &str = "close";

/// Handle to the fake server: push raw SSE text, inspect received methods.
struct SseServer {
    addr: SocketAddr,
    events: broadcast::Sender<String>,
    methods: Arc<Mutex<Vec<String>>>,
}

impl SseServer {
    async fn start(announce_endpoint: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(64);
        let methods = Arc::new(Mutex::new(Vec::new()));

        let server = Self {
            addr,
            events: events.clone(),
            methods: Arc::clone(&methods),
        };
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let connection = Connection {
                    events: events.clone(),
                    methods: Arc::clone(&methods),
                    announce_endpoint,
                };
                tokio::spawn(async move {
                    let _ = connection.serve(socket).await;
                });
            }
        });
        server
    }

    fn url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    fn received(&self, method: &str) -> bool {
        self.methods.lock().iter().any(|m| m == method)
    }

    fn close_stream(&self) {
        let _ = self.events.send(CLOSE_STREAM.to_string());
    }
}

struct Connection {
    events: broadcast::Sender<String>,
    methods: Arc<Mutex<Vec<String>>>,
    announce_endpoint: bool,
}

impl Connection {
    async fn serve(self, socket: TcpStream) -> std::io::Result<()> {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);

        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await? == 0 {
                return Ok(());
            }
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let target = parts.next().unwrap_or_default().to_string();

            let mut content_length = 0;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await? == 0 {
                    return Ok(());
                }
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }

            match (method.as_str(), target.as_str()) {
                ("GET", "/sse") => return self.stream(write).await,
                ("POST", target) if target.starts_with("/messages") => {
                    let mut body = vec![0; content_length];
                    reader.read_exact(&mut body).await?;
                    write
                        .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
                        .await?;
                    if let Ok(message) = serde_json::from_slice::<Value>(&body) {
                        self.answer(message);
                    }
                }
                _ => {
                    write
                        .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                        .await?;
                }
            }
        }
    }

    async fn stream(&self, mut write: tokio::net::tcp::OwnedWriteHalf) -> std::io::Result<()> {
        let mut events = self.events.subscribe();
        write
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
            )
            .await?;
        if self.announce_endpoint {
            write
                .write_all(b"event: endpoint\ndata: /messages?session=1\n\n")
                .await?;
        }
        write.flush().await?;

        while let Ok(event) = events.recv().await {
            if event == CLOSE_STREAM {
                break;
            }
            write.write_all(event.as_bytes()).await?;
            write.flush().await?;
        }
        write.shutdown().await
    }

    fn answer(&self, message: Value) {
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            self.methods.lock().push(method.to_string());
        }
        let Some(body) = reply(&message) else {
            return;
        };

        let event = format!("event: message\ndata: {}\n\n", body);
        let events = self.events.clone();
        let delay = if is_slow(&message) {
            SLOW_TOOL_DELAY
        } else {
            Duration::ZERO
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }
}

#[tokio::test]
async fn test_sse_discovery_and_call() {
    let server = SseServer::start(true).await;
    let manager = McpManager::default();

    manager
        .add_server(ServerConfig::sse("legacy", server.url()))
        .await
        .unwrap();
    assert_eq!(manager.get_transport_type("legacy"), Some(TransportKind::Sse));
    assert_eq!(manager.get_tools().len(), 2);
    assert!(server.received("notifications/initialized"));

    let result = manager
        .call_tool("mcp__legacy__echo", Some(json!({"text": "via sse"})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, "via sse");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sse_timeout_sends_cancellation() {
    let server = SseServer::start(true).await;
    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::sse("legacy", server.url()))
        .await
        .unwrap();

    let result = manager
        .call_tool("mcp__legacy__slow", None, Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(CallError::Timeout { .. })));
    assert!(wait_for(|| server.received("notifications/cancelled")).await);

    let result = manager
        .call_tool("mcp__legacy__echo", Some(json!({"text": "still fine"})), None)
        .await
        .unwrap();
    assert_eq!(result.output, "still fine");
    assert_eq!(
        manager.get_server_status("legacy").unwrap().state,
        ConnectionState::Connected
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sse_dropped_stream_marks_errored() {
    let server = SseServer::start(true).await;
    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::sse("legacy", server.url()))
        .await
        .unwrap();

    server.close_stream();

    assert!(
        wait_for(|| {
            manager
                .get_server_status("legacy")
                .is_some_and(|s| s.state == ConnectionState::Errored)
        })
        .await
    );
    assert!(manager.get_servers().is_empty());
    assert!(manager.get_server_status("legacy").unwrap().last_error.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sse_without_endpoint_fails_to_open() {
    let server = SseServer::start(false).await;
    let manager = McpManager::default();

    let adding = manager.add_server(ServerConfig::sse("legacy", server.url()));
    let closer = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        server.close_stream();
    };
    let (result, ()) = tokio::join!(adding, closer);

    assert!(matches!(
        result,
        Err(AddServerError::TransportOpenFailed {
            transport: TransportKind::Sse,
            ..
        })
    ));
    assert!(manager.list_servers().is_empty());
}
