//! Manager tests for the `http` and `streamable_http` transports.

mod common;

use std::time::Duration;

use conduit_core::{ServerConfig, TransportKind};
use conduit_mcp::{AddServerError, CallError, ConnectionState, McpError, McpManager, TransportError};
use futures::future::join_all;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::{is_slow, reply, wait_for, SLOW_TOOL_DELAY};

/// Answers JSON-RPC POSTs either as plain JSON or as a one-event SSE stream.
struct McpResponder {
    streamed: bool,
    session: Option<&'static str>,
}

impl McpResponder {
    fn json() -> Self {
        Self {
            streamed: false,
            session: None,
        }
    }

    fn streamed(session: &'static str) -> Self {
        Self {
            streamed: true,
            session: Some(session),
        }
    }
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(message) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let Some(body) = reply(&message) else {
            return ResponseTemplate::new(202);
        };

        let mut template = if self.streamed {
            ResponseTemplate::new(200).set_body_raw(
                format!("event: message\ndata: {}\n\n", body),
                "text/event-stream",
            )
        } else {
            ResponseTemplate::new(200).set_body_json(body)
        };
        if let Some(session) = self.session {
            template = template.insert_header("mcp-session-id", session);
        }
        if is_slow(&message) {
            template = template.set_delay(SLOW_TOOL_DELAY);
        }
        template
    }
}

async fn mount_json(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder::json())
        .mount(server)
        .await;
}

fn url(server: &MockServer) -> String {
    format!("{}/mcp", server.uri())
}

#[tokio::test]
async fn test_http_discovery_and_call() {
    let server = MockServer::start().await;
    mount_json(&server).await;

    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::http("remote", url(&server)))
        .await
        .unwrap();

    assert_eq!(manager.get_transport_type("remote"), Some(TransportKind::Http));
    let names: Vec<String> = manager
        .get_tools()
        .into_iter()
        .map(|t| t.qualified_name)
        .collect();
    assert_eq!(names, vec!["mcp__remote__echo", "mcp__remote__slow"]);

    let result = manager
        .call_tool("mcp__remote__echo", Some(json!({"text": "over http"})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, "over http");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_configured_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(McpResponder::json())
        .mount(&server)
        .await;

    let manager = McpManager::default();
    let config = ServerConfig::http("remote", url(&server))
        .with_header("Authorization", "Bearer s3cret");
    manager.add_server(config).await.unwrap();
    assert_eq!(manager.get_servers(), vec!["remote".to_string()]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_http_error_status_aborts_add() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let manager = McpManager::default();
    let result = manager
        .add_server(ServerConfig::http("remote", url(&server)))
        .await;

    match result {
        Err(AddServerError::HandshakeFailed {
            source: McpError::Transport(TransportError::HttpStatus { status, body }),
            ..
        }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected an HTTP status failure, got {:?}", other),
    }
    assert!(manager.list_servers().is_empty());
}

#[tokio::test]
async fn test_http_timeout_keeps_connection() {
    let server = MockServer::start().await;
    mount_json(&server).await;

    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::http("remote", url(&server)))
        .await
        .unwrap();

    let result = manager
        .call_tool("mcp__remote__slow", None, Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(CallError::Timeout { .. })));

    let status = manager.get_server_status("remote").unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.failure_count, 1);

    let result = manager
        .call_tool("mcp__remote__echo", Some(json!({"text": "ok"})), None)
        .await
        .unwrap();
    assert_eq!(result.output, "ok");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_http_concurrent_calls_are_demultiplexed() {
    let server = MockServer::start().await;
    mount_json(&server).await;

    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::http("remote", url(&server)))
        .await
        .unwrap();

    let calls = (0..8).map(|i| {
        let manager = manager.clone();
        async move {
            let text = format!("call-{}", i);
            let result = manager
                .call_tool("mcp__remote__echo", Some(json!({"text": text})), None)
                .await
                .unwrap();
            (text, result.output)
        }
    });
    for (sent, received) in join_all(calls).await {
        assert_eq!(sent, received);
    }

    let status = manager.get_server_status("remote").unwrap();
    assert_eq!(status.success_count, 8);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_streamable_session_lifecycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder::streamed("sess-42"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "sess-42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::streamable_http("remote", url(&server)))
        .await
        .unwrap();
    assert_eq!(
        manager.get_transport_type("remote"),
        Some(TransportKind::StreamableHttp)
    );

    let result = manager
        .call_tool("mcp__remote__echo", Some(json!({"text": "streamed"})), None)
        .await
        .unwrap();
    assert_eq!(result.output, "streamed");

    // Every POST after initialize carries the assigned session id.
    let requests = server.received_requests().await.unwrap();
    let posts: Vec<&Request> = requests
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .collect();
    assert!(posts.len() >= 3);
    assert!(posts[0].headers.get("mcp-session-id").is_none());
    for post in &posts[1..] {
        let session = post
            .headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok());
        assert_eq!(session, Some("sess-42"));
    }

    manager.shutdown().await;
    server.verify().await;
}

#[tokio::test]
async fn test_streamable_dropped_stream_marks_errored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder::streamed("sess-7"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(": connected\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let manager = McpManager::default();
    manager
        .add_server(ServerConfig::streamable_http("remote", url(&server)))
        .await
        .unwrap();

    assert!(
        wait_for(|| {
            manager
                .get_server_status("remote")
                .is_some_and(|s| s.state == ConnectionState::Errored)
        })
        .await
    );
    assert!(manager.get_tools().is_empty());
    assert!(matches!(
        manager.call_tool("mcp__remote__echo", None, None).await,
        Err(CallError::ServerNotConnected(_))
    ));

    manager.shutdown().await;
}
