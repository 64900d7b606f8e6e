//! Manager tests against the `mcp-echo-server` fixture over stdio.

mod common;

use std::time::Duration;

use conduit_core::{ServerConfig, TransportKind};
use conduit_mcp::{
    AddServerError, CallError, ConnectionState, ManagerOptions, McpError, McpManager,
    RemoveServerError,
};
use serde_json::json;

use common::wait_for;

const FIXTURE: &str = env!("CARGO_BIN_EXE_mcp-echo-server");

fn fixture(name: &str, args: &[&str]) -> ServerConfig {
    ServerConfig::stdio(name, FIXTURE).with_args(args.iter().copied())
}

fn tool_names(manager: &McpManager) -> Vec<String> {
    manager
        .get_tools()
        .into_iter()
        .map(|t| t.qualified_name)
        .collect()
}

#[tokio::test]
async fn test_add_then_remove() {
    let manager = McpManager::default();

    manager.add_server(fixture("echo", &[])).await.unwrap();
    assert_eq!(manager.get_servers(), vec!["echo".to_string()]);
    assert_eq!(manager.get_transport_type("echo"), Some(TransportKind::Stdio));

    manager.remove_server("echo").await.unwrap();
    assert!(manager.get_servers().is_empty());
    assert!(manager.get_tools().is_empty());
    assert!(manager.get_transport_type("echo").is_none());
    assert!(manager.get_server_status("echo").is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_twice() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    assert!(manager.remove_server("echo").await.is_ok());
    assert!(matches!(
        manager.remove_server("echo").await,
        Err(RemoveServerError::UnknownServer(name)) if name == "echo"
    ));
    assert!(manager.list_servers().is_empty());
}

#[tokio::test]
async fn test_single_tool_scenario() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("echo", &["--tools", "ping", "--no-resources", "--no-prompts"]))
        .await
        .unwrap();

    let tools = manager.get_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].qualified_name, "mcp__echo__ping");
    assert_eq!(tools[0].raw_name, "ping");
    assert_eq!(tools[0].server_name, "echo");
    assert_eq!(tools[0].description.as_deref(), Some("Fixture tool ping"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_same_tool_on_two_servers() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("serverA", &["--tools", "read"]))
        .await
        .unwrap();
    manager
        .add_server(fixture("serverB", &["--tools", "read"]))
        .await
        .unwrap();

    let names = tool_names(&manager);
    assert!(names.contains(&"mcp__serverA__read".to_string()));
    assert!(names.contains(&"mcp__serverB__read".to_string()));
    assert!(!names.contains(&"read".to_string()));
    assert_eq!(names.len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_leaves_existing_untouched() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();
    let before = manager.get_server_status("echo").unwrap().connected_since;

    let result = manager.add_server(fixture("echo", &["--tools", "other"])).await;
    assert!(matches!(result, Err(AddServerError::DuplicateServer(name)) if name == "echo"));

    assert_eq!(manager.get_server_status("echo").unwrap().connected_since, before);
    assert!(tool_names(&manager).contains(&"mcp__echo__echo".to_string()));
    let result = manager
        .call_tool("mcp__echo__echo", Some(json!({"text": "still here"})), None)
        .await
        .unwrap();
    assert_eq!(result.output, "still here");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_adds() {
    let manager = McpManager::default();
    let (a, b) = tokio::join!(
        manager.add_server(fixture("alpha", &[])),
        manager.add_server(fixture("beta", &[])),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(
        manager.get_servers(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn test_tools_never_half_populated() {
    let manager = McpManager::default();
    let adding = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.add_server(fixture("echo", &["--page-size", "2"])).await })
    };

    while !adding.is_finished() {
        let count = manager
            .get_tools()
            .iter()
            .filter(|t| t.server_name == "echo")
            .count();
        assert!(count == 0 || count == 7, "observed {} tools", count);
        tokio::task::yield_now().await;
    }
    adding.await.unwrap().unwrap();
    assert_eq!(manager.get_tools().len(), 7);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_accounting() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("flaky", &["--fail-first", "3"]))
        .await
        .unwrap();

    for _ in 0..3 {
        let result = manager
            .call_tool("mcp__flaky__echo", Some(json!({"text": "hi"})), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("induced failure"));
    }
    let result = manager
        .call_tool("mcp__flaky__echo", Some(json!({"text": "hi"})), None)
        .await
        .unwrap();
    assert!(result.success);

    let report = manager.get_health_report();
    assert_eq!(report.len(), 1);
    let health = &report[0];
    assert_eq!(health.success_count, 1);
    assert_eq!(health.failure_count, 3);
    assert!((health.success_rate - 0.25).abs() < f64::EPSILON);
    assert!(health.last_success_at.is_some());
    assert!(health.last_error.is_some());
    assert!(health.avg_latency.is_some());
    assert!(health.p95_latency.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_timeout_keeps_connection() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    let result = manager
        .call_tool(
            "mcp__echo__slow",
            Some(json!({"ms": 3000})),
            Some(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(result, Err(CallError::Timeout { ref server, .. }) if server == "echo"));

    let status = manager.get_server_status("echo").unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.failure_count, 1);

    let result = manager
        .call_tool("mcp__echo__echo", Some(json!({"text": "after"})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, "after");

    manager.shutdown().await;
}

/// A manager whose connections allow only two outstanding requests.
fn tight_manager() -> McpManager {
    let mut options = ManagerOptions::default();
    options.transport.max_pending = 2;
    McpManager::new(options)
}

#[tokio::test]
async fn test_abandoned_calls_release_capacity() {
    let manager = tight_manager();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    for _ in 0..4 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            manager.call_tool(
                "mcp__echo__slow",
                Some(json!({"ms": 3000})),
                Some(Duration::from_secs(10)),
            ),
        )
        .await;
        assert!(abandoned.is_err());
    }

    let result = manager
        .call_tool("mcp__echo__echo", Some(json!({"text": "still here"})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.output, "still here");
    assert_eq!(
        manager.get_server_status("echo").unwrap().state,
        ConnectionState::Connected
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_monitor_restart_during_stalled_check() {
    let manager = tight_manager();
    manager
        .add_server(fixture("stalling", &["--stall-lists-after", "1"]))
        .await
        .unwrap();

    // Every health check after discovery hangs; each restart drops the one in flight.
    for _ in 0..5 {
        manager
            .start_health_monitor_with(Duration::from_millis(20))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    let result = manager
        .call_tool("mcp__stalling__echo", Some(json!({"text": "ok"})), None)
        .await
        .unwrap();
    assert!(result.success);

    manager.stop_health_monitor();
    let result = manager
        .call_tool("mcp__stalling__echo", Some(json!({"text": "ok"})), None)
        .await
        .unwrap();
    assert!(result.success);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_tool_errors_are_results() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    let result = manager.call_tool("mcp__echo__fail", None, None).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("tool failed"));

    let result = manager
        .call_tool("mcp__echo__add", Some(json!({"a": 2, "b": 3})), None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.structured_content, Some(json!({"sum": 5.0})));

    assert!(matches!(
        manager.call_tool("mcp__echo__missing", None, None).await,
        Err(CallError::UnknownTool(_))
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_aborts_add() {
    let manager = McpManager::default();

    let result = manager
        .add_server(fixture("old", &["--protocol-version", "1999-01-01"]))
        .await;
    match result {
        Err(AddServerError::HandshakeFailed {
            server,
            source: McpError::VersionMismatch { received, .. },
        }) => {
            assert_eq!(server, "old");
            assert_eq!(received, "1999-01-01");
        }
        other => panic!("expected version mismatch, got {:?}", other),
    }
    assert!(manager.list_servers().is_empty());
    assert!(manager.get_tools().is_empty());
}

#[tokio::test]
async fn test_partial_discovery() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("echo", &["--broken-prompts", "--no-resources"]))
        .await
        .unwrap();

    assert_eq!(manager.get_tools().len(), 7);
    assert!(manager.get_resources().is_empty());
    assert!(manager.get_prompts().is_empty());

    let summary = &manager.list_servers()[0];
    assert_eq!(summary.state, ConnectionState::Connected);
    assert_eq!(summary.issues.len(), 1);
    assert!(summary.issues[0].starts_with("prompts discovery failed"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_paginated_discovery() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("paged", &["--page-size", "3"]))
        .await
        .unwrap();

    assert_eq!(manager.get_tools().len(), 7);
    assert_eq!(manager.list_servers()[0].tool_count, 7);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_resources_and_prompts() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("echo", &["--name", "greeter"]))
        .await
        .unwrap();

    let resources = manager.get_resources();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].qualified_name, "mcp__echo__greeting");

    let read = manager.read_resource("mcp__echo__greeting", None).await.unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("hello from greeter"));

    let read = manager
        .read_resource_uri("echo", "mem://nowhere", None)
        .await;
    assert!(matches!(read, Err(CallError::Rejected { code: -32002, .. })));

    let mut arguments = std::collections::BTreeMap::new();
    arguments.insert("topic".to_string(), "rust".to_string());
    let prompt = manager
        .get_prompt("mcp__echo__summarize", Some(arguments), None)
        .await
        .unwrap();
    assert_eq!(prompt.messages.len(), 1);
    assert_eq!(prompt.messages[0].role, "user");

    let summary = &manager.list_servers()[0];
    assert_eq!(summary.server_name.as_deref(), Some("greeter"));
    assert_eq!(summary.resource_count, 1);
    assert_eq!(summary.prompt_count, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_crash_marks_errored() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    let result = manager
        .call_tool("mcp__echo__crash", Some(json!({"code": 4})), None)
        .await;
    assert!(matches!(result, Err(CallError::Transport { .. })));

    assert!(
        wait_for(|| {
            manager
                .get_server_status("echo")
                .is_some_and(|s| s.state == ConnectionState::Errored)
        })
        .await
    );

    let status = manager.get_server_status("echo").unwrap();
    assert!(!status.connected);
    assert_eq!(status.tool_count, 0);
    assert!(status.uptime.is_none());
    assert!(status.last_error.unwrap().contains("peer exited"));
    assert!(manager.get_servers().is_empty());

    assert!(matches!(
        manager.call_tool("mcp__echo__echo", None, None).await,
        Err(CallError::ServerNotConnected(name)) if name == "echo"
    ));

    // An Errored entry can be replaced by a fresh connection.
    manager.add_server(fixture("echo", &[])).await.unwrap();
    assert_eq!(manager.get_servers(), vec!["echo".to_string()]);
    assert!(manager
        .call_tool("mcp__echo__echo", Some(json!({"text": "back"})), None)
        .await
        .unwrap()
        .success);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exit_after_handshake() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("brief", &["--exit-after-init", "3"]))
        .await
        .unwrap();

    assert!(
        wait_for(|| {
            manager
                .get_server_status("brief")
                .is_some_and(|s| s.state == ConnectionState::Errored)
        })
        .await
    );
    let summary = &manager.list_servers()[0];
    assert_eq!(
        summary.last_error.as_deref(),
        Some("peer exited with status 3")
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_list_changed_refreshes_tools() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();
    assert!(!tool_names(&manager).contains(&"mcp__echo__extra".to_string()));

    let result = manager.call_tool("mcp__echo__grow", None, None).await.unwrap();
    assert_eq!(result.output, "grown");

    assert!(wait_for(|| tool_names(&manager).contains(&"mcp__echo__extra".to_string())).await);
    let result = manager.call_tool("mcp__echo__extra", None, None).await.unwrap();
    assert_eq!(result.output, "extra");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("echo", &["--ping-client"]))
        .await
        .unwrap();

    let mut answered = false;
    for _ in 0..50 {
        let result = manager.call_tool("mcp__echo__pinged", None, None).await.unwrap();
        if result.output == "yes" {
            answered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(answered);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let manager = McpManager::default();
    manager
        .add_server(fixture("noisy", &["--stderr", "booting up", "--stderr", "ready"]))
        .await
        .unwrap();

    assert!(
        wait_for(|| {
            manager
                .stderr_tail("noisy")
                .is_some_and(|lines| lines.iter().any(|l| l == "ready"))
        })
        .await
    );
    assert!(manager
        .stderr_tail("noisy")
        .unwrap()
        .contains(&"booting up".to_string()));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_monitor_probes() {
    let manager = McpManager::default();
    manager.add_server(fixture("echo", &[])).await.unwrap();

    manager
        .start_health_monitor_with(Duration::from_millis(100))
        .unwrap();
    manager
        .start_health_monitor_with(Duration::from_millis(100))
        .unwrap();
    assert!(manager.is_health_monitor_running());

    assert!(
        wait_for(|| {
            manager
                .get_server_status("echo")
                .is_some_and(|s| s.success_count >= 2)
        })
        .await
    );

    manager.stop_health_monitor();
    manager.stop_health_monitor();
    assert!(!manager.is_health_monitor_running());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_connect_all_reports_each_server() {
    let manager = McpManager::default();
    let outcomes = manager
        .connect_all(vec![
            fixture("good", &[]),
            ServerConfig::stdio("bad", "/nonexistent/conduit-fixture"),
        ])
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().any(|(name, r)| name == "good" && r.is_ok()));
    assert!(outcomes.iter().any(|(name, r)| name == "bad"
        && matches!(r, Err(AddServerError::TransportOpenFailed { .. }))));
    assert_eq!(manager.get_servers(), vec!["good".to_string()]);

    manager.shutdown().await;
    assert!(manager.list_servers().is_empty());
}
