//! A minimal MCP server brain shared by the HTTP-family tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};

pub const SERVER_NAME: &str = "remote";
pub const SLOW_TOOL_DELAY: Duration = Duration::from_secs(2);

/// The JSON-RPC reply to `message`, or `None` for notifications and responses.
pub fn reply(message: &Value) -> Option<Value> {
    let id = message.get("id")?.clone();
    let method = message.get("method")?.as_str()?;
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": params
                .get("protocolVersion")
                .cloned()
                .unwrap_or_else(|| json!("2025-06-18")),
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": SERVER_NAME, "version": "1.0.0"}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": [
                {"name": "echo", "inputSchema": {"type": "object"}},
                {"name": "slow", "inputSchema": {"type": "object"}}
            ]
        })),
        "tools/call" => match params.get("name").and_then(Value::as_str) {
            Some("echo") | Some("slow") => {
                let text = params
                    .pointer("/arguments/text")
                    .and_then(Value::as_str)
                    .unwrap_or("done");
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            other => Err((-32602, format!("unknown tool: {:?}", other))),
        },
        other => Err((-32601, format!("method not found: {}", other))),
    };

    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, text)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": text}
        }),
    })
}

/// Whether `message` calls the slow tool.
pub fn is_slow(message: &Value) -> bool {
    message.get("method").and_then(Value::as_str) == Some("tools/call")
        && message.pointer("/params/name").and_then(Value::as_str) == Some("slow")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
