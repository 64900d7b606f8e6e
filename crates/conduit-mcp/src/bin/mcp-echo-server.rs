//! Scriptable MCP server speaking newline-delimited JSON-RPC over stdio.
//!
//! Used by the integration tests to exercise the manager against a real
//! child process. Behaviour is selected with flags.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const CLIENT_PING_ID: &str = "fixture-ping";

const DEFAULT_TOOLS: &[&str] = &["echo", "add", "slow", "crash", "fail", "grow", "pinged"];

#[derive(Parser, Debug)]
#[command(name = "mcp-echo-server", about = "MCP test server over stdio")]
struct Args {
    /// Name reported in serverInfo
    #[arg(long, default_value = "echo-server")]
    name: String,

    /// Tools to advertise, comma separated
    #[arg(long, value_delimiter = ',')]
    tools: Option<Vec<String>>,

    /// Page size for tools/list; 0 returns a single page
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    #[arg(long)]
    no_resources: bool,

    #[arg(long)]
    no_prompts: bool,

    /// Advertise prompts but fail prompts/list
    #[arg(long)]
    broken_prompts: bool,

    /// Protocol version to answer with instead of echoing the client's
    #[arg(long)]
    protocol_version: Option<String>,

    /// Lines written to stderr at startup
    #[arg(long)]
    stderr: Vec<String>,

    /// Send a ping request to the client after the handshake
    #[arg(long)]
    ping_client: bool,

    /// Reject the first N tool calls with a JSON-RPC error
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Exit with this status right after the handshake
    #[arg(long)]
    exit_after_init: Option<i32>,

    /// Answer only the first N tools/list requests; later ones never get a reply
    #[arg(long)]
    stall_lists_after: Option<u32>,
}

struct Server {
    args: Args,
    tools: Mutex<Vec<String>>,
    rejections_left: AtomicU32,
    lists_served: AtomicU32,
    pong: AtomicBool,
    out: mpsc::UnboundedSender<Value>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    for line in &args.stderr {
        eprintln!("{}", line);
    }

    let (out, mut outgoing) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let server = Arc::new(Server {
        tools: Mutex::new(args.tools.clone().unwrap_or_else(|| {
            DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect()
        })),
        rejections_left: AtomicU32::new(args.fail_first),
        lists_served: AtomicU32::new(0),
        pong: AtomicBool::new(false),
        args,
        out,
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable line: {}", line);
            continue;
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.handle(message).await });
    }

    drop(server);
    let _ = writer.await;
    Ok(())
}

impl Server {
    async fn handle(&self, message: Value) {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);

        match (id, method) {
            (Some(id), Some(method)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let reply = match self.request(&method, &params).await {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err((code, text)) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": code, "message": text}
                    }),
                };
                self.send(reply);
            }
            (None, Some(method)) => self.notification(&method),
            (Some(id), None) => {
                if id == json!(CLIENT_PING_ID) && message.get("result").is_some() {
                    self.pong.store(true, Ordering::SeqCst);
                }
            }
            (None, None) => eprintln!("message without id or method"),
        }
    }

    fn send(&self, message: Value) {
        let _ = self.out.send(message);
    }

    fn notification(&self, method: &str) {
        if method != "notifications/initialized" {
            return;
        }
        if let Some(code) = self.args.exit_after_init {
            std::process::exit(code);
        }
        if self.args.ping_client {
            self.send(json!({"jsonrpc": "2.0", "id": CLIENT_PING_ID, "method": "ping"}));
        }
    }

    async fn request(&self, method: &str, params: &Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(self.initialize(params)),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let served = self.lists_served.fetch_add(1, Ordering::SeqCst);
                if self.args.stall_lists_after.is_some_and(|limit| served >= limit) {
                    std::future::pending::<()>().await;
                }
                Ok(self.list_tools(params))
            }
            "tools/call" => self.call_tool(params).await,
            "resources/list" if !self.args.no_resources => Ok(json!({
                "resources": [{
                    "uri": "mem://greeting",
                    "name": "greeting",
                    "description": "A friendly greeting",
                    "mimeType": "text/plain"
                }]
            })),
            "resources/read" if !self.args.no_resources => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                if uri != "mem://greeting" {
                    return Err((-32002, format!("resource not found: {}", uri)));
                }
                Ok(json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": "text/plain",
                        "text": format!("hello from {}", self.args.name)
                    }]
                }))
            }
            "prompts/list" if self.args.broken_prompts => {
                Err((-32603, "prompt store unavailable".to_string()))
            }
            "prompts/list" if !self.args.no_prompts => Ok(json!({
                "prompts": [{
                    "name": "summarize",
                    "description": "Summarize a topic",
                    "arguments": [{"name": "topic", "required": true}]
                }]
            })),
            "prompts/get" if !self.args.no_prompts => {
                let topic = params
                    .pointer("/arguments/topic")
                    .and_then(Value::as_str)
                    .unwrap_or("nothing");
                Ok(json!({
                    "description": "Summarize a topic",
                    "messages": [{
                        "role": "user",
                        "content": {"type": "text", "text": format!("Summarize {}", topic)}
                    }]
                }))
            }
            _ => Err((-32601, format!("method not found: {}", method))),
        }
    }

    fn initialize(&self, params: &Value) -> Value {
        let version = self.args.protocol_version.clone().unwrap_or_else(|| {
            params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or("2025-06-18")
                .to_string()
        });

        let mut capabilities = json!({"tools": {"listChanged": true}});
        if !self.args.no_resources {
            capabilities["resources"] = json!({});
        }
        if !self.args.no_prompts || self.args.broken_prompts {
            capabilities["prompts"] = json!({});
        }

        json!({
            "protocolVersion": version,
            "capabilities": capabilities,
            "serverInfo": {"name": self.args.name, "version": "0.1.0"}
        })
    }

    fn list_tools(&self, params: &Value) -> Value {
        let tools: Vec<Value> = self.tools.lock().iter().map(|name| tool_definition(name)).collect();
        if self.args.page_size == 0 {
            return json!({"tools": tools});
        }

        let start: usize = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = (start + self.args.page_size).min(tools.len());
        let page = tools.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
        if end < tools.len() {
            json!({"tools": page, "nextCursor": end.to_string()})
        } else {
            json!({"tools": page})
        }
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        if !self.tools.lock().iter().any(|t| t == name) {
            return Err((-32602, format!("unknown tool: {}", name)));
        }
        let rejected = self
            .rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err((-32000, "induced failure".to_string()));
        }

        match name {
            "echo" => {
                let text = arguments.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(text_result(text))
            }
            "add" => {
                let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                let mut result = text_result(&(a + b).to_string());
                result["structuredContent"] = json!({"sum": a + b});
                Ok(result)
            }
            "slow" => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(5_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(text_result("done"))
            }
            "crash" => {
                let code = arguments.get("code").and_then(Value::as_i64).unwrap_or(9);
                std::process::exit(code as i32);
            }
            "fail" => Ok(json!({
                "content": [{"type": "text", "text": "tool failed"}],
                "isError": true
            })),
            "grow" => {
                {
                    let mut tools = self.tools.lock();
                    if !tools.iter().any(|t| t == "extra") {
                        tools.push("extra".to_string());
                    }
                }
                self.send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
                Ok(text_result("grown"))
            }
            "pinged" => {
                let seen = self.pong.load(Ordering::SeqCst);
                Ok(text_result(if seen { "yes" } else { "no" }))
            }
            other => Ok(text_result(other)),
        }
    }
}

fn tool_definition(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Fixture tool {}", name),
        "inputSchema": {"type": "object", "properties": {}}
    })
}

fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}
