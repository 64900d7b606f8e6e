//! MCP server management commands.

use std::time::Duration;

use anyhow::Context;
use conduit_core::error::format_error_with_suggestion;
use conduit_core::Config;
use conduit_mcp::{ConnectionState, HealthSnapshot, McpManager};
use serde_json::Value;
use tracing::info;

use crate::McpAction;

/// Run an `mcp` subcommand with a manager that lives for this invocation.
///
/// Ctrl-C interrupts the command; either way every transport is closed
/// before returning.
pub async fn handle(action: McpAction, config: &Config) -> anyhow::Result<()> {
    let manager = McpManager::from_config(&config.mcp);

    let result = tokio::select! {
        result = run(action, config, &manager) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    manager.shutdown().await;
    result
}

async fn run(action: McpAction, config: &Config, manager: &McpManager) -> anyhow::Result<()> {
    match action {
        McpAction::List { json } => {
            connect_configured(config, manager).await;
            list(config, manager, json)
        }
        McpAction::Tools { server, json } => {
            connect_configured(config, manager).await;
            tools(manager, server.as_deref(), json)
        }
        McpAction::Resources => {
            connect_configured(config, manager).await;
            resources(manager);
            Ok(())
        }
        McpAction::Call {
            tool,
            args,
            timeout_ms,
        } => {
            let arguments = parse_arguments(args.as_deref())?;
            connect_owner(config, manager, &tool).await;
            call(manager, &tool, arguments, timeout_ms.map(Duration::from_millis)).await
        }
        McpAction::Read { resource } => {
            connect_owner(config, manager, &resource).await;
            let result = manager
                .read_resource(&resource, None)
                .await
                .map_err(describe)?;
            for contents in result.contents {
                match (contents.text, contents.blob) {
                    (Some(text), _) => println!("{}", text),
                    (None, Some(blob)) => println!("<{} bytes of base64 data>", blob.len()),
                    (None, None) => println!("<empty>"),
                }
            }
            Ok(())
        }
        McpAction::Health {
            watch,
            interval,
            json,
        } => {
            connect_configured(config, manager).await;
            if watch {
                let interval = interval
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| config.mcp.health.interval());
                watch_health(manager, interval, json).await
            } else {
                print_health(&manager.get_health_report(), json)
            }
        }
        McpAction::Status { name, json } => {
            let Some(server) = config.mcp.server_config(&name) else {
                println!("No MCP server named '{}' is configured.", name);
                return Ok(());
            };
            if let Err(e) = manager.add_server(server).await {
                println!("✗ {}", e);
            }
            match manager.get_server_status(&name) {
                Some(status) => print_health(&[status], json),
                None => Ok(()),
            }
        }
        McpAction::Logs { name } => {
            let Some(server) = config.mcp.server_config(&name) else {
                println!("No MCP server named '{}' is configured.", name);
                return Ok(());
            };
            manager
                .add_server(server)
                .await
                .map_err(describe)?;
            // Give the child a moment to write its startup output
            tokio::time::sleep(Duration::from_millis(200)).await;
            match manager.stderr_tail(&name) {
                Some(lines) if !lines.is_empty() => lines.iter().for_each(|l| println!("{}", l)),
                _ => println!("No stderr output from '{}'.", name),
            }
            Ok(())
        }
    }
}

/// Connect every enabled server; failures are reported but not fatal.
async fn connect_configured(config: &Config, manager: &McpManager) {
    let servers = config.mcp.server_configs();
    if servers.is_empty() {
        return;
    }
    for (name, result) in manager.connect_all(servers).await {
        if let Err(e) = result {
            eprintln!("✗ {}: {}", name, e);
        }
    }
}

/// Connect only the server a qualified name points at.
async fn connect_owner(config: &Config, manager: &McpManager, qualified_name: &str) {
    let Some((server, _)) = conduit_mcp::parse_qualified_name(qualified_name) else {
        return;
    };
    if let Some(server) = config.mcp.server_config(server) {
        if let Err(e) = manager.add_server(server).await {
            eprintln!("✗ {}", e);
        }
    }
}

fn list(config: &Config, manager: &McpManager, json: bool) -> anyhow::Result<()> {
    let summaries = manager.list_servers();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("Configured MCP servers:\n");
    if config.mcp.servers.is_empty() {
        println!("  No MCP servers configured.");
        println!("\n  Add a [mcp.servers.<name>] table to {}", Config::config_dir().join("config.toml").display());
        return Ok(());
    }

    for summary in &summaries {
        let marker = if summary.state == ConnectionState::Connected { "✓" } else { "✗" };
        println!(
            "  {} {} ({}) - {}",
            marker, summary.name, summary.transport, summary.state
        );
        if let (Some(name), Some(version)) = (&summary.server_name, &summary.server_version) {
            println!("    Server: {} {}", name, version);
        }
        println!(
            "    Tools: {}, resources: {}, prompts: {}",
            summary.tool_count, summary.resource_count, summary.prompt_count
        );
        if let Some(error) = &summary.last_error {
            println!("    Last error: {}", error);
        }
        for issue in &summary.issues {
            println!("    Issue: {}", issue);
        }
    }

    for (name, entry) in &config.mcp.servers {
        if !entry.enabled {
            println!("  - {} ({}) - disabled", name, entry.transport.kind());
        }
    }
    Ok(())
}

fn tools(manager: &McpManager, server: Option<&str>, json: bool) -> anyhow::Result<()> {
    let tools: Vec<_> = manager
        .get_tools()
        .into_iter()
        .filter(|t| server.map_or(true, |s| t.server_name == s))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {} - {}", tool.qualified_name, description),
            None => println!("  {}", tool.qualified_name),
        }
    }
    Ok(())
}

fn resources(manager: &McpManager) {
    let resources = manager.get_resources();
    let prompts = manager.get_prompts();

    println!("Resources:");
    if resources.is_empty() {
        println!("  none");
    }
    for resource in &resources {
        println!("  {} ({})", resource.qualified_name, resource.uri);
    }

    println!("\nPrompts:");
    if prompts.is_empty() {
        println!("  none");
    }
    for prompt in &prompts {
        let arguments: Vec<&str> = prompt.arguments.iter().map(|a| a.name.as_str()).collect();
        println!("  {}({})", prompt.qualified_name, arguments.join(", "));
    }
}

async fn call(
    manager: &McpManager,
    tool: &str,
    arguments: Option<Value>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let result = manager
        .call_tool(tool, arguments, timeout)
        .await
        .map_err(describe)?;

    if result.success {
        println!("{}", result.output);
        if let Some(structured) = &result.structured_content {
            println!("{}", serde_json::to_string_pretty(structured)?);
        }
        Ok(())
    } else {
        anyhow::bail!(
            "Tool call failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

async fn watch_health(manager: &McpManager, interval: Duration, json: bool) -> anyhow::Result<()> {
    manager.start_health_monitor_with(interval)?;
    loop {
        print_health(&manager.get_health_report(), json)?;
        tokio::time::sleep(interval).await;
        println!();
    }
}

fn print_health(report: &[HealthSnapshot], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if report.is_empty() {
        println!("No MCP servers connected.");
        return Ok(());
    }

    for health in report {
        let marker = if health.connected { "✓" } else { "✗" };
        let transport = health
            .transport
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{} {} ({}) - {}", marker, health.server, transport, health.state);
        println!("    Tools: {}", health.tool_count);
        println!("    Uptime: {}", format_duration(health.uptime));
        println!(
            "    Latency: avg {}, p95 {}",
            format_duration(health.avg_latency),
            format_duration(health.p95_latency)
        );
        println!(
            "    Calls: {} ok, {} failed ({:.0}% success)",
            health.success_count,
            health.failure_count,
            health.success_rate * 100.0
        );
        if let (Some(error), Some(at)) = (&health.last_error, health.last_error_at) {
            println!("    Last error: {} ({})", error, at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    Ok(())
}

/// An error with its recovery suggestion, ready for the top level.
fn describe(error: impl Into<conduit_core::Error>) -> anyhow::Error {
    anyhow::anyhow!(format_error_with_suggestion(&error.into()))
}

fn parse_arguments(args: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(args) = args else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(Some(value))
}

fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "-".to_string();
    };
    let millis = duration.as_millis();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
