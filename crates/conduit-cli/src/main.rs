//! # conduit-cli
//!
//! Command-line interface for Conduit.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conduit_core::error::format_error_with_suggestion;
use conduit_core::Config;

mod commands;

/// Conduit - connect to MCP servers and keep an eye on them
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the default locations
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// MCP server management
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum McpAction {
    /// Connect to configured servers and list them
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List the tools of connected servers
    Tools {
        /// Only show tools of this server
        #[arg(short, long)]
        server: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List resources and prompts of connected servers
    Resources,
    /// Call a tool by qualified name (mcp__<server>__<tool>)
    Call {
        /// Qualified tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
        /// Call timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
    /// Read a resource by qualified name
    Read {
        /// Qualified resource name
        resource: String,
    },
    /// Show a health report for every configured server
    Health {
        /// Keep probing and reprint the report until interrupted
        #[arg(short, long)]
        watch: bool,
        /// Seconds between reports in watch mode
        #[arg(short, long)]
        interval: Option<u64>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show the status of one server
    Status {
        /// Server name
        name: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show recent stderr output of a stdio server
    Logs {
        /// Server name
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration files
    Validate,
    /// Print the user configuration directory
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so the configured level applies
    let loaded = match cli.config.as_deref() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            let error = conduit_core::Error::Config(e.to_string());
            anyhow::bail!(format_error_with_suggestion(&error));
        }
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Mcp { action } => {
            let config = config
                .into_validated()
                .map_err(|e| anyhow::anyhow!(format_error_with_suggestion(&e)))?;
            commands::mcp::handle(action, &config).await?;
        }
        Commands::Config { action } => {
            commands::config::handle(action, config, cli.config.as_deref())?;
        }
        Commands::Version => {
            println!("conduit {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
