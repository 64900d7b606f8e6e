//! Configuration system for Conduit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::server::{ServerConfig, TransportConfig};

/// Main configuration struct for Conduit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings
    pub logging: LoggingConfig,
    /// MCP connection manager settings
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Settings for the MCP connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Configured servers, keyed by server name
    pub servers: BTreeMap<String, ServerEntry>,
    /// Default timeout for tool calls and discovery requests (ms)
    pub request_timeout_ms: u64,
    /// Timeout for opening a transport and completing the handshake (ms)
    pub connect_timeout_ms: u64,
    /// Maximum outstanding requests per connection
    pub max_pending_requests: usize,
    /// Capacity of each connection's notification queue
    pub notification_buffer: usize,
    /// Health monitor settings
    pub health: HealthConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            max_pending_requests: 64,
            notification_buffer: 64,
            health: HealthConfig::default(),
        }
    }
}

impl McpConfig {
    /// Server configurations for every enabled server.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.servers
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(name, entry)| ServerConfig {
                name: name.clone(),
                transport: entry.transport.clone(),
            })
            .collect()
    }

    /// Look up a single server configuration by name, enabled or not.
    pub fn server_config(&self, name: &str) -> Option<ServerConfig> {
        self.servers.get(name).map(|entry| ServerConfig {
            name: name.to_string(),
            transport: entry.transport.clone(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One `[mcp.servers.<name>]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Transport settings (`type = "stdio" | "http" | "sse" | "streamable_http"`)
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Whether the server is started with the others
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<TransportConfig> for ServerEntry {
    fn from(transport: TransportConfig) -> Self {
        Self {
            transport,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between health probes
    pub interval_secs: u64,
    /// Timeout for a single probe (ms)
    pub probe_timeout_ms: u64,
    /// Number of recent latency samples kept per server
    pub latency_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            probe_timeout_ms: 10_000,
            latency_window: 100,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "mcp.request_timeout_ms")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        let config_dir = Self::config_dir();

        Self::base_figment()
            // User config
            .merge(Toml::file(config_dir.join("config.toml")))
            // Project config
            .merge(Toml::file(".conduit/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".conduit/config.local.toml"))
            // Environment variables
            .merge(Env::prefixed("CONDUIT_").split("__"))
            .extract()
    }

    /// Load configuration from one explicit file plus the environment.
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Self::base_figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONDUIT_").split("__"))
            .extract()
    }

    fn base_figment() -> Figment {
        Figment::new().merge(Serialized::defaults(Config::default()))
    }

    /// Load and validate configuration.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::load_from(path),
            None => Self::load(),
        }
        .map_err(|e| Error::Config(e.to_string()))?;

        config.into_validated()
    }

    /// Reject a configuration with validation errors; log its warnings.
    pub fn into_validated(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            result.add_error(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Valid values: {:?}",
                    self.logging.level, valid_levels
                ),
            );
        }

        let mcp = &self.mcp;
        if mcp.request_timeout_ms == 0 {
            result.add_error("mcp.request_timeout_ms", "request_timeout_ms must be greater than 0");
        }
        if mcp.connect_timeout_ms == 0 {
            result.add_error("mcp.connect_timeout_ms", "connect_timeout_ms must be greater than 0");
        }
        if mcp.max_pending_requests == 0 {
            result.add_error(
                "mcp.max_pending_requests",
                "max_pending_requests must be greater than 0",
            );
        }
        if mcp.notification_buffer == 0 {
            result.add_error(
                "mcp.notification_buffer",
                "notification_buffer must be greater than 0",
            );
        }
        if mcp.health.interval_secs == 0 {
            result.add_error("mcp.health.interval_secs", "interval_secs must be greater than 0");
        }
        if mcp.health.latency_window == 0 {
            result.add_error("mcp.health.latency_window", "latency_window must be greater than 0");
        }
        if mcp.health.probe_timeout_ms > mcp.health.interval_secs.saturating_mul(1000) {
            result.add_warning(
                "mcp.health.probe_timeout_ms",
                "probe timeout is longer than the probe interval",
            );
        }

        for (name, entry) in &mcp.servers {
            let field = format!("mcp.servers.{}", name);
            let config = ServerConfig {
                name: name.clone(),
                transport: entry.transport.clone(),
            };
            if let Err(e) = config.validate() {
                result.add_error(field.clone(), e.to_string());
            }
            if let Some(headers) = entry.transport.headers() {
                for (key, value) in headers {
                    if value.is_empty() {
                        result.add_warning(
                            format!("{}.headers.{}", field, key),
                            "header value is empty string",
                        );
                    }
                }
            }
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("conduit"))
            .unwrap_or_else(|| PathBuf::from("~/.config/conduit"))
    }
}
