//! MCP server configuration.
//!
//! A [`ServerConfig`] names a server and describes how to reach it. The
//! transport is a closed set of variants: a child process spoken to over
//! stdio, or one of the HTTP-family endpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ServerConfigError;

/// Placeholder shown instead of credential values in debug output.
const REDACTED: &str = "***";

/// The kind of transport a server is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON-RPC over stdin/stdout.
    Stdio,
    /// Plain request/response HTTP.
    Http,
    /// Legacy HTTP+SSE: a GET event stream plus a POST endpoint.
    Sse,
    /// Streamable HTTP: POST requests plus an optional GET notification stream.
    StreamableHttp,
}

impl TransportKind {
    /// Whether this kind is one of the HTTP-family transports.
    pub fn is_http_family(&self) -> bool {
        !matches!(self, TransportKind::Stdio)
    }

    /// Stable lowercase name, as used in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable_http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach a server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a child process.
    Stdio {
        /// Executable to run.
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables for the child.
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory for the child.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Plain HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Legacy HTTP+SSE endpoint.
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    /// The transport kind of this configuration.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Http { .. } => TransportKind::Http,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }

    /// The endpoint URL for HTTP-family transports.
    pub fn url(&self) -> Option<&str> {
        match self {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Http { url, .. }
            | TransportConfig::Sse { url, .. }
            | TransportConfig::StreamableHttp { url, .. } => Some(url),
        }
    }

    /// Static headers for HTTP-family transports.
    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Http { headers, .. }
            | TransportConfig::Sse { headers, .. }
            | TransportConfig::StreamableHttp { headers, .. } => Some(headers),
        }
    }
}

/// Keys are shown, values are not: env and headers routinely carry API keys.
fn redacted(map: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    map.keys().map(|k| (k.as_str(), REDACTED)).collect()
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &redacted(env))
                .field("cwd", cwd)
                .finish(),
            TransportConfig::Http { url, headers }
            | TransportConfig::Sse { url, headers }
            | TransportConfig::StreamableHttp { url, headers } => f
                .debug_struct(match self.kind() {
                    TransportKind::Sse => "Sse",
                    TransportKind::StreamableHttp => "StreamableHttp",
                    _ => "Http",
                })
                .field("url", url)
                .field("headers", &redacted(headers))
                .finish(),
        }
    }
}

/// Configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; immutable once registered.
    pub name: String,
    /// How to reach the server.
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                cwd: None,
            },
        }
    }

    /// Create a plain HTTP server configuration.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Http {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    /// Create a legacy SSE server configuration.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    /// Create a streamable HTTP server configuration.
    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::StreamableHttp {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    /// Set the command arguments (stdio only).
    pub fn with_args<I, S>(mut self, new_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let TransportConfig::Stdio { args, .. } = &mut self.transport {
            *args = new_args.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Add an environment variable (stdio only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Set the working directory (stdio only).
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let TransportConfig::Stdio { cwd, .. } = &mut self.transport {
            *cwd = Some(dir.into());
        }
        self
    }

    /// Add a header sent with every request (HTTP family only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.transport {
            TransportConfig::Stdio { .. } => {}
            TransportConfig::Http { headers, .. }
            | TransportConfig::Sse { headers, .. }
            | TransportConfig::StreamableHttp { headers, .. } => {
                headers.insert(key.into(), value.into());
            }
        }
        self
    }

    /// The transport kind of this server.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Reject a configuration that could never be connected.
    ///
    /// Nothing here touches the network or the filesystem.
    pub fn validate(&self) -> Result<(), ServerConfigError> {
        validate_server_name(&self.name)?;

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ServerConfigError::EmptyCommand {
                        name: self.name.clone(),
                    });
                }
            }
            TransportConfig::Http { url, .. }
            | TransportConfig::Sse { url, .. }
            | TransportConfig::StreamableHttp { url, .. } => {
                let parsed = url::Url::parse(url).map_err(|e| ServerConfigError::InvalidUrl {
                    name: self.name.clone(),
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ServerConfigError::UnsupportedScheme {
                        name: self.name.clone(),
                        scheme: parsed.scheme().to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Server names end up inside `mcp__<server>__<tool>`, so `__` is reserved
/// and a name may not start or end with `_`. That keeps the first `__` after
/// the prefix the only possible separator.
pub fn validate_server_name(name: &str) -> Result<(), ServerConfigError> {
    if name.is_empty() {
        return Err(ServerConfigError::EmptyName);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ServerConfigError::InvalidName {
            name: name.to_string(),
            reason: "must not contain whitespace",
        });
    }
    if name.contains("__") {
        return Err(ServerConfigError::InvalidName {
            name: name.to_string(),
            reason: "must not contain '__'",
        });
    }
    if name.starts_with('_') || name.ends_with('_') {
        return Err(ServerConfigError::InvalidName {
            name: name.to_string(),
            reason: "must not start or end with '_'",
        });
    }
    Ok(())
}
