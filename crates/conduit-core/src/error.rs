//! Error types for Conduit.
//!
//! This module provides the workspace-wide error type, with recovery
//! suggestions for the CLI, and the validation errors raised for a
//! malformed server configuration before any I/O happens.

use thiserror::Error;

/// Result type alias using the Conduit error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Conduit.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server configuration rejected before connecting
    #[error("{0}")]
    ServerConfig(#[from] ServerConfigError),

    /// MCP error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/conduit/config.toml"),
            Error::ServerConfig(e) => e.recovery_suggestion(),
            Error::Mcp(_) => Some("Run 'conduit mcp health' to inspect server status"),
            Error::NotFound(_) => Some("Use 'conduit mcp list' to see configured servers"),
            _ => None,
        }
    }
}

/// A server configuration that can never be connected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerConfigError {
    /// The server name is empty.
    #[error("server name cannot be empty")]
    EmptyName,

    /// The server name contains characters that would make qualified names ambiguous.
    #[error("invalid server name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A stdio server without a command.
    #[error("server '{name}': stdio transport requires a non-empty command")]
    EmptyCommand { name: String },

    /// An http-family server whose URL does not parse.
    #[error("server '{name}': invalid URL '{url}': {reason}")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },

    /// An http-family server with a URL scheme other than http/https.
    #[error("server '{name}': unsupported URL scheme '{scheme}' (expected http or https)")]
    UnsupportedScheme { name: String, scheme: String },
}

impl ServerConfigError {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            ServerConfigError::EmptyName | ServerConfigError::InvalidName { .. } => {
                Some("Use a short name of letters, digits, '-' or single '_'")
            }
            ServerConfigError::EmptyCommand { .. } => {
                Some("Set 'command' to the executable that starts the server")
            }
            ServerConfigError::InvalidUrl { .. } | ServerConfigError::UnsupportedScheme { .. } => {
                Some("Use a full URL such as https://example.com/mcp")
            }
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}
