//! MCP-specific error types.
//!
//! Errors are layered the way calls are: [`TransportError`] for the message
//! channel, [`McpError`] for a protocol session, and the manager errors
//! ([`AddServerError`], [`RemoveServerError`], [`CallError`]) that callers of
//! [`McpManager`](crate::McpManager) see.

use std::time::Duration;

use conduit_core::{ServerConfigError, TransportKind};
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(std::io::Error),

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// The server process exited while the transport was open.
    #[error("peer exited{}", .status.map(|c| format!(" with status {}", c)).unwrap_or_default())]
    PeerExited { status: Option<i32> },

    /// The server's event stream ended.
    #[error("event stream closed")]
    StreamClosed,

    /// Transport was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// No response arrived within the deadline.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The per-connection limit on outstanding requests was reached.
    #[error("too many pending requests (limit {limit})")]
    TooManyPending { limit: usize },

    /// HTTP request failed before a response arrived.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP endpoint answered with a non-success status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// A frame that is not a JSON-RPC message, or is missing required parts.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The transport configuration cannot be used (bad URL or header).
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// Failed to encode an outgoing message.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether this error means the transport can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::PeerExited { .. }
                | TransportError::StreamClosed
                | TransportError::ConnectionClosed
                | TransportError::NotConnected
        )
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Request timed out.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Protocol-level error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server returned an error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// The server answered `initialize` with a protocol version we do not speak.
    #[error("unsupported protocol version '{received}' (client offered '{offered}')")]
    VersionMismatch { offered: String, received: String },

    /// The session has not completed the handshake.
    #[error("session not initialized")]
    NotInitialized,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for McpError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(after) => McpError::Timeout(after),
            other => McpError::Transport(other),
        }
    }
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error from JSON-RPC error.
    pub fn server_error(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout(_))
    }
}

/// Errors returned by [`McpManager::add_server`](crate::McpManager::add_server).
#[derive(Debug, Error)]
pub enum AddServerError {
    /// The configuration was rejected before any I/O.
    #[error("invalid server config: {0}")]
    InvalidConfig(#[from] ServerConfigError),

    /// A connected (or connecting) server already uses this name.
    #[error("server already exists: {0}")]
    DuplicateServer(String),

    /// The transport could not be opened.
    #[error("failed to open {transport} transport for '{server}': {source}")]
    TransportOpenFailed {
        server: String,
        transport: TransportKind,
        #[source]
        source: TransportError,
    },

    /// The transport opened but the MCP handshake did not complete.
    #[error("handshake with '{server}' failed: {source}")]
    HandshakeFailed {
        server: String,
        #[source]
        source: McpError,
    },

    /// The manager has been shut down.
    #[error("manager is shut down")]
    ShutDown,
}

/// Errors returned when starting the health monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Called from a thread that is not inside a Tokio runtime.
    #[error("health monitor needs a running Tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Errors returned by [`McpManager::remove_server`](crate::McpManager::remove_server).
#[derive(Debug, Error)]
pub enum RemoveServerError {
    /// No server is registered under this name.
    #[error("unknown server: {0}")]
    UnknownServer(String),
}

/// Errors returned when invoking a tool, resource or prompt through the manager.
///
/// Protocol-level failures of a tool call are not errors: they come back as a
/// [`CallResult`](crate::CallResult) with `success == false`.
#[derive(Debug, Error)]
pub enum CallError {
    /// No connected server exposes a tool with this qualified name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// No connected server exposes a resource with this qualified name.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// No connected server exposes a prompt with this qualified name.
    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    /// No server is registered under this name.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// The owning server is registered but not connected.
    #[error("server not connected: {0}")]
    ServerNotConnected(String),

    /// The call did not complete in time. The connection stays open.
    #[error("call to '{server}' timed out after {}ms", .after.as_millis())]
    Timeout { server: String, after: Duration },

    /// The server rejected a resource read or prompt fetch.
    #[error("server '{server}' rejected the request (code {code}): {message}")]
    Rejected {
        server: String,
        code: i32,
        message: String,
    },

    /// The call failed below the protocol level.
    #[error("call to '{server}' failed: {source}")]
    Transport {
        server: String,
        #[source]
        source: McpError,
    },
}

impl CallError {
    /// Classify a session error raised while talking to `server`.
    pub(crate) fn from_session(server: &str, error: McpError) -> Self {
        match error {
            McpError::Timeout(after) => CallError::Timeout {
                server: server.to_string(),
                after,
            },
            McpError::ServerError { code, message } => CallError::Rejected {
                server: server.to_string(),
                code,
                message,
            },
            source => CallError::Transport {
                server: server.to_string(),
                source,
            },
        }
    }
}

impl From<McpError> for conduit_core::Error {
    fn from(e: McpError) -> Self {
        conduit_core::Error::Mcp(e.to_string())
    }
}

impl From<AddServerError> for conduit_core::Error {
    fn from(e: AddServerError) -> Self {
        match e {
            AddServerError::InvalidConfig(config) => conduit_core::Error::ServerConfig(config),
            other => conduit_core::Error::Mcp(other.to_string()),
        }
    }
}

impl From<RemoveServerError> for conduit_core::Error {
    fn from(e: RemoveServerError) -> Self {
        conduit_core::Error::NotFound(e.to_string())
    }
}

impl From<CallError> for conduit_core::Error {
    fn from(e: CallError) -> Self {
        match e {
            CallError::UnknownTool(_)
            | CallError::UnknownResource(_)
            | CallError::UnknownPrompt(_)
            | CallError::UnknownServer(_) => conduit_core::Error::NotFound(e.to_string()),
            other => conduit_core::Error::Mcp(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionClosed;
        assert_eq!(err.to_string(), "connection closed");

        let err = TransportError::PeerExited { status: Some(1) };
        assert_eq!(err.to_string(), "peer exited with status 1");

        let err = TransportError::PeerExited { status: None };
        assert_eq!(err.to_string(), "peer exited");
    }

    #[test]
    fn test_timeout_maps_to_session_timeout() {
        let err: McpError = TransportError::Timeout(Duration::from_millis(250)).into();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "request timed out after 250ms");

        let err: McpError = TransportError::StreamClosed.into();
        assert!(matches!(err, McpError::Transport(TransportError::StreamClosed)));
    }

    #[test]
    fn test_mcp_error_display() {
        let err = McpError::server_error(-32600, "Invalid request");
        assert_eq!(err.to_string(), "server error (code -32600): Invalid request");
    }

    #[test]
    fn test_call_error_classification() {
        let err = CallError::from_session("echo", McpError::Timeout(Duration::from_secs(1)));
        assert!(matches!(err, CallError::Timeout { ref server, .. } if server == "echo"));

        let err = CallError::from_session("echo", McpError::server_error(-32002, "not found"));
        assert!(matches!(err, CallError::Rejected { code: -32002, .. }));

        let err = CallError::from_session(
            "echo",
            TransportError::PeerExited { status: Some(2) }.into(),
        );
        assert!(matches!(err, CallError::Transport { .. }));
    }

    #[test]
    fn test_errors_to_core_error() {
        let core_err: conduit_core::Error = McpError::protocol("bad frame").into();
        assert!(matches!(core_err, conduit_core::Error::Mcp(_)));

        let core_err: conduit_core::Error =
            RemoveServerError::UnknownServer("docs".to_string()).into();
        assert!(matches!(core_err, conduit_core::Error::NotFound(_)));

        let core_err: conduit_core::Error =
            AddServerError::InvalidConfig(ServerConfigError::EmptyName).into();
        assert!(matches!(core_err, conduit_core::Error::ServerConfig(_)));
    }
}
