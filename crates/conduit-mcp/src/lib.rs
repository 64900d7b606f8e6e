//! # conduit-mcp
//!
//! MCP (Model Context Protocol) connection management for Conduit.
//!
//! This crate provides:
//! - stdio, HTTP, legacy SSE and streamable HTTP transports
//! - Protocol sessions with version negotiation and paginated discovery
//! - A capability index keyed by `mcp__<server>__<name>`
//! - Per-server health statistics and a background probe loop
//!
//! Most callers only need [`McpManager`].

pub mod error;
pub mod health;
pub mod index;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::{
    AddServerError, CallError, McpError, MonitorError, RemoveServerError, TransportError,
};
pub use health::{HealthSnapshot, DEFAULT_LATENCY_WINDOW};
pub use index::{
    parse_qualified_name, qualified_name, PromptDescriptor, ResourceDescriptor, ToolDescriptor,
    MCP_TOOL_PREFIX,
};
pub use manager::{ManagerOptions, McpManager};
pub use registry::{ConnectionState, ServerSummary};
pub use session::{CallResult, McpSession};
pub use transport::{McpTransport, Transport, TransportEvent, TransportOptions};
