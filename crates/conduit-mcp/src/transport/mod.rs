//! MCP transport implementations.
//!
//! This module provides the transport layer for communicating with MCP servers.
//! Every transport carries JSON-RPC messages and exposes the same contract:
//! correlated requests with a deadline, fire-and-forget notifications, a
//! one-shot stream of unsolicited server messages, and an idempotent close.
//!
//! Three implementations exist, selected by [`McpTransport::open`]:
//! - [`StdioTransport`]: spawns a child process and speaks newline-delimited
//!   JSON over its stdin/stdout. Ordered, effectively serialized.
//! - [`HttpTransport`]: one HTTP POST per request (`http` and
//!   `streamable_http`). Stateless, safe to call concurrently.
//! - [`SseTransport`]: legacy HTTP+SSE, responses arrive on a long-lived
//!   event stream and are matched to requests by id.

mod event_stream;
mod http;
mod pending;
mod sse;
mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{TransportConfig, TransportKind};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{
    methods, CancelledParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

pub use http::HttpTransport;
pub use event_stream::{SseEvent, SseParser};
pub use sse::SseTransport;
pub use stdio::StdioTransport;

pub(crate) use pending::PendingRequests;

/// Something the server sent without being asked.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A JSON-RPC notification from the server.
    Notification(JsonRpcNotification<Value>),
    /// The transport closed underneath us; no further messages will arrive.
    Closed(String),
}

/// Tunables shared by all transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Maximum outstanding requests before `request` fails fast.
    pub max_pending: usize,
    /// Capacity of the unsolicited-message queue.
    pub event_buffer: usize,
    /// Deadline for establishing the transport (SSE endpoint discovery).
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_pending: 64,
            event_buffer: 64,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait up to `timeout` for the response with its id.
    async fn request(
        &self,
        request: JsonRpcRequest<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse<Value>, TransportError>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification<Value>)
        -> Result<(), TransportError>;

    /// Take the stream of unsolicited messages. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Called once the MCP handshake has completed.
    async fn on_initialized(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the transport. Safe to call any number of times.
    async fn close(&self);

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// The kind of this transport.
    fn kind(&self) -> TransportKind;
}

/// The closed set of transports, chosen from the server configuration.
pub enum McpTransport {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Sse(SseTransport),
}

impl McpTransport {
    /// Open a transport for `server` as described by `config`.
    pub async fn open(
        server: &str,
        config: &TransportConfig,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        match config {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => StdioTransport::spawn(server, command, args, env, cwd.as_deref(), options)
                .await
                .map(Self::Stdio),
            TransportConfig::Http { url, headers } => {
                HttpTransport::new(server, TransportKind::Http, url, headers, options)
                    .map(Self::Http)
            }
            TransportConfig::StreamableHttp { url, headers } => {
                HttpTransport::new(server, TransportKind::StreamableHttp, url, headers, options)
                    .map(Self::Http)
            }
            TransportConfig::Sse { url, headers } => {
                SseTransport::connect(server, url, headers, options)
                    .await
                    .map(Self::Sse)
            }
        }
    }

    /// Recent stderr lines of a stdio server; empty for other transports.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self {
            Self::Stdio(t) => t.stderr_tail(),
            _ => Vec::new(),
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            Self::Stdio(t) => t,
            Self::Http(t) => t,
            Self::Sse(t) => t,
        }
    }
}

#[async_trait]
impl Transport for McpTransport {
    async fn request(
        &self,
        request: JsonRpcRequest<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        self.inner().request(request, timeout).await
    }

    async fn notify(
        &self,
        notification: JsonRpcNotification<Value>,
    ) -> Result<(), TransportError> {
        self.inner().notify(notification).await
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner().take_events()
    }

    async fn on_initialized(&self) -> Result<(), TransportError> {
        self.inner().on_initialized().await
    }

    async fn close(&self) {
        self.inner().close().await
    }

    fn is_connected(&self) -> bool {
        self.inner().is_connected()
    }

    fn kind(&self) -> TransportKind {
        self.inner().kind()
    }
}

/// Sending half of a transport's event queue.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    server: String,
    tx: mpsc::Sender<TransportEvent>,
}

impl EventSink {
    pub(crate) fn channel(
        server: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                server: server.to_string(),
                tx,
            },
            rx,
        )
    }

    /// Queue a notification, dropping it if the consumer is behind.
    pub(crate) fn notification(&self, notification: JsonRpcNotification<Value>) {
        debug!(server = %self.server, method = %notification.method, "Received notification");
        match self.tx.try_send(TransportEvent::Notification(notification)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(server = %self.server, "Notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Announce that the transport closed underneath its owner.
    pub(crate) async fn closed(&self, reason: impl Into<String>) {
        let event = TransportEvent::Closed(reason.into());
        if tokio::time::timeout(Duration::from_secs(1), self.tx.send(event))
            .await
            .is_err()
        {
            warn!(server = %self.server, "Event consumer not draining, close event dropped");
        }
    }
}

/// Build the reply to a request the server sent us.
///
/// Only `ping` is answered; everything else (sampling, roots, elicitation)
/// is refused so the peer never waits on us.
pub(crate) fn reply_to_server_request(request: &JsonRpcRequest<Value>) -> JsonRpcResponse<Value> {
    if request.method == methods::PING {
        JsonRpcResponse::success(request.id.clone(), Value::Object(Default::default()))
    } else {
        JsonRpcResponse::failure(
            request.id.clone(),
            JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("method not supported by client: {}", request.method),
            ),
        )
    }
}

/// The notification sent when we give up on a request.
pub(crate) fn cancellation(request: &JsonRpcRequest<Value>, timeout: Duration) -> JsonRpcNotification<Value> {
    let params = CancelledParams {
        request_id: request.id.clone(),
        reason: Some(format!("timed out after {}ms", timeout.as_millis())),
    };
    JsonRpcNotification::new(methods::CANCELLED, serde_json::to_value(params).ok())
}
