//! HTTP transport: one POST per JSON-RPC message.
//!
//! Serves both `http` and `streamable_http`. The reply to a POST is either a
//! single JSON body or an SSE stream that ends with the response. Streamable
//! HTTP additionally echoes the `Mcp-Session-Id` header, may open a GET
//! stream for server notifications, and ends the session with a DELETE.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::TransportKind;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::event_stream::{next_events, SseParser};
use super::{reply_to_server_request, EventSink, Transport, TransportEvent, TransportOptions};
use crate::error::TransportError;
use crate::protocol::{
    IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Session header for streamable HTTP.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const EVENT_STREAM: &str = "text/event-stream";
const MAX_ERROR_BODY: usize = 512;
const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(2);

/// A URL we POST to, with the headers every request carries.
#[derive(Clone)]
pub(super) struct Endpoint {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Arc<RwLock<Option<String>>>,
}

impl Endpoint {
    pub(super) fn new(client: reqwest::Client, url: Url, headers: HeaderMap) -> Self {
        Self {
            client,
            url,
            headers,
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    pub(super) fn url(&self) -> &Url {
        &self.url
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    fn with_session(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id() {
            Some(id) => builder.header(SESSION_ID_HEADER, id),
            None => builder,
        }
    }

    /// POST a JSON-RPC message. Non-2xx statuses are errors.
    pub(super) async fn post<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<reqwest::Response, TransportError> {
        let builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        let response = self.with_session(builder).send().await?;

        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(id) {
                debug!(url = %self.url, "Server assigned MCP session");
                *current = Some(id.to_string());
            }
        }

        check_status(response).await
    }

    /// Open a GET event stream on this URL.
    pub(super) async fn get_stream(&self) -> Result<reqwest::Response, TransportError> {
        let builder = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, EVENT_STREAM);
        let response = self.with_session(builder).send().await?;
        check_status(response).await
    }

    async fn delete_session(&self) {
        let Some(id) = self.session_id.write().take() else {
            return;
        };

        let request = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, id)
            .send();
        match tokio::time::timeout(SESSION_DELETE_TIMEOUT, request).await {
            Ok(Ok(response)) => {
                debug!(url = %self.url, status = response.status().as_u16(), "Ended MCP session")
            }
            Ok(Err(e)) => debug!(url = %self.url, error = %e, "Failed to end MCP session"),
            Err(_) => debug!(url = %self.url, "Timed out ending MCP session"),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::HttpStatus {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    })
}

pub(super) fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM))
}

pub(super) fn build_client(options: &TransportOptions) -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .build()?)
}

/// Convert configured headers. Values are marked sensitive so they never
/// show up in debug output.
pub(super) fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidConfig(format!("invalid header name '{}'", name)))?;
        let mut header_value = HeaderValue::from_str(value).map_err(|_| {
            TransportError::InvalidConfig(format!("invalid value for header '{}'", name))
        })?;
        header_value.set_sensitive(true);
        map.insert(header_name, header_value);
    }
    Ok(map)
}

pub(super) fn parse_url(url: &str) -> Result<Url, TransportError> {
    Url::parse(url).map_err(|e| TransportError::InvalidConfig(format!("invalid url '{}': {}", url, e)))
}

/// HTTP transport for `http` and `streamable_http` servers.
pub struct HttpTransport {
    server: String,
    kind: TransportKind,
    endpoint: Endpoint,
    connected: Arc<AtomicBool>,
    in_flight: Arc<Semaphore>,
    max_pending: usize,
    sink: EventSink,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Create a transport for `url`. No request is made until the first call.
    pub fn new(
        server: &str,
        kind: TransportKind,
        url: &str,
        headers: &BTreeMap<String, String>,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let url = parse_url(url)?;
        let endpoint = Endpoint::new(build_client(options)?, url, build_headers(headers)?);
        let (sink, events) = EventSink::channel(server, options.event_buffer);

        debug!(server = %server, transport = %kind, url = %endpoint.url(), "Created HTTP transport");

        Ok(Self {
            server: server.to_string(),
            kind,
            endpoint,
            connected: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(Semaphore::new(options.max_pending.max(1))),
            max_pending: options.max_pending.max(1),
            sink,
            events: Mutex::new(Some(events)),
            listener: Mutex::new(None),
        })
    }

    /// The session id assigned by a streamable HTTP server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.endpoint.session_id()
    }

    async fn exchange(
        &self,
        request: &JsonRpcRequest<Value>,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        let response = self.endpoint.post(request).await?;

        if is_event_stream(&response) {
            return self.await_streamed_response(&request.id, response).await;
        }

        let body = response.text().await?;
        match IncomingMessage::parse(&body) {
            Ok(IncomingMessage::Response(reply)) if reply.id == request.id => Ok(reply),
            Ok(_) => Err(TransportError::MalformedMessage(format!(
                "expected the response to request {}",
                request.id
            ))),
            Err(reason) => Err(TransportError::MalformedMessage(reason)),
        }
    }

    /// Read an SSE-formatted POST reply until the response with `id` arrives.
    async fn await_streamed_response(
        &self,
        id: &RequestId,
        response: reqwest::Response,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();

        while let Some(batch) = next_events(&mut stream, &mut parser).await {
            for event in batch? {
                if !event.is_message() {
                    continue;
                }
                match IncomingMessage::parse(&event.data) {
                    Ok(IncomingMessage::Response(reply)) if reply.id == *id => return Ok(reply),
                    Ok(IncomingMessage::Response(reply)) => {
                        debug!(server = %self.server, id = %reply.id, "Discarding unexpected response");
                    }
                    Ok(IncomingMessage::Notification(notification)) => {
                        self.sink.notification(notification);
                    }
                    Ok(IncomingMessage::Request(request)) => {
                        answer(&self.server, &self.endpoint, &request).await;
                    }
                    Err(reason) => {
                        debug!(server = %self.server, reason = %reason, "Ignoring malformed event");
                    }
                }
            }
        }

        Err(TransportError::MalformedMessage(
            "event stream ended before the response arrived".to_string(),
        ))
    }
}

async fn answer(server: &str, endpoint: &Endpoint, request: &JsonRpcRequest<Value>) {
    debug!(server = %server, method = %request.method, "Answering server request");
    let reply = reply_to_server_request(request);
    if let Err(e) = endpoint.post(&reply).await {
        warn!(server = %server, error = %e, "Failed to answer server request");
    }
}

/// Pump the streamable HTTP notification stream until it ends.
async fn listen(
    server: String,
    endpoint: Endpoint,
    response: reqwest::Response,
    sink: EventSink,
    connected: Arc<AtomicBool>,
) {
    let mut stream = Box::pin(response.bytes_stream());
    let mut parser = SseParser::new();

    let reason = loop {
        match next_events(&mut stream, &mut parser).await {
            Some(Ok(batch)) => {
                for event in batch.into_iter().filter(|e| e.is_message()) {
                    match IncomingMessage::parse(&event.data) {
                        Ok(IncomingMessage::Notification(notification)) => {
                            sink.notification(notification)
                        }
                        Ok(IncomingMessage::Request(request)) => {
                            answer(&server, &endpoint, &request).await
                        }
                        Ok(IncomingMessage::Response(reply)) => {
                            debug!(server = %server, id = %reply.id, "Discarding response on notification stream");
                        }
                        Err(reason) => {
                            debug!(server = %server, reason = %reason, "Ignoring malformed event");
                        }
                    }
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break TransportError::StreamClosed.to_string(),
        }
    };

    if connected.swap(false, Ordering::SeqCst) {
        warn!(server = %server, reason = %reason, "MCP notification stream closed");
        sink.closed(reason).await;
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        request: JsonRpcRequest<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let _permit = self
            .in_flight
            .try_acquire()
            .map_err(|_| TransportError::TooManyPending {
                limit: self.max_pending,
            })?;

        debug!(server = %self.server, method = %request.method, id = %request.id, "Sending request");

        // Dropping the exchange on timeout aborts the HTTP request.
        match tokio::time::timeout(timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(server = %self.server, id = %request.id, "Request timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn notify(
        &self,
        notification: JsonRpcNotification<Value>,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.endpoint.post(&notification).await?;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    async fn on_initialized(&self) -> Result<(), TransportError> {
        if self.kind != TransportKind::StreamableHttp {
            return Ok(());
        }

        let response = match self.endpoint.get_stream().await {
            Ok(response) if is_event_stream(&response) => response,
            Ok(_) => {
                debug!(server = %self.server, "Server returned no event stream, notifications disabled");
                return Ok(());
            }
            Err(e) => {
                // 405 is the documented way to say "no stream here".
                debug!(server = %self.server, error = %e, "Server offers no notification stream");
                return Ok(());
            }
        };

        debug!(server = %self.server, "Listening for server notifications");
        let handle = tokio::spawn(listen(
            self.server.clone(),
            self.endpoint.clone(),
            response,
            self.sink.clone(),
            Arc::clone(&self.connected),
        ));
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            handle.abort();
        }
        if was_connected {
            debug!(server = %self.server, "Closing HTTP transport");
            self.endpoint.delete_session().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}
