//! Legacy HTTP+SSE transport.
//!
//! The client opens a GET event stream; the server's first `endpoint` event
//! names the URL to POST messages to. Responses come back on the stream and
//! are matched to requests by id.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_core::TransportKind;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::event_stream::{next_events, SseEvent, SseParser};
use super::http::{build_client, build_headers, parse_url, Endpoint};
use super::{
    cancellation, reply_to_server_request, EventSink, PendingRequests, Transport,
    TransportEvent, TransportOptions,
};
use crate::error::TransportError;
use crate::protocol::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Legacy SSE transport.
pub struct SseTransport {
    server: String,
    endpoint: Endpoint,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    reader: JoinHandle<()>,
}

/// State owned by the stream reader task.
struct StreamReader {
    server: String,
    client: reqwest::Client,
    stream_url: Url,
    headers: HeaderMap,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    sink: EventSink,
    post_endpoint: Option<Endpoint>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its POST endpoint.
    pub async fn connect(
        server: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let stream_url = parse_url(url)?;
        let client = build_client(options)?;
        let headers = build_headers(headers)?;
        let pending = Arc::new(PendingRequests::new(options.max_pending));
        let connected = Arc::new(AtomicBool::new(false));
        let (sink, events) = EventSink::channel(server, options.event_buffer);

        debug!(server = %server, url = %stream_url, "Opening SSE stream");

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = StreamReader {
            server: server.to_string(),
            client: client.clone(),
            stream_url,
            headers: headers.clone(),
            pending: Arc::clone(&pending),
            connected: Arc::clone(&connected),
            sink,
            post_endpoint: None,
        };
        let reader = tokio::spawn(reader.run(endpoint_tx));

        let post_url = match tokio::time::timeout(options.connect_timeout, endpoint_rx).await {
            Ok(Ok(Ok(url))) => url,
            Ok(Ok(Err(e))) => {
                reader.abort();
                return Err(e);
            }
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::StreamClosed);
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Timeout(options.connect_timeout));
            }
        };

        debug!(server = %server, endpoint = %post_url, "SSE endpoint announced");

        Ok(Self {
            server: server.to_string(),
            endpoint: Endpoint::new(client, post_url, headers),
            pending,
            connected,
            events: Mutex::new(Some(events)),
            reader,
        })
    }

    fn send_cancellation(&self, request: &JsonRpcRequest<Value>, after: Duration) {
        let endpoint = self.endpoint.clone();
        let notification = cancellation(request, after);
        let server = self.server.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoint.post(&notification).await {
                debug!(server = %server, error = %e, "Failed to send cancellation");
            }
        });
    }
}

impl StreamReader {
    async fn run(mut self, endpoint_tx: oneshot::Sender<Result<Url, TransportError>>) {
        let opening = Endpoint::new(
            self.client.clone(),
            self.stream_url.clone(),
            self.headers.clone(),
        );
        let response = match opening.get_stream().await {
            Ok(response) => response,
            Err(e) => {
                let _ = endpoint_tx.send(Err(e));
                return;
            }
        };

        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        let mut endpoint_tx = Some(endpoint_tx);

        let reason = loop {
            match next_events(&mut stream, &mut parser).await {
                Some(Ok(batch)) => {
                    for event in batch {
                        self.handle_event(event, &mut endpoint_tx).await;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break TransportError::StreamClosed.to_string(),
            }
        };

        if let Some(tx) = endpoint_tx.take() {
            let _ = tx.send(Err(TransportError::StreamClosed));
            return;
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(server = %self.server, reason = %reason, "MCP event stream closed");
            self.pending.fail_all(|| TransportError::StreamClosed);
            self.sink.closed(reason).await;
        } else {
            self.pending.fail_all(|| TransportError::ConnectionClosed);
        }
    }

    async fn handle_event(
        &mut self,
        event: SseEvent,
        endpoint_tx: &mut Option<oneshot::Sender<Result<Url, TransportError>>>,
    ) {
        if event.event.as_deref() == Some("endpoint") {
            match self.stream_url.join(event.data.trim()) {
                Ok(url) => {
                    self.post_endpoint = Some(Endpoint::new(
                        self.client.clone(),
                        url.clone(),
                        self.headers.clone(),
                    ));
                    if let Some(tx) = endpoint_tx.take() {
                        self.connected.store(true, Ordering::SeqCst);
                        let _ = tx.send(Ok(url));
                    }
                }
                Err(e) => {
                    warn!(server = %self.server, error = %e, "Server announced an invalid endpoint");
                }
            }
            return;
        }

        if !event.is_message() {
            return;
        }

        match IncomingMessage::parse(&event.data) {
            Ok(IncomingMessage::Response(response)) => {
                let id = response.id.clone();
                if !self.pending.complete(response) {
                    debug!(server = %self.server, id = %id, "Discarding response with no waiting request");
                }
            }
            Ok(IncomingMessage::Notification(notification)) => {
                self.sink.notification(notification);
            }
            Ok(IncomingMessage::Request(request)) => {
                let Some(endpoint) = &self.post_endpoint else {
                    return;
                };
                debug!(server = %self.server, method = %request.method, "Answering server request");
                if let Err(e) = endpoint.post(&reply_to_server_request(&request)).await {
                    warn!(server = %self.server, error = %e, "Failed to answer server request");
                }
            }
            Err(reason) => {
                debug!(server = %self.server, reason = %reason, "Ignoring malformed event");
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        request: JsonRpcRequest<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse<Value>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let started = Instant::now();
        let id = request.id.clone();
        let slot = self.pending.register(id.clone())?;

        let posted = match tokio::time::timeout(timeout, self.endpoint.post(&request)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if let Err(e) = posted {
            if matches!(e, TransportError::Timeout(_)) {
                self.send_cancellation(&request, timeout);
            }
            return Err(e);
        }

        debug!(server = %self.server, method = %request.method, id = %id, "Sent request");

        let remaining = timeout.saturating_sub(started.elapsed());
        match slot.wait(remaining).await {
            Err(TransportError::Timeout(_)) => {
                self.send_cancellation(&request, timeout);
                Err(TransportError::Timeout(timeout))
            }
            other => other,
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

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(server = %self.server, "Closing SSE transport");
        }
        self.reader.abort();
        self.pending.fail_all(|| TransportError::ConnectionClosed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
