//! MCP server manager.
//!
//! [`McpManager`] is the public face of this crate: it adds and removes
//! servers, routes calls by qualified name, and keeps health statistics.
//! Construct one at startup, share it by cloning, and call
//! [`shutdown`](McpManager::shutdown) once on exit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use conduit_core::{McpConfig, ServerConfig, TransportKind};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{AddServerError, CallError, McpError, MonitorError, RemoveServerError};
use crate::health::{HealthMonitor, HealthSnapshot, HealthTracker, ServerView};
use crate::index::{
    parse_qualified_name, PromptDescriptor, ResourceDescriptor, ServerCapabilitySet,
    ToolDescriptor,
};
use crate::protocol::{methods, GetPromptResult, ReadResourceResult};
use crate::registry::{Connection, ConnectionState, Registry, ServerSummary};
use crate::session::{CallResult, McpSession};
use crate::transport::{McpTransport, TransportEvent, TransportOptions};

/// Bounded wait for each transport during shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Tunables for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Default deadline for tool calls and discovery requests.
    pub request_timeout: Duration,
    /// Deadline for the `initialize` handshake.
    pub connect_timeout: Duration,
    pub transport: TransportOptions,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub latency_window: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&McpConfig::default())
    }
}

impl From<&McpConfig> for ManagerOptions {
    fn from(config: &McpConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            transport: TransportOptions {
                max_pending: config.max_pending_requests,
                event_buffer: config.notification_buffer,
                connect_timeout: config.connect_timeout(),
            },
            health_interval: config.health.interval(),
            probe_timeout: config.health.probe_timeout(),
            latency_window: config.health.latency_window,
        }
    }
}

/// Manages MCP server connections, capability routing and health.
#[derive(Clone)]
pub struct McpManager {
    inner: Arc<Inner>,
}

struct Inner {
    options: ManagerOptions,
    registry: Registry,
    health: HealthTracker,
    monitor: HealthMonitor,
    shut_down: AtomicBool,
}

/// Releases a name reservation if an add attempt ends early, including
/// when the caller drops the future.
struct Reservation<'a> {
    registry: &'a Registry,
    name: &'a str,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(registry: &'a Registry, name: &'a str) -> Self {
        Self {
            registry,
            name,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abort_connect(self.name);
        }
    }
}

impl McpManager {
    /// Create a manager with the given options.
    pub fn new(options: ManagerOptions) -> Self {
        let latency_window = options.latency_window;
        Self {
            inner: Arc::new(Inner {
                options,
                registry: Registry::new(),
                health: HealthTracker::new(latency_window),
                monitor: HealthMonitor::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager from the `[mcp]` configuration section.
    pub fn from_config(config: &McpConfig) -> Self {
        Self::new(ManagerOptions::from(config))
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Connect to a server and index its capabilities.
    ///
    /// On any failure the registry is left as it was and the transport is
    /// closed. An Errored entry with the same name stays visible until the
    /// new connection is committed.
    pub async fn add_server(&self, config: ServerConfig) -> Result<(), AddServerError> {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(AddServerError::ShutDown);
        }
        config.validate()?;

        let name = config.name.clone();
        let kind = config.kind();
        inner.registry.begin_connect(&name, kind)?;
        let reservation = Reservation::new(&inner.registry, &name);

        info!(server = %name, transport = %kind, "Connecting to MCP server");

        let session = inner.open_session(&config).await?;
        let (capabilities, issues) = discover(&session, inner.options.request_timeout).await;

        let connection = Arc::new(Connection::new(config, session, issues));
        let events = connection.session().take_events();

        let replaced = inner
            .registry
            .commit(Arc::clone(&connection), capabilities, |c| {
                inner.health.mark_connected(c.name(), c.connected_since())
            });
        reservation.disarm();

        if let Some(old) = replaced {
            debug!(server = %name, "Closing replaced connection");
            old.set_state(ConnectionState::Disconnected);
            old.session().close().await;
        }

        if inner.is_shut_down() {
            if let Some(connection) = inner.registry.remove(&name, || inner.health.clear(&name)) {
                connection.set_state(ConnectionState::Disconnected);
                connection.session().close().await;
            }
            return Err(AddServerError::ShutDown);
        }

        if let Some(events) = events {
            tokio::spawn(watch_events(
                Arc::downgrade(inner),
                Arc::downgrade(&connection),
                events,
            ));
        }

        info!(
            server = %name,
            transport = %kind,
            tools = inner.registry.tool_count(&name),
            "MCP server connected"
        );
        Ok(())
    }

    /// Add every server concurrently. Failures are logged and returned, and
    /// never stop the others.
    pub async fn connect_all(
        &self,
        configs: Vec<ServerConfig>,
    ) -> Vec<(String, Result<(), AddServerError>)> {
        info!(count = configs.len(), "Starting MCP servers");

        let attempts = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            let result = self.add_server(config).await;
            if let Err(e) = &result {
                error!(server = %name, error = %e, "Failed to start server");
            }
            (name, result)
        });
        let outcomes = join_all(attempts).await;

        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            success = outcomes.len() - failed,
            failed = failed,
            "MCP servers started"
        );
        outcomes
    }

    /// Close a server's transport and forget it, including its health record.
    pub async fn remove_server(&self, name: &str) -> Result<(), RemoveServerError> {
        let inner = &self.inner;
        let connection = inner
            .registry
            .remove(name, || inner.health.clear(name))
            .ok_or_else(|| RemoveServerError::UnknownServer(name.to_string()))?;

        connection.set_state(ConnectionState::Disconnected);
        connection.session().close().await;

        info!(server = %name, "MCP server removed");
        Ok(())
    }

    /// Call a tool by qualified name.
    ///
    /// `timeout` defaults to the configured request timeout. The outcome is
    /// recorded in the server's health record before returning.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallResult, CallError> {
        let inner = &self.inner;
        let Some((connection, tool)) = inner.registry.resolve_tool(qualified_name) else {
            return Err(inner.not_found(qualified_name, CallError::UnknownTool));
        };
        if !connection.is_usable() {
            return Err(CallError::ServerNotConnected(tool.server_name));
        }

        let timeout = timeout.unwrap_or(inner.options.request_timeout);
        let started = Instant::now();
        let outcome = connection
            .session()
            .call_tool(&tool.raw_name, arguments, timeout)
            .await;
        let latency = started.elapsed();

        let health_outcome = match &outcome {
            Ok(result) if result.success => Ok(()),
            Ok(result) => Err(result
                .error
                .clone()
                .unwrap_or_else(|| "tool call failed".to_string())),
            Err(e) => Err(e.to_string()),
        };
        inner.record_outcome(&connection, latency, health_outcome);

        outcome.map_err(|e| CallError::from_session(&tool.server_name, e))
    }

    /// Read a resource by qualified name.
    pub async fn read_resource(
        &self,
        qualified_name: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult, CallError> {
        let inner = &self.inner;
        let Some((connection, resource)) = inner.registry.resolve_resource(qualified_name) else {
            return Err(inner.not_found(qualified_name, CallError::UnknownResource));
        };
        self.read_from(&connection, &resource.uri, timeout).await
    }

    /// Read a resource by URI from a named server.
    pub async fn read_resource_uri(
        &self,
        server: &str,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult, CallError> {
        let connection = self
            .inner
            .registry
            .get(server)
            .ok_or_else(|| CallError::UnknownServer(server.to_string()))?;
        self.read_from(&connection, uri, timeout).await
    }

    async fn read_from(
        &self,
        connection: &Connection,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<ReadResourceResult, CallError> {
        if !connection.is_usable() {
            return Err(CallError::ServerNotConnected(connection.name().to_string()));
        }
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        debug!(server = %connection.name(), uri = uri, "Reading resource");
        connection
            .session()
            .read_resource(uri, timeout)
            .await
            .map_err(|e| CallError::from_session(connection.name(), e))
    }

    /// Render a prompt by qualified name.
    pub async fn get_prompt(
        &self,
        qualified_name: &str,
        arguments: Option<BTreeMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Result<GetPromptResult, CallError> {
        let inner = &self.inner;
        let Some((connection, prompt)) = inner.registry.resolve_prompt(qualified_name) else {
            return Err(inner.not_found(qualified_name, CallError::UnknownPrompt));
        };
        if !connection.is_usable() {
            return Err(CallError::ServerNotConnected(prompt.server_name));
        }
        let timeout = timeout.unwrap_or(inner.options.request_timeout);
        connection
            .session()
            .get_prompt(&prompt.raw_name, arguments, timeout)
            .await
            .map_err(|e| CallError::from_session(&prompt.server_name, e))
    }

    /// Names of Connected servers, sorted.
    pub fn get_servers(&self) -> Vec<String> {
        self.inner.registry.connected_names()
    }

    /// Every indexed tool, grouped by server.
    pub fn get_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.registry.tools()
    }

    pub fn get_resources(&self) -> Vec<ResourceDescriptor> {
        self.inner.registry.resources()
    }

    pub fn get_prompts(&self) -> Vec<PromptDescriptor> {
        self.inner.registry.prompts()
    }

    /// Transport kind of a registered or connecting server.
    pub fn get_transport_type(&self, name: &str) -> Option<TransportKind> {
        self.inner.registry.transport_kind(name)
    }

    /// Every registered or connecting server with its state and counts.
    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.inner.registry.summaries()
    }

    /// Recent stderr lines of a stdio server.
    pub fn stderr_tail(&self, name: &str) -> Option<Vec<String>> {
        self.inner
            .registry
            .get(name)
            .map(|c| c.session().stderr_tail())
    }

    /// Health of every registered server, ordered by name.
    pub fn get_health_report(&self) -> Vec<HealthSnapshot> {
        self.inner
            .registry
            .connections()
            .iter()
            .map(|c| self.inner.snapshot(c))
            .collect()
    }

    /// Health of one server; `None` if it is not registered.
    pub fn get_server_status(&self, name: &str) -> Option<HealthSnapshot> {
        self.inner
            .registry
            .get(name)
            .map(|c| self.inner.snapshot(&c))
    }

    /// Start the background health monitor at the configured interval.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_health_monitor(&self) -> Result<(), MonitorError> {
        self.start_health_monitor_with(self.inner.options.health_interval)
    }

    /// Start (or restart) the health monitor with an explicit interval.
    ///
    /// A probe round still in flight from the previous schedule is dropped.
    pub fn start_health_monitor_with(&self, interval: Duration) -> Result<(), MonitorError> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.monitor.start(interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.probe_all().await;
                }
            }
        })?;
        info!(interval_secs = interval.as_secs_f64(), "Health monitor started");
        Ok(())
    }

    pub fn stop_health_monitor(&self) {
        self.inner.monitor.stop();
    }

    pub fn is_health_monitor_running(&self) -> bool {
        self.inner.monitor.is_running()
    }

    /// Probe every connected server once, outside the monitor schedule.
    pub async fn probe_all(&self) {
        self.inner.probe_all().await;
    }

    /// Stop the monitor and close every transport with a bounded wait.
    ///
    /// Later calls are no-ops; `add_server` fails afterwards.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.monitor.stop();

        let connections = inner.registry.drain();
        info!(count = connections.len(), "Shutting down MCP servers");

        let closes = connections.iter().map(|connection| async move {
            connection.set_state(ConnectionState::Disconnected);
            if tokio::time::timeout(SHUTDOWN_WAIT, connection.session().close())
                .await
                .is_err()
            {
                warn!(server = %connection.name(), "Transport did not close in time");
            }
        });
        join_all(closes).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Open the transport and run the handshake; close on handshake failure.
    async fn open_session(&self, config: &ServerConfig) -> Result<McpSession, AddServerError> {
        let name = &config.name;
        let kind = config.kind();

        let transport = McpTransport::open(name, &config.transport, &self.options.transport)
            .await
            .map_err(|source| {
                error!(server = %name, transport = %kind, error = %source, "Failed to open transport");
                AddServerError::TransportOpenFailed {
                    server: name.clone(),
                    transport: kind,
                    source,
                }
            })?;

        let session = McpSession::new(name.clone(), transport);
        if let Err(source) = session.initialize(self.options.connect_timeout).await {
            error!(server = %name, transport = %kind, error = %source, "MCP handshake failed");
            session.close().await;
            return Err(AddServerError::HandshakeFailed {
                server: name.clone(),
                source,
            });
        }
        Ok(session)
    }

    /// The error for a qualified name the index does not know. A name that
    /// points at a registered but disconnected server says so.
    fn not_found(&self, qualified_name: &str, unknown: fn(String) -> CallError) -> CallError {
        if let Some((server, _)) = parse_qualified_name(qualified_name) {
            if self.registry.get(server).is_some_and(|c| !c.is_usable()) {
                return CallError::ServerNotConnected(server.to_string());
            }
        }
        unknown(qualified_name.to_string())
    }

    /// Record a call or probe outcome, unless the connection was replaced or removed meanwhile.
    fn record_outcome(&self, connection: &Arc<Connection>, latency: Duration, outcome: Result<(), String>) {
        self.registry.with_current(connection, || match outcome {
            Ok(()) => self.health.record_success(connection.name(), latency),
            Err(error) => self.health.record_failure(connection.name(), latency, error),
        });
    }

    fn snapshot(&self, connection: &Connection) -> HealthSnapshot {
        self.health.snapshot(ServerView {
            server: connection.name(),
            state: connection.state(),
            transport: Some(connection.kind()),
            tool_count: self.registry.tool_count(connection.name()),
        })
    }

    async fn probe_all(&self) {
        let probe_timeout = self.options.probe_timeout;
        let probes = self
            .registry
            .connections()
            .into_iter()
            .filter(|c| c.is_usable())
            .map(|connection| async move {
                let started = Instant::now();
                let Some(outcome) = connection.session().probe(probe_timeout).await else {
                    return;
                };
                let latency = started.elapsed();
                match &outcome {
                    Ok(()) => debug!(server = %connection.name(), latency_ms = latency.as_millis() as u64, "Health probe succeeded"),
                    Err(e) => warn!(server = %connection.name(), error = %e, "Health probe failed"),
                }
                self.record_outcome(&connection, latency, outcome.map_err(|e| e.to_string()));
            });
        join_all(probes).await;
    }

    async fn handle_notification(&self, connection: &Arc<Connection>, method: &str) {
        let session = connection.session();
        let timeout = self.options.request_timeout;

        let refreshed = match method {
            methods::TOOLS_LIST_CHANGED => session
                .list_tools(timeout)
                .await
                .map(|tools| self.registry.replace_tools(connection, tools)),
            methods::RESOURCES_LIST_CHANGED => session
                .list_resources(timeout)
                .await
                .map(|resources| self.registry.replace_resources(connection, resources)),
            methods::PROMPTS_LIST_CHANGED => session
                .list_prompts(timeout)
                .await
                .map(|prompts| self.registry.replace_prompts(connection, prompts)),
            _ => {
                debug!(server = %connection.name(), method = method, "Ignoring notification");
                return;
            }
        };

        match refreshed {
            Ok(Some(count)) => {
                info!(server = %connection.name(), method = method, count = count, "Capabilities refreshed")
            }
            Ok(None) => {
                debug!(server = %connection.name(), "Connection no longer current, refresh dropped")
            }
            Err(e) => {
                warn!(server = %connection.name(), method = method, error = %e, "Capability refresh failed");
                connection.push_issue(format!("refresh after {} failed: {}", method, e));
            }
        }
    }

    fn connection_lost(&self, connection: &Arc<Connection>, reason: &str) {
        let marked = self.registry.mark_errored(connection, reason, || {
            self.health.note_error(connection.name(), reason)
        });
        if marked {
            error!(
                server = %connection.name(),
                transport = %connection.kind(),
                reason = reason,
                "MCP server connection lost"
            );
        }
    }
}

/// List every capability category independently; a failing category is
/// recorded as an issue and indexed as empty.
async fn discover(session: &McpSession, timeout: Duration) -> (ServerCapabilitySet, Vec<String>) {
    let (tools, resources, prompts) = tokio::join!(
        session.list_tools(timeout),
        session.list_resources(timeout),
        session.list_prompts(timeout),
    );

    let mut issues = Vec::new();
    let set = ServerCapabilitySet {
        tools: settle(session.server(), "tools", tools, &mut issues),
        resources: settle(session.server(), "resources", resources, &mut issues),
        prompts: settle(session.server(), "prompts", prompts, &mut issues),
    };
    (set, issues)
}

fn settle<T>(
    server: &str,
    category: &str,
    result: Result<Vec<T>, McpError>,
    issues: &mut Vec<String>,
) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!(server = %server, category = category, error = %e, "Discovery failed");
        issues.push(format!("{} discovery failed: {}", category, e));
        Vec::new()
    })
}

/// Drain a connection's events until it closes or is dropped.
async fn watch_events(
    inner: Weak<Inner>,
    connection: Weak<Connection>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) else {
            break;
        };
        match event {
            TransportEvent::Notification(notification) => {
                inner
                    .handle_notification(&connection, &notification.method)
                    .await;
            }
            TransportEvent::Closed(reason) => {
                inner.connection_lost(&connection, &reason);
                break;
            }
        }
    }
}
