//! Connection registry: the manager's shared state.
//!
//! All mutations happen under one write lock and never span I/O; callers
//! compute results first and commit them here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_core::{ServerConfig, TransportKind};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::AddServerError;
use crate::index::{
    CapabilityIndex, PromptDescriptor, ResourceDescriptor, ServerCapabilitySet, ToolDescriptor,
};
use crate::protocol::{McpPrompt, McpResource, McpToolDefinition};
use crate::session::McpSession;

/// Connection state for an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Closed by us.
    Disconnected,
    /// Transport opening or handshake in progress.
    Connecting,
    /// Handshake done; capabilities indexed.
    Connected,
    /// The transport failed underneath us.
    Errored,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// A live (or formerly live) connection to one server.
pub struct Connection {
    config: ServerConfig,
    session: McpSession,
    state: RwLock<ConnectionState>,
    connected_since: DateTime<Utc>,
    last_error: RwLock<Option<String>>,
    issues: RwLock<Vec<String>>,
}

impl Connection {
    pub(crate) fn new(config: ServerConfig, session: McpSession, issues: Vec<String>) -> Self {
        Self {
            config,
            session,
            state: RwLock::new(ConnectionState::Connected),
            connected_since: Utc::now(),
            last_error: RwLock::new(None),
            issues: RwLock::new(issues),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn session(&self) -> &McpSession {
        &self.session
    }

    pub fn kind(&self) -> TransportKind {
        self.config.kind()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connected in the registry and the transport still up.
    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Connected && self.session.is_connected()
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Problems found during discovery (a category that failed to list).
    pub fn issues(&self) -> Vec<String> {
        self.issues.read().clone()
    }

    pub(crate) fn push_issue(&self, issue: String) {
        self.issues.write().push(issue);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// Summary of one registered (or connecting) server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub state: ConnectionState,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub issues: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: BTreeMap<String, Arc<Connection>>,
    connecting: HashMap<String, TransportKind>,
    index: CapabilityIndex,
}

impl RegistryState {
    /// Whether `connection` is still the registered entry for its name.
    fn is_current(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .get(connection.name())
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }
}

/// Server name to connection map plus the capability index.
#[derive(Default)]
pub(crate) struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve `name` for a connection attempt.
    ///
    /// Fails if the name is connected or already being connected. An Errored
    /// or Disconnected entry stays visible until the attempt commits.
    pub(crate) fn begin_connect(
        &self,
        name: &str,
        kind: TransportKind,
    ) -> Result<(), AddServerError> {
        let mut state = self.state.write();
        let connected = state
            .connections
            .get(name)
            .is_some_and(|c| c.state() == ConnectionState::Connected);
        if connected || state.connecting.contains_key(name) {
            return Err(AddServerError::DuplicateServer(name.to_string()));
        }
        state.connecting.insert(name.to_string(), kind);
        Ok(())
    }

    /// Release a reservation without committing.
    pub(crate) fn abort_connect(&self, name: &str) {
        self.state.write().connecting.remove(name);
    }

    /// Install a new connection and its capabilities in one step.
    ///
    /// `on_commit` runs before the lock is released, so state kept beside the
    /// registry cannot be observed out of step with it. Returns the entry it
    /// replaced, which the caller must close.
    pub(crate) fn commit(
        &self,
        connection: Arc<Connection>,
        capabilities: ServerCapabilitySet,
        on_commit: impl FnOnce(&Connection),
    ) -> Option<Arc<Connection>> {
        let name = connection.name().to_string();
        let mut state = self.state.write();
        state.connecting.remove(&name);
        for conflict in state.index.replace_server(&name, capabilities) {
            connection.push_issue(conflict);
        }
        on_commit(&connection);
        state.connections.insert(name, connection)
    }

    /// Remove an entry and its capabilities, running `on_remove` under the
    /// lock if there was one.
    pub(crate) fn remove(&self, name: &str, on_remove: impl FnOnce()) -> Option<Arc<Connection>> {
        let mut state = self.state.write();
        let removed = state.connections.remove(name)?;
        state.index.remove_server(name);
        on_remove();
        Some(removed)
    }

    /// Run `f` only while `connection` is the registered entry for its name.
    /// Returns whether it ran.
    pub(crate) fn with_current(&self, connection: &Arc<Connection>, f: impl FnOnce()) -> bool {
        let state = self.state.read();
        if !state.is_current(connection) {
            return false;
        }
        f();
        true
    }

    /// Remove every entry (shutdown).
    pub(crate) fn drain(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.write();
        state.index = CapabilityIndex::new();
        state.connecting.clear();
        std::mem::take(&mut state.connections).into_values().collect()
    }

    /// Move a Connected entry to Errored and drop its capabilities.
    ///
    /// Returns `false` if the connection was replaced or is not Connected;
    /// otherwise `on_errored` runs under the lock.
    pub(crate) fn mark_errored(
        &self,
        connection: &Arc<Connection>,
        reason: &str,
        on_errored: impl FnOnce(),
    ) -> bool {
        let mut state = self.state.write();
        if !state.is_current(connection) || connection.state() != ConnectionState::Connected {
            return false;
        }
        connection.set_state(ConnectionState::Errored);
        *connection.last_error.write() = Some(reason.to_string());
        state.index.remove_server(connection.name());
        on_errored();
        true
    }

    /// Swap one capability category after re-discovery.
    pub(crate) fn replace_tools(
        &self,
        connection: &Arc<Connection>,
        tools: Vec<McpToolDefinition>,
    ) -> Option<usize> {
        let mut state = self.state.write();
        if !state.is_current(connection) || connection.state() != ConnectionState::Connected {
            return None;
        }
        let update = state.index.replace_tools(connection.name(), tools);
        for conflict in update.conflicts {
            connection.push_issue(conflict);
        }
        Some(update.indexed)
    }

    pub(crate) fn replace_resources(
        &self,
        connection: &Arc<Connection>,
        resources: Vec<McpResource>,
    ) -> Option<usize> {
        let mut state = self.state.write();
        if !state.is_current(connection) || connection.state() != ConnectionState::Connected {
            return None;
        }
        let update = state.index.replace_resources(connection.name(), resources);
        for conflict in update.conflicts {
            connection.push_issue(conflict);
        }
        Some(update.indexed)
    }

    pub(crate) fn replace_prompts(
        &self,
        connection: &Arc<Connection>,
        prompts: Vec<McpPrompt>,
    ) -> Option<usize> {
        let mut state = self.state.write();
        if !state.is_current(connection) || connection.state() != ConnectionState::Connected {
            return None;
        }
        let update = state.index.replace_prompts(connection.name(), prompts);
        for conflict in update.conflicts {
            connection.push_issue(conflict);
        }
        Some(update.indexed)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.state.read().connections.get(name).cloned()
    }

    /// All registered connections, ordered by name.
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.read().connections.values().cloned().collect()
    }

    /// Names of Connected servers, sorted.
    pub(crate) fn connected_names(&self) -> Vec<String> {
        self.state
            .read()
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Connected)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub(crate) fn transport_kind(&self, name: &str) -> Option<TransportKind> {
        let state = self.state.read();
        state
            .connections
            .get(name)
            .map(|c| c.kind())
            .or_else(|| state.connecting.get(name).copied())
    }

    pub(crate) fn resolve_tool(&self, qualified: &str) -> Option<(Arc<Connection>, ToolDescriptor)> {
        let state = self.state.read();
        let tool = state.index.tools.get(qualified)?.clone();
        let connection = state.connections.get(&tool.server_name)?.clone();
        Some((connection, tool))
    }

    pub(crate) fn resolve_resource(
        &self,
        qualified: &str,
    ) -> Option<(Arc<Connection>, ResourceDescriptor)> {
        let state = self.state.read();
        let resource = state.index.resources.get(qualified)?.clone();
        let connection = state.connections.get(&resource.server_name)?.clone();
        Some((connection, resource))
    }

    pub(crate) fn resolve_prompt(
        &self,
        qualified: &str,
    ) -> Option<(Arc<Connection>, PromptDescriptor)> {
        let state = self.state.read();
        let prompt = state.index.prompts.get(qualified)?.clone();
        let connection = state.connections.get(&prompt.server_name)?.clone();
        Some((connection, prompt))
    }

    pub(crate) fn tools(&self) -> Vec<ToolDescriptor> {
        self.state.read().index.tools.all()
    }

    pub(crate) fn resources(&self) -> Vec<ResourceDescriptor> {
        self.state.read().index.resources.all()
    }

    pub(crate) fn prompts(&self) -> Vec<PromptDescriptor> {
        self.state.read().index.prompts.all()
    }

    pub(crate) fn tool_count(&self, name: &str) -> usize {
        self.state.read().index.tools.count(name)
    }

    /// Summaries of every registered and connecting server, ordered by name.
    pub(crate) fn summaries(&self) -> Vec<ServerSummary> {
        let state = self.state.read();
        let mut summaries: Vec<ServerSummary> = state
            .connections
            .values()
            .map(|c| {
                let session = c.session();
                let info = session.server_info();
                ServerSummary {
                    name: c.name().to_string(),
                    state: c.state(),
                    transport: c.kind(),
                    server_name: info.map(|i| i.name.clone()),
                    server_version: info.and_then(|i| i.version.clone()),
                    protocol_version: session.protocol_version().map(str::to_string),
                    tool_count: state.index.tools.count(c.name()),
                    resource_count: state.index.resources.count(c.name()),
                    prompt_count: state.index.prompts.count(c.name()),
                    connected_since: Some(c.connected_since()),
                    last_error: c.last_error(),
                    issues: c.issues(),
                }
            })
            .collect();

        for (name, kind) in &state.connecting {
            if state.connections.contains_key(name) {
                continue;
            }
            summaries.push(ServerSummary {
                name: name.clone(),
                state: ConnectionState::Connecting,
                transport: *kind,
                server_name: None,
                server_version: None,
                protocol_version: None,
                tool_count: 0,
                resource_count: 0,
                prompt_count: 0,
                connected_since: None,
                last_error: None,
                issues: Vec::new(),
            });
        }

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}
