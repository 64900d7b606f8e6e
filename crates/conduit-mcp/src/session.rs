//! MCP protocol session.
//!
//! An [`McpSession`] wraps one transport with the MCP handshake and typed
//! requests. It assigns request ids; the transport matches responses to them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use conduit_core::TransportKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::protocol::{
    methods, CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, ListPromptsResult,
    ListResourcesResult, ListToolsResult, McpPrompt, McpResource, McpToolDefinition,
    PaginatedParams, ReadResourceParams, ReadResourceResult, ServerCapabilities, ServerInfo,
    ToolContent, MCP_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::{McpTransport, Transport, TransportEvent};

/// Upper bound on pages followed for one listing.
pub const MAX_LIST_PAGES: usize = 64;

/// Outcome of a tool call that reached the server.
///
/// `success == false` covers both a JSON-RPC error response and a result
/// flagged `isError`; transport failures and timeouts are errors instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// Whether the tool ran successfully.
    pub success: bool,
    /// Text output of the tool.
    pub output: String,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw content items, including non-text content.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Structured output, when the tool provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallResult {
    /// A call the server refused with a JSON-RPC error.
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(format!("{} (code {})", message.into(), code)),
            content: Vec::new(),
            structured_content: None,
        }
    }
}

impl From<CallToolResult> for CallResult {
    fn from(result: CallToolResult) -> Self {
        let output = result.text();
        let error = if result.is_error {
            Some(if output.is_empty() {
                "tool reported an error".to_string()
            } else {
                output.clone()
            })
        } else {
            None
        };

        Self {
            success: !result.is_error,
            output,
            error,
            content: result.content,
            structured_content: result.structured_content,
        }
    }
}

/// A handshaken MCP session over one transport.
pub struct McpSession {
    server: String,
    transport: McpTransport,
    request_counter: AtomicU64,
    initialized: OnceLock<InitializeResult>,
}

impl McpSession {
    /// Wrap an open transport. Call [`initialize`](Self::initialize) next.
    pub fn new(server: impl Into<String>, transport: McpTransport) -> Self {
        Self {
            server: server.into(),
            transport,
            request_counter: AtomicU64::new(1),
            initialized: OnceLock::new(),
        }
    }

    /// Get the server name.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The transport kind.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Whether the underlying transport is still usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Capabilities declared during the handshake.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.initialized
            .get()
            .map(|init| init.capabilities.clone())
            .unwrap_or_default()
    }

    /// Server identity reported during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.initialized.get().map(|init| &init.server_info)
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<&str> {
        self.initialized.get().map(|init| init.protocol_version.as_str())
    }

    /// Take the server's notification stream (once).
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.transport.take_events()
    }

    /// Recent stderr of a stdio server.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.transport.stderr_tail()
    }

    /// Close the transport.
    pub async fn close(&self) {
        self.transport.close().await
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.initialized.get().is_none() {
            return Err(McpError::NotInitialized);
        }
        Ok(())
    }

    /// Send a request and decode its result.
    async fn request<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> Result<R, McpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = params.map(serde_json::to_value).transpose()?;
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);

        let response = self.transport.request(request, timeout).await?;

        if let Some(error) = response.error {
            return Err(McpError::server_error(error.code, error.message));
        }

        let result = response
            .result
            .ok_or_else(|| McpError::protocol(format!("{} response missing result", method)))?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("failed to decode {} result: {}", method, e)))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.transport
            .notify(JsonRpcNotification::new(method, params))
            .await?;
        Ok(())
    }

    /// Run the `initialize` / `notifications/initialized` handshake.
    pub async fn initialize(&self, timeout: Duration) -> Result<&InitializeResult, McpError> {
        if let Some(init) = self.initialized.get() {
            return Ok(init);
        }

        debug!(server = %self.server, transport = %self.kind(), "Initializing MCP session");

        let result: InitializeResult = self
            .request(methods::INITIALIZE, Some(InitializeParams::default()), timeout)
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(McpError::VersionMismatch {
                offered: MCP_PROTOCOL_VERSION.to_string(),
                received: result.protocol_version,
            });
        }

        self.notify(methods::INITIALIZED, None).await?;
        self.transport.on_initialized().await?;

        info!(
            server = %self.server,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );

        Ok(self.initialized.get_or_init(|| result))
    }

    /// Follow `nextCursor` until the listing is exhausted.
    async fn list_all<R, T>(
        &self,
        method: &str,
        timeout: Duration,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>, McpError>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor = None;

        for _ in 0..MAX_LIST_PAGES {
            let page: R = self
                .request(method, Some(PaginatedParams { cursor }), timeout)
                .await?;
            let (mut page_items, next) = split(page);
            items.append(&mut page_items);

            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        warn!(server = %self.server, method = method, pages = MAX_LIST_PAGES, "Listing truncated");
        Ok(items)
    }

    /// List the server's tools. Empty if the server declares no tools capability.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolDefinition>, McpError> {
        self.ensure_initialized()?;
        if !self.capabilities().supports_tools() {
            return Ok(Vec::new());
        }

        let tools = self
            .list_all(methods::TOOLS_LIST, timeout, |page: ListToolsResult| {
                (page.tools, page.next_cursor)
            })
            .await?;
        debug!(server = %self.server, tool_count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// List the server's resources. Empty if unsupported.
    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<McpResource>, McpError> {
        self.ensure_initialized()?;
        if !self.capabilities().supports_resources() {
            return Ok(Vec::new());
        }

        let resources = self
            .list_all(methods::RESOURCES_LIST, timeout, |page: ListResourcesResult| {
                (page.resources, page.next_cursor)
            })
            .await?;
        debug!(server = %self.server, resource_count = resources.len(), "Listed resources");
        Ok(resources)
    }

    /// List the server's prompts. Empty if unsupported.
    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<McpPrompt>, McpError> {
        self.ensure_initialized()?;
        if !self.capabilities().supports_prompts() {
            return Ok(Vec::new());
        }

        let prompts = self
            .list_all(methods::PROMPTS_LIST, timeout, |page: ListPromptsResult| {
                (page.prompts, page.next_cursor)
            })
            .await?;
        debug!(server = %self.server, prompt_count = prompts.len(), "Listed prompts");
        Ok(prompts)
    }

    /// Call a tool on the server.
    ///
    /// A JSON-RPC error response becomes a failed [`CallResult`], not an error.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallResult, McpError> {
        self.ensure_initialized()?;

        debug!(server = %self.server, tool = name, "Calling tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        match self
            .request::<_, CallToolResult>(methods::TOOLS_CALL, Some(params), timeout)
            .await
        {
            Ok(result) => {
                if result.is_error {
                    warn!(server = %self.server, tool = name, "Tool returned error");
                }
                Ok(result.into())
            }
            Err(McpError::ServerError { code, message }) => {
                warn!(server = %self.server, tool = name, code = code, "Tool call rejected");
                Ok(CallResult::rejected(code, message))
            }
            Err(e) => Err(e),
        }
    }

    /// Read a resource by URI.
    pub async fn read_resource(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<ReadResourceResult, McpError> {
        self.ensure_initialized()?;
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request(methods::RESOURCES_READ, Some(params), timeout)
            .await
    }

    /// Render a prompt with arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<std::collections::BTreeMap<String, String>>,
        timeout: Duration,
    ) -> Result<GetPromptResult, McpError> {
        self.ensure_initialized()?;
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(methods::PROMPTS_GET, Some(params), timeout)
            .await
    }

    /// Issue the cheapest listing the server supports, as a liveness probe.
    ///
    /// Returns `None` if the server declares no listable capability.
    pub async fn probe(&self, timeout: Duration) -> Option<Result<(), McpError>> {
        if self.ensure_initialized().is_err() {
            return Some(Err(McpError::NotInitialized));
        }

        let capabilities = self.capabilities();
        let method = if capabilities.supports_tools() {
            methods::TOOLS_LIST
        } else if capabilities.supports_resources() {
            methods::RESOURCES_LIST
        } else if capabilities.supports_prompts() {
            methods::PROMPTS_LIST
        } else {
            return None;
        };

        Some(
            self.request::<PaginatedParams, Value>(method, Some(PaginatedParams::default()), timeout)
                .await
                .map(|_| ()),
        )
    }
}
