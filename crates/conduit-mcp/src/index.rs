//! Capability index: every connected server's tools, resources and prompts
//! under globally unique `mcp__<server>__<name>` names.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::protocol::{McpPrompt, McpResource, McpToolDefinition, PromptArgument};

/// Prefix for MCP capability names to avoid collisions with built-in tools.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// Separator between server name and raw name.
const SEPARATOR: &str = "__";

/// Build the qualified name for `raw_name` on `server`.
pub fn qualified_name(server: &str, raw_name: &str) -> String {
    format!("{}{}{}{}", MCP_TOOL_PREFIX, server, SEPARATOR, raw_name)
}

/// Split a qualified name into `(server, raw_name)`.
///
/// Server names never contain `__`, so the first separator after the prefix
/// is the boundary; the raw name may contain `__` itself.
pub fn parse_qualified_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?;
    let (server, raw) = rest.split_once(SEPARATOR)?;
    if server.is_empty() || raw.is_empty() {
        return None;
    }
    Some((server, raw))
}

/// Common shape of indexed descriptors.
pub trait Descriptor: Clone {
    /// Category label used in messages ("tool", "resource", "prompt").
    const KIND: &'static str;

    fn qualified_name(&self) -> &str;
    fn raw_name(&self) -> &str;
    fn server_name(&self) -> &str;
}

/// A tool exposed by a connected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub raw_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Forwarded as-is; arguments are not validated against it here.
    pub input_schema: Value,
    pub server_name: String,
}

impl ToolDescriptor {
    pub fn new(server: &str, tool: McpToolDefinition) -> Self {
        Self {
            qualified_name: qualified_name(server, &tool.name),
            raw_name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            server_name: server.to_string(),
        }
    }
}

impl Descriptor for ToolDescriptor {
    const KIND: &'static str = "tool";

    fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    fn raw_name(&self) -> &str {
        &self.raw_name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// A resource exposed by a connected server, keyed by its name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub qualified_name: String,
    pub raw_name: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub server_name: String,
}

impl ResourceDescriptor {
    pub fn new(server: &str, resource: McpResource) -> Self {
        Self {
            qualified_name: qualified_name(server, &resource.name),
            raw_name: resource.name,
            uri: resource.uri,
            description: resource.description,
            mime_type: resource.mime_type,
            server_name: server.to_string(),
        }
    }
}

impl Descriptor for ResourceDescriptor {
    const KIND: &'static str = "resource";

    fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    fn raw_name(&self) -> &str {
        &self.raw_name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// A prompt exposed by a connected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDescriptor {
    pub qualified_name: String,
    pub raw_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    pub server_name: String,
}

impl PromptDescriptor {
    pub fn new(server: &str, prompt: McpPrompt) -> Self {
        Self {
            qualified_name: qualified_name(server, &prompt.name),
            raw_name: prompt.name,
            description: prompt.description,
            arguments: prompt.arguments,
            server_name: server.to_string(),
        }
    }
}

impl Descriptor for PromptDescriptor {
    const KIND: &'static str = "prompt";

    fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    fn raw_name(&self) -> &str {
        &self.raw_name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// One capability category: O(1) lookup plus each server's entries in
/// discovery order.
#[derive(Debug, Clone)]
pub struct Catalog<T> {
    entries: HashMap<String, T>,
    by_server: BTreeMap<String, Vec<String>>,
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_server: BTreeMap::new(),
        }
    }
}

/// Outcome of swapping one server's entries in a [`Catalog`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogUpdate {
    pub indexed: usize,
    /// One message per entry that could not be indexed.
    pub conflicts: Vec<String>,
}

impl<T: Descriptor> Catalog<T> {
    /// Swap a server's entries for `items`.
    ///
    /// A raw name a server reports twice keeps its first descriptor. An entry
    /// whose qualified name is already owned by another server is not
    /// indexed. Both cases are reported in the returned conflicts.
    pub fn replace(&mut self, server: &str, items: Vec<T>) -> CatalogUpdate {
        self.remove(server);

        let mut names = Vec::with_capacity(items.len());
        let mut conflicts = Vec::new();
        for item in items {
            let name = item.qualified_name().to_string();
            if let Some(existing) = self.entries.get(&name) {
                let conflict = if existing.server_name() == server {
                    format!("{} '{}' reported twice, keeping the first", T::KIND, item.raw_name())
                } else {
                    format!(
                        "{} '{}' not indexed: {} already belongs to server '{}'",
                        T::KIND,
                        item.raw_name(),
                        name,
                        existing.server_name()
                    )
                };
                warn!(server = %server, name = item.raw_name(), "{}", conflict);
                conflicts.push(conflict);
                continue;
            }
            names.push(name.clone());
            self.entries.insert(name, item);
        }

        let indexed = names.len();
        self.by_server.insert(server.to_string(), names);
        CatalogUpdate { indexed, conflicts }
    }

    /// Drop every entry belonging to `server`.
    pub fn remove(&mut self, server: &str) {
        if let Some(names) = self.by_server.remove(server) {
            for name in names {
                self.entries.remove(&name);
            }
        }
    }

    pub fn get(&self, qualified_name: &str) -> Option<&T> {
        self.entries.get(qualified_name)
    }

    /// Entries of one server, in discovery order.
    pub fn for_server(&self, server: &str) -> Vec<T> {
        self.by_server
            .get(server)
            .into_iter()
            .flatten()
            .filter_map(|name| self.entries.get(name).cloned())
            .collect()
    }

    /// All entries, grouped by server name.
    pub fn all(&self) -> Vec<T> {
        self.by_server
            .values()
            .flatten()
            .filter_map(|name| self.entries.get(name).cloned())
            .collect()
    }

    pub fn count(&self, server: &str) -> usize {
        self.by_server.get(server).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a server exposes, as discovered in one pass.
#[derive(Debug, Clone, Default)]
pub struct ServerCapabilitySet {
    pub tools: Vec<McpToolDefinition>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
}

/// Derived view over all connected servers' capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    pub tools: Catalog<ToolDescriptor>,
    pub resources: Catalog<ResourceDescriptor>,
    pub prompts: Catalog<PromptDescriptor>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all of a server's entries at once. Returns the conflicts of
    /// every category.
    pub fn replace_server(&mut self, server: &str, set: ServerCapabilitySet) -> Vec<String> {
        let mut conflicts = self.replace_tools(server, set.tools).conflicts;
        conflicts.extend(self.replace_resources(server, set.resources).conflicts);
        conflicts.extend(self.replace_prompts(server, set.prompts).conflicts);
        conflicts
    }

    pub fn replace_tools(&mut self, server: &str, tools: Vec<McpToolDefinition>) -> CatalogUpdate {
        let descriptors = tools
            .into_iter()
            .map(|t| ToolDescriptor::new(server, t))
            .collect();
        self.tools.replace(server, descriptors)
    }

    pub fn replace_resources(&mut self, server: &str, resources: Vec<McpResource>) -> CatalogUpdate {
        let descriptors = resources
            .into_iter()
            .map(|r| ResourceDescriptor::new(server, r))
            .collect();
        self.resources.replace(server, descriptors)
    }

    pub fn replace_prompts(&mut self, server: &str, prompts: Vec<McpPrompt>) -> CatalogUpdate {
        let descriptors = prompts
            .into_iter()
            .map(|p| PromptDescriptor::new(server, p))
            .collect();
        self.prompts.replace(server, descriptors)
    }

    /// Remove a server's whole slice.
    pub fn remove_server(&mut self, server: &str) {
        self.tools.remove(server);
        self.resources.remove(server);
        self.prompts.remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.to_string(),
            description: Some(format!("The {} tool", name)),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                }
            }),
        }
    }

    #[test]
    fn test_qualified_name_generation() {
        assert_eq!(qualified_name("filesystem", "read_file"), "mcp__filesystem__read_file");
    }

    #[test]
    fn test_parse_qualified_name() {
        assert_eq!(
            parse_qualified_name("mcp__filesystem__read_file"),
            Some(("filesystem", "read_file"))
        );
        assert_eq!(
            parse_qualified_name("mcp__github__create__issue"),
            Some(("github", "create__issue"))
        );

        assert_eq!(parse_qualified_name("not_mcp_tool"), None);
        assert_eq!(parse_qualified_name("mcp__only_server"), None);
        assert_eq!(parse_qualified_name("mcp____read"), None);
    }

    #[test]
    fn test_same_raw_name_on_two_servers() {
        let mut index = CapabilityIndex::new();
        index.replace_tools("serverA", vec![tool("read")]);
        index.replace_tools("serverB", vec![tool("read")]);

        let names: Vec<String> = index
            .tools
            .all()
            .into_iter()
            .map(|t| t.qualified_name)
            .collect();
        assert_eq!(names, vec!["mcp__serverA__read", "mcp__serverB__read"]);
        assert!(index.tools.get("read").is_none());
    }

    #[test]
    fn test_replace_swaps_server_slice() {
        let mut index = CapabilityIndex::new();
        index.replace_tools("fs", vec![tool("read"), tool("write")]);
        index.replace_tools("git", vec![tool("log")]);

        let update = index.replace_tools("fs", vec![tool("list")]);
        assert_eq!(update.indexed, 1);
        assert!(update.conflicts.is_empty());
        assert!(index.tools.get("mcp__fs__read").is_none());
        assert!(index.tools.get("mcp__fs__list").is_some());
        assert_eq!(index.tools.count("git"), 1);
        assert_eq!(index.tools.len(), 2);
    }

    #[test]
    fn test_duplicate_raw_name_keeps_first() {
        let mut index = CapabilityIndex::new();
        let mut second = tool("read");
        second.description = Some("shadow".to_string());

        let update = index.replace_tools("fs", vec![tool("read"), second]);
        assert_eq!(update.indexed, 1);
        assert_eq!(update.conflicts, vec!["tool 'read' reported twice, keeping the first"]);
        assert_eq!(
            index.tools.get("mcp__fs__read").unwrap().description.as_deref(),
            Some("The read tool")
        );
    }

    #[test]
    fn test_cross_server_collision_is_reported() {
        let mut index = CapabilityIndex::new();
        index.replace_tools("x", vec![tool("_y")]);

        let update = index.replace_tools("x_", vec![tool("y")]);
        assert_eq!(update.indexed, 0);
        assert_eq!(
            update.conflicts,
            vec!["tool 'y' not indexed: mcp__x___y already belongs to server 'x'"]
        );
        assert_eq!(index.tools.get("mcp__x___y").unwrap().server_name, "x");
    }

    #[test]
    fn test_remove_server_clears_all_categories() {
        let mut index = CapabilityIndex::new();
        let conflicts = index.replace_server(
            "docs",
            ServerCapabilitySet {
                tools: vec![tool("search")],
                resources: vec![McpResource {
                    uri: "file:///readme.md".to_string(),
                    name: "readme".to_string(),
                    description: None,
                    mime_type: Some("text/markdown".to_string()),
                }],
                prompts: vec![McpPrompt {
                    name: "summarize".to_string(),
                    description: None,
                    arguments: vec![],
                }],
            },
        );

        assert!(conflicts.is_empty());

        let resource = index.resources.get("mcp__docs__readme").unwrap();
        assert_eq!(resource.uri, "file:///readme.md");
        assert_eq!(index.prompts.for_server("docs").len(), 1);

        index.remove_server("docs");
        assert!(index.tools.is_empty());
        assert!(index.resources.is_empty());
        assert!(index.prompts.is_empty());
        assert_eq!(index.tools.count("docs"), 0);
    }

    #[test]
    fn test_tool_descriptor_serialization() {
        let descriptor = ToolDescriptor::new("echo", tool("ping"));
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["qualifiedName"], "mcp__echo__ping");
        assert_eq!(json["serverName"], "echo");
        assert_eq!(json["inputSchema"]["type"], "object");
    }
}
