// ABOUTME: The MCP server capability contract the service registers tool handles against
// ABOUTME: Wire protocol framing itself is out of scope; this is the in-process registration seam

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::AppError;
use crate::model::DynamicTool;

/// A single callable tool handle, as the capability layer exposes it to a
/// session's tool-call dispatch. `input` is the already-deserialized
/// arguments object; the handle is responsible for invoking the sandbox
/// and shaping the `ExecutionResult` into a tool-call response.
#[async_trait]
pub trait ToolHandle: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value, AppError>;
}

/// The capability contract a dynamic-tool-aware MCP server implementation
/// exposes (spec section 6, "`McpServer` capability contract"). The HTTP
/// session layer holds one instance per session; the dynamic tool service
/// registers/deregisters handles against every live session's instance as
/// tools change.
#[async_trait]
pub trait McpServer: Send + Sync {
    /// Registers or replaces a callable tool handle under `name`.
    async fn register_tool(&self, name: &str, handle: std::sync::Arc<dyn ToolHandle>);

    /// Removes a tool handle, if present.
    async fn deregister_tool(&self, name: &str);

    /// Notifies subscribers that the tool list changed (`notifications/tools/list_changed`).
    fn send_tool_list_changed(&self);
}

/// Minimal in-process `McpServer` implementation sufficient to back the
/// HTTP session layer: a concurrent name -> handle map plus a broadcast
/// channel for list-changed notifications. The actual JSON-RPC framing of
/// `tools/list` and `tools/call` lives in the HTTP layer, which reads this
/// map directly.
pub struct InProcessMcpServer {
    handles: DashMap<String, std::sync::Arc<dyn ToolHandle>>,
    list_changed: broadcast::Sender<()>,
}

impl InProcessMcpServer {
    #[must_use]
    pub fn new() -> Self {
        let (list_changed, _rx) = broadcast::channel(16);
        Self {
            handles: DashMap::new(),
            list_changed,
        }
    }

    #[must_use]
    pub fn subscribe_list_changed(&self) -> broadcast::Receiver<()> {
        self.list_changed.subscribe()
    }

    #[must_use]
    pub fn registered_names(&self) -> Vec<String> {
        self.handles.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn call_tool(&self, name: &str, input: Value) -> Result<Value, AppError> {
        let handle = self
            .handles
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' is not registered")))?;
        handle.call(input).await
    }
}

impl Default for InProcessMcpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpServer for InProcessMcpServer {
    async fn register_tool(&self, name: &str, handle: std::sync::Arc<dyn ToolHandle>) {
        self.handles.insert(name.to_owned(), handle);
    }

    async fn deregister_tool(&self, name: &str) {
        self.handles.remove(name);
    }

    fn send_tool_list_changed(&self) {
        let _ = self.list_changed.send(());
    }
}

/// Projects a `DynamicTool` into the tool-list shape an MCP client expects
/// (name/title/description plus a JSON-schema-ish input placeholder; the
/// dynamic runtime does not derive a static schema from tool code).
#[must_use]
pub fn tool_list_entry(tool: &DynamicTool) -> Value {
    serde_json::json!({
        "name": tool.name,
        "title": tool.title,
        "description": tool.description,
        "inputSchema": {
            "type": "object",
            "additionalProperties": true,
        },
    })
}
