//! Tool dispatcher.
//!
//! One entry per tool. Every call is schema-validated, gated on the
//! connection when the tool needs one, executed under a deadline, and
//! wrapped in an error boundary: nothing a tool does can throw across
//! the protocol boundary. Results are always JSON text content.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::changegroup::ChangeGroupRegistry;
use crate::core::error::{QsysError, Result};
use crate::monitor::{EventStore, RingCache};
use crate::qrwc::adapter::CommandAdapter;
use crate::qrwc::supervisor::ConnectionSupervisor;

/// One content block of a tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    /// Always `"text"`.
    #[serde(rename = "type")]
    pub content_type: &'static str,

    /// JSON-serialized payload.
    pub text: String,
}

/// The protocol-level result of a tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// Content blocks (always exactly one).
    pub content: Vec<ToolContent>,

    /// Whether the call failed.
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResult {
    /// Successful result wrapping a JSON payload.
    pub fn json(value: &Value) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text",
                text: value.to_string(),
            }],
            is_error: false,
        }
    }

    /// Error result wrapping a serialized error object.
    pub fn error(err: &QsysError) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text",
                text: err.to_json().to_string(),
            }],
            is_error: true,
        }
    }

    /// Error result from a bare message (panic boundary, timeouts).
    pub fn error_text(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text",
                text: serde_json::json!({ "error": message.into() }).to_string(),
            }],
            is_error: true,
        }
    }

    /// Parse the payload back out (test helper, mostly).
    pub fn payload(&self) -> Value {
        self.content
            .first()
            .and_then(|c| serde_json::from_str(&c.text).ok())
            .unwrap_or(Value::Null)
    }
}

/// Everything a tool can reach.
pub struct ToolContext {
    /// Command adapter into the core.
    pub adapter: Arc<CommandAdapter>,

    /// Connection supervisor (state, health, history).
    pub supervisor: Arc<ConnectionSupervisor>,

    /// Change-group registry.
    pub registry: Arc<ChangeGroupRegistry>,

    /// In-memory event ring.
    pub ring: Option<Arc<RingCache>>,

    /// Durable event store (when monitoring is enabled).
    pub store: Option<Arc<EventStore>>,

    /// Whether the event recorder is on.
    pub monitoring_enabled: bool,

    /// Per-call execution deadline.
    pub tool_timeout: Duration,
}

/// A dispatchable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str;

    /// Whether the call needs a live connection. Tools that can answer
    /// usefully while disconnected opt out.
    fn requires_connection(&self) -> bool {
        true
    }

    /// Validate the input object. Reject, never coerce silently.
    fn validate(&self, params: &Value) -> Result<()>;

    /// Execute. Any error here is converted by the boundary; panics are
    /// caught one level up.
    async fn execute(&self, params: Value) -> Result<Value>;
}

/// The dispatcher.
pub struct ToolDispatcher {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    ctx: Arc<ToolContext>,
}

impl ToolDispatcher {
    /// Build a dispatcher with the fixed tool catalogue.
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        let mut dispatcher = Self {
            tools: HashMap::new(),
            ctx: Arc::clone(&ctx),
        };
        for tool in super::catalogue(&ctx) {
            dispatcher.register(tool);
        }
        dispatcher
    }

    /// Register one tool. Last registration wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch one call. Never panics, never returns a raw error.
    pub async fn dispatch(&self, name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error(&QsysError::tool_not_found(name));
        };

        if let Err(e) = tool.validate(&params) {
            // Surface validation failures under the dispatcher category.
            let err = QsysError::invalid_params(e.message.clone()).with_context(e.context);
            return ToolResult::error(&err);
        }

        if tool.requires_connection() && !self.ctx.adapter.is_connected() {
            return ToolResult::error(
                &QsysError::connection("Q-SYS Core not connected").with_context(
                    serde_json::json!({ "tool": name }),
                ),
            );
        }

        let tool = Arc::clone(tool);
        let mut handle = tokio::spawn(async move { tool.execute(params).await });

        match tokio::time::timeout(self.ctx.tool_timeout, &mut handle).await {
            Err(_) => {
                handle.abort();
                ToolResult::error(
                    &QsysError::timeout(format!(
                        "Tool {name} timed out after {}ms",
                        self.ctx.tool_timeout.as_millis()
                    ))
                    .with_context(serde_json::json!({ "tool": name })),
                )
            }
            Ok(Err(join_err)) => {
                // The error boundary: a panicking tool becomes an error
                // result, not a crashed process.
                tracing::error!(tool = name, error = %join_err, "Tool task failed");
                ToolResult::error_text(format!("Tool {name} failed: {join_err}"))
            }
            Ok(Ok(Err(e))) => ToolResult::error(&e),
            Ok(Ok(Ok(value))) => ToolResult::json(&value),
        }
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.tool_names())
            .finish()
    }
}

// === Validation helpers shared by the tool impls ===

pub(crate) fn require_object(params: &Value) -> Result<()> {
    if params.is_object() || params.is_null() {
        Ok(())
    } else {
        Err(QsysError::invalid_params("Parameters must be an object"))
    }
}

pub(crate) fn require_string(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            QsysError::invalid_params(format!("Missing required string field: {field}"))
        })
}

pub(crate) fn optional_string(params: &Value, field: &str) -> Option<String> {
    params.get(field).and_then(Value::as_str).map(String::from)
}

pub(crate) fn require_string_array(params: &Value, field: &str) -> Result<Vec<String>> {
    let raw = params
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| QsysError::invalid_params(format!("Missing required array: {field}")))?;
    raw.iter()
        .map(|item| {
            item.as_str()
                .map(String::from)
                .ok_or_else(|| QsysError::invalid_params(format!("{field} must contain strings")))
        })
        .collect()
}

pub(crate) fn optional_string_array(params: &Value, field: &str) -> Result<Option<Vec<String>>> {
    if params.get(field).is_none() {
        return Ok(None);
    }
    require_string_array(params, field).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &'static str {
            "panic_tool"
        }
        fn description(&self) -> &'static str {
            "always panics"
        }
        fn requires_connection(&self) -> bool {
            false
        }
        fn validate(&self, _params: &Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _params: Value) -> Result<Value> {
            panic!("boom");
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow_tool"
        }
        fn description(&self) -> &'static str {
            "never finishes"
        }
        fn requires_connection(&self) -> bool {
            false
        }
        fn validate(&self, _params: &Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _params: Value) -> Result<Value> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    fn test_dispatcher() -> ToolDispatcher {
        let ctx = crate::tools::tests::disconnected_context(Duration::from_millis(200));
        ToolDispatcher::new(ctx)
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dispatcher = test_dispatcher();
        let result = dispatcher.dispatch("no_such_tool", Value::Null).await;
        assert!(result.is_error);
        assert_eq!(result.payload()["code"], "MCP_TOOL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let mut dispatcher = test_dispatcher();
        dispatcher.register(Arc::new(PanickyTool));
        let result = dispatcher.dispatch("panic_tool", Value::Null).await;
        assert!(result.is_error);
        assert!(result.payload()["error"]
            .as_str()
            .unwrap()
            .contains("panic_tool"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let mut dispatcher = test_dispatcher();
        dispatcher.register(Arc::new(SlowTool));
        let result = dispatcher.dispatch("slow_tool", Value::Null).await;
        assert!(result.is_error);
        assert_eq!(result.payload()["code"], "NETWORK_TIMEOUT");
    }

    #[tokio::test]
    async fn test_connection_gate() {
        let dispatcher = test_dispatcher();
        // list_components requires a connection; the context is down.
        let result = dispatcher
            .dispatch("list_components", serde_json::json!({}))
            .await;
        assert!(result.is_error);
        assert_eq!(result.payload()["code"], "QSYS_CONNECTION_FAILED");
    }

    #[tokio::test]
    async fn test_fixed_catalogue_is_registered() {
        let dispatcher = test_dispatcher();
        let names = dispatcher.tool_names();
        for expected in [
            "list_components",
            "qsys_component_get",
            "list_controls",
            "get_control_values",
            "set_control_values",
            "query_core_status",
            "qsys_get_all_controls",
            "send_raw_command",
            "create_change_group",
            "add_controls_to_change_group",
            "remove_controls_from_change_group",
            "clear_change_group",
            "list_change_groups",
            "poll_change_group",
            "destroy_change_group",
            "manage_connection",
            "query_change_events",
            "echo",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }

    #[test]
    fn test_result_serialization() {
        let ok = ToolResult::json(&serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert!(json.get("isError").is_none());

        let err = ToolResult::error_text("nope");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["isError"], true);
    }
}
