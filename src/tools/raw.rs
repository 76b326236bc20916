//! Raw command passthrough and the echo testing tool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::error::{ErrorCode, Result};
use crate::qrwc::adapter::SendOptions;

use super::dispatcher::{require_string, Tool, ToolContext};

/// Commands that must never reach the core through this surface.
const DENYLIST: [&str; 5] = [
    "Core.Reboot",
    "Core.Shutdown",
    "Core.FactoryReset",
    "Design.Delete",
    "Design.Deploy",
];

/// `send_raw_command`: pass a method straight to the adapter.
///
/// Unknown methods and denied commands become structured
/// `{success:false}` payloads, not protocol errors.
pub struct SendRawCommandTool {
    ctx: Arc<ToolContext>,
}

impl SendRawCommandTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for SendRawCommandTool {
    fn name(&self) -> &'static str {
        "send_raw_command"
    }

    fn description(&self) -> &'static str {
        "Send a raw QRWC method to the core (destructive methods are blocked)"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "method").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let method = require_string(&params, "method")?;
        let command_params = params.get("params").cloned().unwrap_or(Value::Null);
        let timeout_ms = params
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .unwrap_or(10_000);

        if DENYLIST
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(&method))
        {
            return Ok(serde_json::json!({
                "success": false,
                "method": method,
                "error": format!("Command {method} is blocked by policy"),
            }));
        }

        let opts = SendOptions {
            timeout: Duration::from_millis(timeout_ms),
            ..SendOptions::default()
        };
        match self
            .ctx
            .adapter
            .send_command_with(&method, command_params, opts)
            .await
        {
            Ok(response) => Ok(serde_json::json!({
                "success": true,
                "method": method,
                "response": response,
            })),
            Err(e) if e.code == ErrorCode::QsysUnknownCommand => Ok(serde_json::json!({
                "success": false,
                "method": method,
                "error": e.message,
            })),
            Err(e) => Err(e),
        }
    }
}

/// `echo`: connectivity smoke test for the tool surface itself.
pub struct EchoTool;

impl EchoTool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn description(&self) -> &'static str {
        "Echo a message back (testing)"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "message").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let message = require_string(&params, "message")?;
        Ok(serde_json::json!({
            "echo": message,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::scripted_context;

    #[tokio::test]
    async fn test_denylist_blocks_reboot() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = SendRawCommandTool::new(&ctx);

        for method in ["Core.Reboot", "core.reboot"] {
            let result = tool
                .execute(serde_json::json!({ "method": method }))
                .await
                .unwrap();
            assert_eq!(result["success"], false);
            assert!(result["error"].as_str().unwrap().contains("blocked"));
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_structured_failure() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = SendRawCommandTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "method": "Mixer.Dance" }))
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("Mixer.Dance"));
    }

    #[tokio::test]
    async fn test_passthrough_success() {
        let ctx = scripted_context(
            vec![Ok(serde_json::json!({ "Platform": "Core 110f" }))],
            Duration::from_secs(1),
        );
        let tool = SendRawCommandTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "method": "Status.Get" }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["response"]["Platform"], "Core 110f");
    }

    #[tokio::test]
    async fn test_echo() {
        let tool = EchoTool::new();
        let result = tool
            .execute(serde_json::json!({ "message": "ping" }))
            .await
            .unwrap();
        assert_eq!(result["echo"], "ping");
    }
}
