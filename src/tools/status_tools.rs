//! Core status and connection management tools.
//!
//! Both opt out of the connection gate: they must produce useful,
//! structured output while the wire is down.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::error::{QsysError, Result};

use super::dispatcher::{require_object, require_string, Tool, ToolContext};

/// `query_core_status`: engine status with a component-scan fallback.
pub struct QueryCoreStatusTool {
    ctx: Arc<ToolContext>,
}

impl QueryCoreStatusTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }

    fn disconnected_payload(&self) -> Value {
        serde_json::json!({
            "connectionStatus": {
                "connected": false,
                "state": self.ctx.supervisor.state().to_string(),
            },
            "systemHealth": { "status": "disconnected" },
            "_metadata": {
                "error": "Q-SYS Core not connected",
                "timestamp": Utc::now().to_rfc3339(),
            },
        })
    }

    /// Shape a successful `Status.Get` payload.
    fn shape_status(&self, status: Value) -> Value {
        serde_json::json!({
            "connectionStatus": { "connected": true, "state": "connected" },
            "platform": status.get("Platform").cloned().unwrap_or(Value::Null),
            "version": status.get("Version").cloned().unwrap_or(Value::Null),
            "designName": status.get("DesignName").cloned().unwrap_or(Value::Null),
            "designCode": status.get("DesignCode").cloned().unwrap_or(Value::Null),
            "status": status.get("Status").cloned().unwrap_or(Value::Null),
            "uptime": status.get("Uptime").cloned().unwrap_or(Value::Null),
            "network": status.get("Network").cloned().unwrap_or(Value::Null),
            "_metadata": {
                "source": "Status.Get",
                "timestamp": Utc::now().to_rfc3339(),
            },
        })
    }

    /// Fallback: scan components whose name mentions `Status`, read
    /// their controls, and bucket them by name heuristics.
    async fn component_fallback(&self) -> Result<Value> {
        let components = self
            .ctx
            .adapter
            .send_command("Component.GetComponents", Value::Null)
            .await?;
        let status_components: Vec<String> = components
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.get("Name").and_then(Value::as_str))
                    .filter(|name| name.to_ascii_lowercase().contains("status"))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut core = serde_json::Map::new();
        let mut peripheral = serde_json::Map::new();
        let mut general = serde_json::Map::new();

        for name in &status_components {
            let controls = match self
                .ctx
                .adapter
                .send_command(
                    "Component.GetControls",
                    serde_json::json!({ "Name": name }),
                )
                .await
            {
                Ok(controls) => controls,
                Err(e) => {
                    tracing::debug!(component = %name, error = %e, "Status fallback skip");
                    continue;
                }
            };

            let bucket = classify_status_component(name);
            let entries = controls
                .get("Controls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut shaped = serde_json::Map::new();
            for entry in entries {
                let Some(control) = entry.get("Name").and_then(Value::as_str) else {
                    continue;
                };
                shaped.insert(
                    control.to_string(),
                    serde_json::json!({
                        "value": entry.get("Value").cloned().unwrap_or(Value::Null),
                        "string": entry.get("String").cloned().unwrap_or(Value::Null),
                        "type": entry.get("Type").cloned().unwrap_or(Value::Null),
                    }),
                );
            }

            let target = match bucket {
                StatusBucket::Core => &mut core,
                StatusBucket::Peripheral => &mut peripheral,
                StatusBucket::General => &mut general,
            };
            target.insert(name.clone(), Value::Object(shaped));
        }

        Ok(serde_json::json!({
            "connectionStatus": { "connected": true, "state": "connected" },
            "CoreStatus": core,
            "PeripheralStatus": peripheral,
            "GeneralStatus": general,
            "_metadata": {
                "source": "component-fallback",
                "componentsScanned": status_components.len(),
                "timestamp": Utc::now().to_rfc3339(),
            },
        }))
    }
}

enum StatusBucket {
    Core,
    Peripheral,
    General,
}

fn classify_status_component(name: &str) -> StatusBucket {
    let lower = name.to_ascii_lowercase();
    if lower.contains("core") {
        StatusBucket::Core
    } else if ["mic", "camera", "speaker", "soundbar"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        StatusBucket::Peripheral
    } else {
        StatusBucket::General
    }
}

#[async_trait]
impl Tool for QueryCoreStatusTool {
    fn name(&self) -> &'static str {
        "query_core_status"
    }

    fn description(&self) -> &'static str {
        "Report core status; degrades to a structured payload when disconnected"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        if !self.ctx.adapter.is_connected() {
            return Ok(self.disconnected_payload());
        }

        match self.ctx.adapter.send_command("Status.Get", Value::Null).await {
            Ok(status) => Ok(self.shape_status(status)),
            Err(e) => {
                tracing::debug!(error = %e, "Status.Get failed, trying component fallback");
                self.component_fallback().await
            }
        }
    }
}

/// `manage_connection`: lifecycle actions plus history and diagnosis.
pub struct ManageConnectionTool {
    ctx: Arc<ToolContext>,
}

impl ManageConnectionTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }

    fn health_json(&self) -> Value {
        serde_json::to_value(self.ctx.supervisor.health_status())
            .unwrap_or(Value::Null)
    }

    fn diagnose(&self) -> Value {
        let health = self.ctx.supervisor.health_status();
        let config = self.ctx.supervisor.config();
        let mut suggestions: Vec<&str> = Vec::new();

        if !health.state.is_connected() {
            suggestions.push("Verify the core is reachable and the host/port are correct");
        }
        if health.consecutive_failures > 0 {
            suggestions.push("Recent attempts failed; check credentials and network path");
        }
        if health.circuit_breaker_state != crate::qrwc::BreakerState::Closed {
            suggestions.push("Circuit breaker is tripped; wait for the open timeout or reconnect");
        }
        if suggestions.is_empty() {
            suggestions.push("Connection is healthy");
        }

        serde_json::json!({
            "health": self.health_json(),
            "endpoint": {
                "host": config.host,
                "port": config.port,
                "secure": config.secure,
            },
            "autoReconnect": config.enable_auto_reconnect,
            "suggestions": suggestions,
        })
    }
}

#[async_trait]
impl Tool for ManageConnectionTool {
    fn name(&self) -> &'static str {
        "manage_connection"
    }

    fn description(&self) -> &'static str {
        "Inspect and drive the core connection (status/connect/disconnect/reconnect/history/diagnose)"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let action = require_string(params, "action")?;
        const ACTIONS: [&str; 6] = [
            "status",
            "connect",
            "disconnect",
            "reconnect",
            "history",
            "diagnose",
        ];
        if !ACTIONS.contains(&action.as_str()) {
            return Err(QsysError::invalid_params(format!(
                "Unknown action: {action}"
            )));
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let action = require_string(&params, "action")?;
        let data = match action.as_str() {
            "status" => self.health_json(),
            "connect" => match self.ctx.supervisor.connect().await {
                Ok(()) => self.health_json(),
                Err(e) => {
                    return Ok(serde_json::json!({
                        "success": false,
                        "action": action,
                        "data": { "error": e.message, "code": e.code.as_str() },
                    }))
                }
            },
            "disconnect" => {
                self.ctx.supervisor.disconnect().await;
                self.health_json()
            }
            "reconnect" => {
                self.ctx.supervisor.disconnect().await;
                match self.ctx.supervisor.connect().await {
                    Ok(()) => self.health_json(),
                    Err(e) => {
                        return Ok(serde_json::json!({
                            "success": false,
                            "action": action,
                            "data": { "error": e.message, "code": e.code.as_str() },
                        }))
                    }
                }
            }
            "history" => serde_json::json!({
                "entries": self.ctx.supervisor.history(),
            }),
            "diagnose" => self.diagnose(),
            // validate() already rejected anything else.
            other => {
                return Err(QsysError::invalid_params(format!("Unknown action: {other}")))
            }
        };

        Ok(serde_json::json!({
            "success": true,
            "action": action,
            "data": data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::{disconnected_context, scripted_context};
    use std::time::Duration;

    #[tokio::test]
    async fn test_disconnected_status_payload() {
        let ctx = disconnected_context(Duration::from_secs(1));
        let tool = QueryCoreStatusTool::new(&ctx);

        let result = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(result["connectionStatus"]["connected"], false);
        assert_eq!(result["systemHealth"]["status"], "disconnected");
        assert_eq!(result["_metadata"]["error"], "Q-SYS Core not connected");
    }

    #[tokio::test]
    async fn test_status_fallback_buckets_components() {
        let ctx = scripted_context(
            vec![
                // Status.Get fails.
                Err(QsysError::command("no status service")),
                // Component scan.
                Ok(serde_json::json!([
                    { "Name": "Core Status", "Type": "status", "Properties": [] },
                    { "Name": "Mic Status", "Type": "status", "Properties": [] },
                    { "Name": "Room Status", "Type": "status", "Properties": [] },
                    { "Name": "Mixer", "Type": "mixer", "Properties": [] },
                ])),
                // Controls for the three status components, in order.
                Ok(serde_json::json!({ "Name": "Core Status", "Controls": [
                    { "Name": "cpu", "Value": 12.5, "String": "12.5%", "Type": "number" }
                ]})),
                Ok(serde_json::json!({ "Name": "Mic Status", "Controls": [
                    { "Name": "online", "Value": true, "String": "true", "Type": "boolean" }
                ]})),
                Ok(serde_json::json!({ "Name": "Room Status", "Controls": [
                    { "Name": "occupied", "Value": false, "String": "false", "Type": "boolean" }
                ]})),
            ],
            Duration::from_secs(1),
        );
        let tool = QueryCoreStatusTool::new(&ctx);

        let result = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(result["_metadata"]["source"], "component-fallback");
        assert!(result["CoreStatus"]["Core Status"]["cpu"]["value"].is_number());
        assert!(result["PeripheralStatus"].get("Mic Status").is_some());
        assert!(result["GeneralStatus"].get("Room Status").is_some());
    }

    #[tokio::test]
    async fn test_manage_connection_status_while_down() {
        let ctx = disconnected_context(Duration::from_secs(1));
        let tool = ManageConnectionTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "action": "status" }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["action"], "status");
        assert_eq!(result["data"]["isHealthy"], false);
    }

    #[tokio::test]
    async fn test_manage_connection_diagnose() {
        let ctx = disconnected_context(Duration::from_secs(1));
        let tool = ManageConnectionTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "action": "diagnose" }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert!(!result["data"]["suggestions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_action_validation() {
        let ctx = disconnected_context(Duration::from_secs(1));
        let tool = ManageConnectionTool::new(&ctx);
        assert!(tool.validate(&serde_json::json!({ "action": "status" })).is_ok());
        assert!(tool.validate(&serde_json::json!({ "action": "dance" })).is_err());
        assert!(tool.validate(&serde_json::json!({})).is_err());
    }
}
