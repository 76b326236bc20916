//! Control read/write tools.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::error::{QsysError, Result};

use super::dispatcher::{require_string_array, Tool, ToolContext};

/// `get_control_values`: read current values for named controls.
pub struct GetControlValuesTool {
    ctx: Arc<ToolContext>,
}

impl GetControlValuesTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for GetControlValuesTool {
    fn name(&self) -> &'static str {
        "get_control_values"
    }

    fn description(&self) -> &'static str {
        "Read current values of the named controls"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let controls = require_string_array(params, "controls")?;
        if controls.is_empty() {
            return Err(QsysError::invalid_params("controls must not be empty"));
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let controls = require_string_array(&params, "controls")?;
        let result = self
            .ctx
            .adapter
            .send_command(
                "Control.GetValues",
                serde_json::json!({ "Names": controls }),
            )
            .await?;

        let timestamp = Utc::now().to_rfc3339();
        let entries: Vec<Value> = result
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.get("Name").cloned().unwrap_or(Value::Null),
                    "value": entry.get("Value").cloned().unwrap_or(Value::Null),
                    "string": entry.get("String").cloned().unwrap_or(Value::Null),
                    "position": entry.get("Position").cloned().unwrap_or(Value::Null),
                    "timestamp": timestamp,
                })
            })
            .collect();
        Ok(Value::Array(entries))
    }
}

/// `set_control_values`: write values, one result per control.
pub struct SetControlValuesTool {
    ctx: Arc<ToolContext>,
}

impl SetControlValuesTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for SetControlValuesTool {
    fn name(&self) -> &'static str {
        "set_control_values"
    }

    fn description(&self) -> &'static str {
        "Set control values, with optional ramp, returning per-control results"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        let controls = params
            .get("controls")
            .and_then(Value::as_array)
            .ok_or_else(|| QsysError::invalid_params("Missing required array: controls"))?;
        if controls.is_empty() {
            return Err(QsysError::invalid_params("controls must not be empty"));
        }
        for entry in controls {
            if entry.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
                return Err(QsysError::invalid_params(
                    "Every control entry requires a non-empty name",
                ));
            }
            if entry.get("value").is_none() {
                return Err(QsysError::invalid_params(
                    "Every control entry requires a value",
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let entries = params
            .get("controls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Echo back the requested value per control, by input order.
        let requested: Vec<(String, Value)> = entries
            .iter()
            .map(|e| {
                (
                    e.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                    e.get("value").cloned().unwrap_or(Value::Null),
                )
            })
            .collect();

        let wire_controls: Vec<Value> = entries
            .iter()
            .map(|e| {
                let mut control = serde_json::json!({
                    "Name": e.get("name").cloned().unwrap_or(Value::Null),
                    "Value": e.get("value").cloned().unwrap_or(Value::Null),
                });
                if let Some(ramp) = e.get("ramp") {
                    control["Ramp"] = ramp.clone();
                }
                control
            })
            .collect();

        let result = self
            .ctx
            .adapter
            .send_command(
                "Control.SetValues",
                serde_json::json!({ "Controls": wire_controls }),
            )
            .await?;

        let outcomes = result.as_array().cloned().unwrap_or_default();
        let shaped: Vec<Value> = requested
            .into_iter()
            .enumerate()
            .map(|(i, (name, value))| {
                let outcome = outcomes.get(i);
                let success = outcome
                    .and_then(|o| o.get("Result"))
                    .and_then(Value::as_str)
                    .is_some_and(|r| r == "Success");
                let mut entry = serde_json::json!({
                    "name": name,
                    "value": value,
                    "success": success,
                });
                if let Some(error) = outcome.and_then(|o| o.get("Error")) {
                    entry["error"] = error.clone();
                }
                entry
            })
            .collect();
        Ok(Value::Array(shaped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::scripted_context;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_shapes_partial_results() {
        let ctx = scripted_context(
            vec![
                Ok(Value::Bool(true)),
                Err(QsysError::command("Unknown control")),
            ],
            Duration::from_secs(1),
        );
        let tool = SetControlValuesTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "controls": [
                { "name": "A.gain", "value": -3.0 },
                { "name": "B.gain", "value": -4.0 },
            ]}))
            .await
            .unwrap();

        let entries = result.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["success"], true);
        assert_eq!(entries[0]["name"], "A.gain");
        assert_eq!(entries[1]["success"], false);
        assert!(entries[1]["error"].is_string());
    }

    #[tokio::test]
    async fn test_get_values_shape() {
        let ctx = scripted_context(
            vec![Ok(serde_json::json!([
                { "Name": "Mixer.gain", "Value": -6.0, "String": "-6dB", "Position": 0.7 }
            ]))],
            Duration::from_secs(1),
        );
        let tool = GetControlValuesTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({ "controls": ["Mixer.gain"] }))
            .await
            .unwrap();
        assert_eq!(result[0]["name"], "Mixer.gain");
        assert_eq!(result[0]["value"], -6.0);
        assert_eq!(result[0]["position"], 0.7);
        assert!(result[0]["timestamp"].is_string());
    }

    #[test]
    fn test_validation() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = SetControlValuesTool::new(&ctx);
        assert!(tool.validate(&serde_json::json!({ "controls": [] })).is_err());
        assert!(tool
            .validate(&serde_json::json!({ "controls": [{ "name": "", "value": 1 }] }))
            .is_err());
        assert!(tool
            .validate(&serde_json::json!({ "controls": [{ "name": "A.g" }] }))
            .is_err());
        assert!(tool
            .validate(&serde_json::json!({ "controls": [{ "name": "A.g", "value": 1 }] }))
            .is_ok());
    }
}
