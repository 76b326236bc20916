//! Component discovery tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::{QsysError, Result};

use super::dispatcher::{optional_string, require_object, require_string, Tool, ToolContext};

/// `list_components`: enumerate components in the running design.
pub struct ListComponentsTool {
    ctx: Arc<ToolContext>,
}

impl ListComponentsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for ListComponentsTool {
    fn name(&self) -> &'static str {
        "list_components"
    }

    fn description(&self) -> &'static str {
        "List components in the running Q-SYS design"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let name_filter = optional_string(&params, "nameFilter");
        let include_properties = params
            .get("includeProperties")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let result = self
            .ctx
            .adapter
            .send_command("Component.GetComponents", Value::Null)
            .await?;
        let mut components = result.as_array().cloned().unwrap_or_default();

        if let Some(filter) = name_filter {
            // A valid regex filters by match, anything else by substring.
            let matcher: Box<dyn Fn(&str) -> bool> = match regex::Regex::new(&filter) {
                Ok(re) => Box::new(move |name: &str| re.is_match(name)),
                Err(_) => Box::new(move |name: &str| name.contains(&filter)),
            };
            components.retain(|c| {
                c.get("Name").and_then(Value::as_str).is_some_and(|n| matcher(n))
            });
        }

        if !include_properties {
            for component in components.iter_mut() {
                if let Some(obj) = component.as_object_mut() {
                    obj.remove("Properties");
                }
            }
        }

        Ok(Value::Array(components))
    }
}

/// `qsys_component_get`: read specific controls on one component.
pub struct ComponentGetTool {
    ctx: Arc<ToolContext>,
}

impl ComponentGetTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for ComponentGetTool {
    fn name(&self) -> &'static str {
        "qsys_component_get"
    }

    fn description(&self) -> &'static str {
        "Get specific control values from one component"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "component")?;
        super::dispatcher::require_string_array(params, "controls")?;
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let component = require_string(&params, "component")?;
        let controls = super::dispatcher::require_string_array(&params, "controls")?;

        let wire_controls: Vec<Value> = controls
            .iter()
            .map(|name| serde_json::json!({ "Name": name }))
            .collect();
        self.ctx
            .adapter
            .send_command(
                "Component.Get",
                serde_json::json!({ "Name": component, "Controls": wire_controls }),
            )
            .await
    }
}

/// `list_controls`: enumerate controls, optionally filtered by type.
pub struct ListControlsTool {
    ctx: Arc<ToolContext>,
}

impl ListControlsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }

    /// Fetch and shape the controls of one component.
    async fn controls_of(&self, component: &str, include_metadata: bool) -> Result<Vec<Value>> {
        let result = self
            .ctx
            .adapter
            .send_command(
                "Component.GetControls",
                serde_json::json!({ "Name": component }),
            )
            .await?;

        let entries = result
            .get("Controls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let control = entry.get("Name")?.as_str()?.to_string();
                let mut shaped = serde_json::json!({
                    "name": format!("{component}.{control}"),
                    "component": component,
                    "controlName": control,
                    "type": entry.get("Type").cloned().unwrap_or(Value::Null),
                    "value": entry.get("Value").cloned().unwrap_or(Value::Null),
                    "string": entry.get("String").cloned().unwrap_or(Value::Null),
                    "direction": entry.get("Direction").cloned().unwrap_or(Value::Null),
                });
                if include_metadata {
                    shaped["metadata"] = serde_json::json!({
                        "min": entry.get("ValueMin").cloned().unwrap_or(Value::Null),
                        "max": entry.get("ValueMax").cloned().unwrap_or(Value::Null),
                    });
                }
                Some(shaped)
            })
            .collect())
    }
}

#[async_trait]
impl Tool for ListControlsTool {
    fn name(&self) -> &'static str {
        "list_controls"
    }

    fn description(&self) -> &'static str {
        "List controls, for one component or design-wide, with optional type filter"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)?;
        if let Some(control_type) = params.get("controlType").and_then(Value::as_str) {
            const KNOWN: [&str; 7] = [
                "gain", "mute", "position", "number", "boolean", "string", "all",
            ];
            if !KNOWN.contains(&control_type) {
                return Err(QsysError::invalid_params(format!(
                    "Unknown controlType: {control_type}"
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let component = optional_string(&params, "component");
        let control_type = optional_string(&params, "controlType").filter(|t| t != "all");
        let include_metadata = params
            .get("includeMetadata")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let component_names: Vec<String> = match component {
            Some(name) => vec![name],
            None => {
                let result = self
                    .ctx
                    .adapter
                    .send_command("Component.GetComponents", Value::Null)
                    .await?;
                result
                    .as_array()
                    .map(|components| {
                        components
                            .iter()
                            .filter_map(|c| c.get("Name").and_then(Value::as_str))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };

        let mut controls = Vec::new();
        for name in &component_names {
            controls.extend(self.controls_of(name, include_metadata).await?);
        }

        if let Some(filter) = control_type {
            controls.retain(|c| {
                c.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.eq_ignore_ascii_case(&filter))
            });
        }

        Ok(Value::Array(controls))
    }
}

/// `qsys_get_all_controls`: bulk control inventory with a summary mode.
pub struct GetAllControlsTool {
    ctx: Arc<ToolContext>,
}

impl GetAllControlsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for GetAllControlsTool {
    fn name(&self) -> &'static str {
        "qsys_get_all_controls"
    }

    fn description(&self) -> &'static str {
        "Inventory every control in the design (summary or full)"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)?;
        if let Some(mode) = params.get("mode").and_then(Value::as_str) {
            if !["summary", "full"].contains(&mode) {
                return Err(QsysError::invalid_params(format!("Unknown mode: {mode}")));
            }
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let mode = optional_string(&params, "mode").unwrap_or_else(|| String::from("summary"));
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(1000) as usize;

        let result = self
            .ctx
            .adapter
            .send_command("Component.GetComponents", Value::Null)
            .await?;
        let component_names: Vec<String> = result
            .as_array()
            .map(|components| {
                components
                    .iter()
                    .filter_map(|c| c.get("Name").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut summaries = Vec::new();
        let mut all_controls = Vec::new();
        let mut total = 0usize;

        for name in &component_names {
            let controls = self
                .ctx
                .adapter
                .send_command(
                    "Component.GetControls",
                    serde_json::json!({ "Name": name }),
                )
                .await?;
            let entries = controls
                .get("Controls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            total += entries.len();
            summaries.push(serde_json::json!({
                "name": name,
                "controlCount": entries.len(),
            }));
            if mode == "full" {
                for entry in entries {
                    if all_controls.len() >= limit {
                        break;
                    }
                    let control = entry
                        .get("Name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    all_controls.push(serde_json::json!({
                        "name": format!("{name}.{control}"),
                        "value": entry.get("Value").cloned().unwrap_or(Value::Null),
                        "string": entry.get("String").cloned().unwrap_or(Value::Null),
                        "type": entry.get("Type").cloned().unwrap_or(Value::Null),
                    }));
                }
            }
        }

        let mut out = serde_json::json!({
            "totalComponents": component_names.len(),
            "totalControls": total,
            "componentSummaries": summaries,
        });
        if mode == "full" {
            let truncated = total > all_controls.len();
            out["controls"] = Value::Array(all_controls);
            out["truncated"] = Value::Bool(truncated);
        }
        Ok(out)
    }
}
