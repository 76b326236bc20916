//! Change-group lifecycle tools.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::changegroup::{validate_rate, DEFAULT_POLL_RATE};
use crate::core::error::{QsysError, Result};

use super::dispatcher::{
    optional_string_array, require_object, require_string, Tool, ToolContext,
};

fn frequency_label(rate_seconds: f64) -> String {
    let hz = 1.0 / rate_seconds;
    if hz >= 1.0 {
        format!("{}Hz", hz.round() as i64)
    } else {
        format!("{:.2}Hz", hz)
    }
}

/// `create_change_group`: create (or merge into) a group and start
/// polling it immediately.
pub struct CreateChangeGroupTool {
    ctx: Arc<ToolContext>,
}

impl CreateChangeGroupTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for CreateChangeGroupTool {
    fn name(&self) -> &'static str {
        "create_change_group"
    }

    fn description(&self) -> &'static str {
        "Create a change group and begin auto-polling it"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId")?;
        optional_string_array(params, "controls")?;
        if let Some(rate) = params.get("pollRate") {
            let rate = rate
                .as_f64()
                .ok_or_else(|| QsysError::invalid_params("pollRate must be a number"))?;
            validate_rate(rate).map_err(|e| QsysError::invalid_params(e.message))?;
        }
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        let controls = optional_string_array(&params, "controls")?.unwrap_or_default();
        let rate = params
            .get("pollRate")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_POLL_RATE);

        let outcome = self.ctx.registry.add_controls(&group_id, &controls)?;
        let applied = self.ctx.registry.auto_poll(&group_id, Some(rate))?;

        let mut out = serde_json::json!({
            "success": true,
            "groupId": group_id,
            "pollRate": applied,
            "frequency": frequency_label(applied),
            "recording": self.ctx.monitoring_enabled,
            "controlCount": outcome.total,
        });
        if outcome.existed {
            out["warning"] = Value::String(format!(
                "Change group '{group_id}' already existed; kept its {} controls",
                outcome.total
            ));
        }
        if !outcome.skipped_invalid.is_empty() {
            out["skippedControls"] = serde_json::json!(outcome.skipped_invalid);
        }
        Ok(out)
    }
}

/// `add_controls_to_change_group`.
pub struct AddControlsTool {
    ctx: Arc<ToolContext>,
}

impl AddControlsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for AddControlsTool {
    fn name(&self) -> &'static str {
        "add_controls_to_change_group"
    }

    fn description(&self) -> &'static str {
        "Add controls to an existing change group (set union)"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId")?;
        super::dispatcher::require_string_array(params, "controls")?;
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        let controls = super::dispatcher::require_string_array(&params, "controls")?;
        let outcome = self.ctx.registry.add_controls(&group_id, &controls)?;

        let mut out = serde_json::json!({
            "success": true,
            "groupId": group_id,
            "addedCount": outcome.added,
            "controlCount": outcome.total,
        });
        if !outcome.skipped_invalid.is_empty() {
            out["skippedControls"] = serde_json::json!(outcome.skipped_invalid);
        }
        Ok(out)
    }
}

/// `remove_controls_from_change_group`.
pub struct RemoveControlsTool {
    ctx: Arc<ToolContext>,
}

impl RemoveControlsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for RemoveControlsTool {
    fn name(&self) -> &'static str {
        "remove_controls_from_change_group"
    }

    fn description(&self) -> &'static str {
        "Remove controls from a change group"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId")?;
        super::dispatcher::require_string_array(params, "controls")?;
        Ok(())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        let controls = super::dispatcher::require_string_array(&params, "controls")?;
        let removed = self.ctx.registry.remove_controls(&group_id, &controls)?;
        Ok(serde_json::json!({
            "success": true,
            "groupId": group_id,
            "removedCount": removed,
        }))
    }
}

/// `clear_change_group`.
pub struct ClearChangeGroupTool {
    ctx: Arc<ToolContext>,
}

impl ClearChangeGroupTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for ClearChangeGroupTool {
    fn name(&self) -> &'static str {
        "clear_change_group"
    }

    fn description(&self) -> &'static str {
        "Remove every control from a change group, keeping the group"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        self.ctx.registry.clear(&group_id)?;
        Ok(serde_json::json!({
            "success": true,
            "groupId": group_id,
            "message": "All controls removed; the group remains",
        }))
    }
}

/// `list_change_groups`.
pub struct ListChangeGroupsTool {
    ctx: Arc<ToolContext>,
}

impl ListChangeGroupsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for ListChangeGroupsTool {
    fn name(&self) -> &'static str {
        "list_change_groups"
    }

    fn description(&self) -> &'static str {
        "List change groups with their control counts and poll state"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)
    }

    async fn execute(&self, _params: Value) -> Result<Value> {
        let groups = self.ctx.registry.list();
        Ok(serde_json::json!({
            "success": true,
            "totalGroups": groups.len(),
            "recording": self.ctx.monitoring_enabled,
            "groups": groups,
        }))
    }
}

/// `poll_change_group`: manual diff against the last snapshot.
pub struct PollChangeGroupTool {
    ctx: Arc<ToolContext>,
}

impl PollChangeGroupTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for PollChangeGroupTool {
    fn name(&self) -> &'static str {
        "poll_change_group"
    }

    fn description(&self) -> &'static str {
        "Poll a change group now; returns only values that changed"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        let changes = self.ctx.registry.poll(&group_id).await?;
        let entries: Vec<Value> = changes
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.control_path,
                    "value": c.value.to_wire(),
                    "string": c.string_value,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "groupId": group_id,
            "changeCount": entries.len(),
            "changes": entries,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// `destroy_change_group`.
pub struct DestroyChangeGroupTool {
    ctx: Arc<ToolContext>,
}

impl DestroyChangeGroupTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for DestroyChangeGroupTool {
    fn name(&self) -> &'static str {
        "destroy_change_group"
    }

    fn description(&self) -> &'static str {
        "Destroy a change group and stop its polling; recorded history survives"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_string(params, "groupId").map(|_| ())
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let group_id = require_string(&params, "groupId")?;
        self.ctx.registry.destroy(&group_id)?;
        Ok(serde_json::json!({
            "success": true,
            "groupId": group_id,
            "message": "Change group destroyed; recorded events remain queryable",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::scripted_context;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_reports_frequency_and_recording() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = CreateChangeGroupTool::new(&ctx);

        let result = tool
            .execute(serde_json::json!({
                "groupId": "g",
                "controls": ["A.gain"],
                "pollRate": 0.03,
            }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["pollRate"], 0.03);
        assert_eq!(result["frequency"], "33Hz");
        assert_eq!(result["recording"], false);
        assert!(result.get("warning").is_none());

        ctx.registry.destroy("g").unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_create_preserves_controls() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = CreateChangeGroupTool::new(&ctx);

        tool.execute(serde_json::json!({
            "groupId": "g",
            "controls": ["A.gain", "A.mute"],
            "pollRate": 1.0,
        }))
        .await
        .unwrap();

        let result = tool
            .execute(serde_json::json!({ "groupId": "g", "pollRate": 1.0 }))
            .await
            .unwrap();
        assert!(result["warning"].as_str().unwrap().contains("already existed"));
        assert_eq!(result["controlCount"], 2);

        ctx.registry.destroy("g").unwrap();
    }

    #[test]
    fn test_poll_rate_validation() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = CreateChangeGroupTool::new(&ctx);
        assert!(tool
            .validate(&serde_json::json!({ "groupId": "g", "pollRate": 0.02 }))
            .is_err());
        assert!(tool
            .validate(&serde_json::json!({ "groupId": "g", "pollRate": 3600.1 }))
            .is_err());
        assert!(tool
            .validate(&serde_json::json!({ "groupId": "g", "pollRate": 0.03 }))
            .is_ok());
        assert!(tool
            .validate(&serde_json::json!({ "groupId": "g", "pollRate": 3600.0 }))
            .is_ok());
    }

    #[tokio::test]
    async fn test_frequency_labels() {
        assert_eq!(frequency_label(0.03), "33Hz");
        assert_eq!(frequency_label(1.0), "1Hz");
        assert_eq!(frequency_label(2.0), "0.50Hz");
    }

    #[tokio::test]
    async fn test_list_and_destroy() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        ctx.registry.add_controls("g1", &["A.gain".into()]).unwrap();

        let list_tool = ListChangeGroupsTool::new(&ctx);
        let result = list_tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(result["totalGroups"], 1);
        assert_eq!(result["groups"][0]["id"], "g1");

        let destroy_tool = DestroyChangeGroupTool::new(&ctx);
        let result = destroy_tool
            .execute(serde_json::json!({ "groupId": "g1" }))
            .await
            .unwrap();
        assert_eq!(result["success"], true);

        let result = list_tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(result["totalGroups"], 0);
    }
}
