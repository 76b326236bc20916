//! Event history query tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::{QsysError, Result};
use crate::monitor::EventQuery;

use super::dispatcher::{require_object, Tool, ToolContext};

/// `query_change_events`: range/filter queries over recorded change
/// events. Served from the durable store when recording is enabled,
/// falling back to the in-memory ring. Destroyed groups remain
/// queryable; only new events stop.
pub struct QueryChangeEventsTool {
    ctx: Arc<ToolContext>,
}

impl QueryChangeEventsTool {
    pub(crate) fn new(ctx: &Arc<ToolContext>) -> Arc<Self> {
        Arc::new(Self { ctx: Arc::clone(ctx) })
    }
}

#[async_trait]
impl Tool for QueryChangeEventsTool {
    fn name(&self) -> &'static str {
        "query_change_events"
    }

    fn description(&self) -> &'static str {
        "Query recorded control-change events by time range, group and filters"
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_object(params)?;
        serde_json::from_value::<EventQuery>(params.clone())
            .map(|_| ())
            .map_err(|e| QsysError::invalid_params(format!("Invalid query: {e}")))
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let query: EventQuery = serde_json::from_value(params)
            .map_err(|e| QsysError::invalid_params(format!("Invalid query: {e}")))?;

        let (events, source) = if let Some(store) = &self.ctx.store {
            (store.query(query).await?, "store")
        } else if let Some(ring) = &self.ctx.ring {
            (ring.query(&query), "ring")
        } else {
            return Err(QsysError::validation(
                "Event monitoring is not enabled (set EVENT_MONITORING_ENABLED=true)",
            ));
        };

        Ok(serde_json::json!({
            "eventCount": events.len(),
            "source": source,
            "events": events,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::ControlValue;
    use crate::core::events::{ChangeEvent, EventSource};
    use crate::tools::tests::scripted_context;
    use std::time::Duration;

    #[tokio::test]
    async fn test_query_served_from_ring() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let ring = ctx.ring.as_ref().unwrap();
        ring.ingest(ChangeEvent {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            group_id: "g".into(),
            control_path: "A.gain".into(),
            component_name: "A".into(),
            control_name: "gain".into(),
            value: ControlValue::Number(1.0),
            string_value: "1".into(),
            source: EventSource::SdkControlEvent,
        });

        let tool = QueryChangeEventsTool::new(&ctx);
        let result = tool
            .execute(serde_json::json!({ "groupId": "g" }))
            .await
            .unwrap();
        assert_eq!(result["eventCount"], 1);
        assert_eq!(result["source"], "ring");
        assert_eq!(result["events"][0]["controlPath"], "A.gain");
    }

    #[tokio::test]
    async fn test_rejects_malformed_query() {
        let ctx = scripted_context(vec![], Duration::from_secs(1));
        let tool = QueryChangeEventsTool::new(&ctx);
        assert!(tool
            .validate(&serde_json::json!({ "startTime": "not a number" }))
            .is_err());
    }
}
