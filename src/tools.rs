//! Tool surface over the gateway core.
//!
//! The dispatcher owns a fixed catalogue: component discovery, control
//! read/write, core status, raw command passthrough, change-group
//! lifecycle, connection management, event-history queries and an echo
//! testing tool.

pub mod changegroup_tools;
pub mod component_tools;
pub mod control_tools;
pub mod dispatcher;
pub mod monitor_tools;
pub mod raw;
pub mod status_tools;

use std::sync::Arc;

pub use dispatcher::{Tool, ToolContent, ToolContext, ToolDispatcher, ToolResult};

/// The fixed tool catalogue.
pub(crate) fn catalogue(ctx: &Arc<ToolContext>) -> Vec<Arc<dyn Tool>> {
    vec![
        component_tools::ListComponentsTool::new(ctx),
        component_tools::ComponentGetTool::new(ctx),
        component_tools::ListControlsTool::new(ctx),
        component_tools::GetAllControlsTool::new(ctx),
        control_tools::GetControlValuesTool::new(ctx),
        control_tools::SetControlValuesTool::new(ctx),
        status_tools::QueryCoreStatusTool::new(ctx),
        status_tools::ManageConnectionTool::new(ctx),
        changegroup_tools::CreateChangeGroupTool::new(ctx),
        changegroup_tools::AddControlsTool::new(ctx),
        changegroup_tools::RemoveControlsTool::new(ctx),
        changegroup_tools::ClearChangeGroupTool::new(ctx),
        changegroup_tools::ListChangeGroupsTool::new(ctx),
        changegroup_tools::PollChangeGroupTool::new(ctx),
        changegroup_tools::DestroyChangeGroupTool::new(ctx),
        monitor_tools::QueryChangeEventsTool::new(ctx),
        raw::SendRawCommandTool::new(ctx),
        raw::EchoTool::new(),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ConnectionConfig};
    use crate::core::component::ComponentIndex;
    use crate::core::error::Result;
    use crate::core::events::signal_channel;
    use crate::monitor::{RingCache, RingConfig};
    use crate::qrwc::adapter::{CommandAdapter, FrameTransport, SendOptions};
    use crate::qrwc::breaker::CircuitBreaker;
    use crate::qrwc::supervisor::ConnectionSupervisor;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that reports connected and pops canned responses.
    /// An exhausted script answers with an empty array so background
    /// pollers stay quiet.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<Value>>>,
        breaker: Arc<CircuitBreaker>,
    }

    #[async_trait]
    impl FrameTransport for ScriptedTransport {
        async fn send_frame(
            &self,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> Result<Value> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(serde_json::json!([])))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn breaker(&self) -> &Arc<CircuitBreaker> {
            &self.breaker
        }
    }

    fn build_context(
        transport: Arc<dyn FrameTransport>,
        tool_timeout: Duration,
    ) -> Arc<ToolContext> {
        let adapter = Arc::new(
            CommandAdapter::new(transport, Arc::new(ComponentIndex::new())).with_defaults(
                SendOptions {
                    max_retries: 0,
                    retry_delay: Duration::from_millis(1),
                    timeout: Duration::from_secs(1),
                },
            ),
        );
        let supervisor =
            ConnectionSupervisor::new(ConnectionConfig::default(), BreakerConfig::default());
        let (signals, _) = signal_channel();
        let registry = crate::changegroup::ChangeGroupRegistry::new(
            Arc::clone(&adapter) as Arc<dyn crate::qrwc::adapter::ControlReader>,
            signals,
        );
        adapter.attach_change_groups(
            Arc::clone(&registry) as Arc<dyn crate::qrwc::adapter::ChangeGroupHandler>
        );

        Arc::new(ToolContext {
            adapter,
            supervisor,
            registry,
            ring: Some(RingCache::new(RingConfig::default())),
            store: None,
            monitoring_enabled: false,
            tool_timeout,
        })
    }

    /// Context whose transport is up, scripted with `responses`.
    pub(crate) fn scripted_context(
        responses: Vec<Result<Value>>,
        tool_timeout: Duration,
    ) -> Arc<ToolContext> {
        build_context(
            Arc::new(ScriptedTransport {
                responses: Mutex::new(responses.into()),
                breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            }),
            tool_timeout,
        )
    }

    /// Context whose transport is down (a real, unconnected supervisor).
    pub(crate) fn disconnected_context(tool_timeout: Duration) -> Arc<ToolContext> {
        let supervisor =
            ConnectionSupervisor::new(ConnectionConfig::default(), BreakerConfig::default());
        build_context(
            Arc::clone(&supervisor) as Arc<dyn FrameTransport>,
            tool_timeout,
        )
    }
}
