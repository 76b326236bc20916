//! Gateway runtime: wires the layers together and owns shutdown.

use std::sync::Arc;
use std::time::Duration;

use crate::changegroup::ChangeGroupRegistry;
use crate::config::GatewayConfig;
use crate::core::component::ComponentIndex;
use crate::core::error::Result;
use crate::core::events::{signal_channel, SignalReceiver, SignalSender};
use crate::monitor::{EventStore, RingCache, RingConfig};
use crate::qrwc::adapter::{ChangeGroupHandler, CommandAdapter, ControlReader, FrameTransport};
use crate::qrwc::supervisor::ConnectionSupervisor;
use crate::tools::{ToolContext, ToolDispatcher, ToolResult};

/// How long shutdown may take before the caller should give up and
/// exit non-zero.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// The assembled gateway.
///
/// Construction wires everything but touches no network; call
/// [`start`](Self::start) to connect.
pub struct Gateway {
    config: GatewayConfig,
    supervisor: Arc<ConnectionSupervisor>,
    adapter: Arc<CommandAdapter>,
    registry: Arc<ChangeGroupRegistry>,
    ring: Arc<RingCache>,
    store: Option<Arc<EventStore>>,
    dispatcher: ToolDispatcher,
    signals: SignalSender,
}

impl Gateway {
    /// Assemble a gateway from configuration.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let supervisor =
            ConnectionSupervisor::new(config.connection.clone(), config.breaker);
        let index = Arc::new(ComponentIndex::new());
        let adapter = Arc::new(CommandAdapter::new(
            Arc::clone(&supervisor) as Arc<dyn FrameTransport>,
            index,
        ));

        let (signals, _) = signal_channel();
        let registry = ChangeGroupRegistry::new(
            Arc::clone(&adapter) as Arc<dyn ControlReader>,
            signals.clone(),
        );
        adapter.attach_change_groups(Arc::clone(&registry) as Arc<dyn ChangeGroupHandler>);

        // The ring always runs; it backs recent-history queries cheaply.
        let ring = RingCache::new(RingConfig::default());
        let _ = ring.attach(signals.subscribe());

        let store = if config.monitoring.enabled {
            let store = EventStore::open(config.monitoring.clone())?;
            let _ = store.attach(signals.subscribe());
            tracing::info!(
                db_path = %config.monitoring.db_path.display(),
                "Event recording enabled"
            );
            Some(store)
        } else {
            None
        };

        let ctx = Arc::new(ToolContext {
            adapter: Arc::clone(&adapter),
            supervisor: Arc::clone(&supervisor),
            registry: Arc::clone(&registry),
            ring: Some(Arc::clone(&ring)),
            store: store.clone(),
            monitoring_enabled: config.monitoring.enabled,
            tool_timeout: config.tool_timeout(),
        });
        let dispatcher = ToolDispatcher::new(ctx);

        Ok(Self {
            config,
            supervisor,
            adapter,
            registry,
            ring,
            store,
            dispatcher,
            signals,
        })
    }

    /// Connect to the core.
    ///
    /// A failure here still leaves auto-reconnect armed when enabled;
    /// callers may choose to keep running.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            host = %self.config.connection.host,
            port = self.config.connection.port,
            "Connecting to Q-SYS core"
        );
        self.supervisor.connect().await
    }

    /// Dispatch one tool call.
    pub async fn call_tool(&self, name: &str, params: serde_json::Value) -> ToolResult {
        self.dispatcher.dispatch(name, params).await
    }

    /// Names of every registered tool.
    pub fn tool_names(&self) -> Vec<&'static str> {
        self.dispatcher.tool_names()
    }

    /// Subscribe to change-group signals.
    pub fn subscribe(&self) -> SignalReceiver {
        self.signals.subscribe()
    }

    /// The connection supervisor.
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// The command adapter.
    pub fn adapter(&self) -> &Arc<CommandAdapter> {
        &self.adapter
    }

    /// The change-group registry.
    pub fn registry(&self) -> &Arc<ChangeGroupRegistry> {
        &self.registry
    }

    /// The in-memory event ring.
    pub fn ring(&self) -> &Arc<RingCache> {
        &self.ring
    }

    /// The durable event store, when recording is enabled.
    pub fn store(&self) -> Option<&Arc<EventStore>> {
        self.store.as_ref()
    }

    /// Graceful shutdown: flush and close the event store, destroy
    /// change groups, disconnect the wire. Run this under
    /// [`SHUTDOWN_BUDGET`]; past that, give up and exit non-zero.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down gateway");
        if let Some(store) = &self.store {
            store.flush().await;
            store.close().await;
        }
        self.registry.destroy_all();
        self.supervisor.shutdown().await;
        tracing::info!("Gateway shutdown complete");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.supervisor.state())
            .field("monitoring", &self.config.monitoring.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;

    fn offline_config() -> GatewayConfig {
        GatewayConfig {
            monitoring: MonitoringConfig {
                enabled: false,
                ..MonitoringConfig::default()
            },
            ..GatewayConfig::for_host("127.0.0.1")
        }
    }

    #[tokio::test]
    async fn test_gateway_assembles_offline() {
        let gateway = Gateway::new(offline_config()).unwrap();
        assert!(gateway.tool_names().contains(&"list_components"));
        assert!(gateway.store().is_none());
    }

    #[tokio::test]
    async fn test_tools_usable_before_connect() {
        let gateway = Gateway::new(offline_config()).unwrap();

        let result = gateway
            .call_tool("echo", serde_json::json!({ "message": "hi" }))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.payload()["echo"], "hi");

        // Connection-gated tools answer with a structured error.
        let result = gateway.call_tool("list_components", serde_json::json!({})).await;
        assert!(result.is_error);
        assert_eq!(result.payload()["code"], "QSYS_CONNECTION_FAILED");

        // Status degrades, never errors.
        let result = gateway.call_tool("query_core_status", serde_json::json!({})).await;
        assert!(!result.is_error);
        assert_eq!(result.payload()["systemHealth"]["status"], "disconnected");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_fast() {
        let gateway = Gateway::new(offline_config()).unwrap();
        tokio::time::timeout(SHUTDOWN_BUDGET, gateway.shutdown())
            .await
            .expect("shutdown within budget");
        tokio::time::timeout(SHUTDOWN_BUDGET, gateway.shutdown())
            .await
            .expect("second shutdown within budget");
    }

    #[tokio::test]
    async fn test_monitoring_store_wired_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            monitoring: MonitoringConfig {
                enabled: true,
                db_path: dir.path().join("events"),
                backup_path: dir.path().join("backups"),
                backup_interval_ms: 0,
                ..MonitoringConfig::default()
            },
            ..GatewayConfig::for_host("127.0.0.1")
        };
        let gateway = Gateway::new(config).unwrap();
        assert!(gateway.store().is_some());
        gateway.shutdown().await;
    }
}
