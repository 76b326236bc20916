//! # Q-SYS Control Gateway (qgw)
//!
//! A control-plane gateway for Q-SYS audio DSP cores, speaking the
//! QRWC dialect (JSON-RPC 2.0 over WebSocket) with a fixed tool surface
//! on top and an event recorder underneath.
//!
//! ## Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Wire | [`qrwc::wire`] | One socket, id-correlated frames |
//! | Supervisor | [`qrwc::supervisor`] | Reconnect, circuit breaker, health |
//! | Adapter | [`qrwc::adapter`] | Semantic commands, validation, retry |
//! | Change groups | [`changegroup`] | Named subscriptions, auto-poll diffing |
//! | Recorder | [`monitor`] | Ring cache + day-rotated SQLite store |
//! | Tools | [`tools`] | Validated, time-boxed tool dispatch |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qgw::prelude::*;
//!
//! let config = GatewayConfig::for_host("192.168.1.50");
//! let gateway = Gateway::new(config)?;
//! gateway.start().await?;
//!
//! let result = gateway
//!     .call_tool("get_control_values", serde_json::json!({
//!         "controls": ["Main Mixer.gain"]
//!     }))
//!     .await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod changegroup;
pub mod config;
pub mod core;
pub mod monitor;
pub mod qrwc;
pub mod runtime;
pub mod tools;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::changegroup::{ChangeGroupRegistry, GroupInfo};
    pub use crate::config::{ConnectionConfig, GatewayConfig, MonitoringConfig};
    pub use crate::core::{
        control::{ControlPath, ControlType, ControlValue},
        error::{ErrorCode, QsysError, Result},
        events::{ChangeEvent, ChangeGroupSignal, EventSource},
    };
    pub use crate::monitor::{EventQuery, EventStore, RingCache};
    pub use crate::qrwc::{CommandAdapter, ConnectionState, ConnectionSupervisor};
    pub use crate::runtime::Gateway;
    pub use crate::tools::{ToolDispatcher, ToolResult};
}

// Re-export core types at crate root for convenience
pub use crate::config::GatewayConfig;
pub use crate::core::control::{ControlPath, ControlType, ControlValue};
pub use crate::core::error::{ErrorCode, QsysError, Result};
pub use crate::core::events::{ChangeEvent, EventSource};
pub use crate::qrwc::{ConnectionState, HealthStatus};
pub use crate::runtime::Gateway;
