//! QRWC protocol layer.
//!
//! Three pieces: the wire client (one socket, one demultiplexing task),
//! the connection supervisor (lifecycle, backoff reconnect, circuit
//! breaker, health), and the command adapter (semantic commands,
//! validation, retry).

pub mod adapter;
pub mod breaker;
pub mod frame;
pub mod supervisor;
pub mod wire;

pub use adapter::{
    ChangeGroupHandler, CommandAdapter, ControlReader, ControlReading, FrameTransport, SendOptions,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use frame::{FrameError, InboundFrame, RawFrame, RequestFrame};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, HealthStatus, HistoryEntry, SupervisorEvent,
};
pub use wire::{WireClient, WireEvent};
