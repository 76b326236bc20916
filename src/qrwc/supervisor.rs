//! Connection supervisor: owns the wire client lifecycle.
//!
//! The supervisor performs the initial connect, watches the wire client
//! for disconnects, and drives exponential-backoff reconnection. It also
//! owns the circuit breaker and the health counters every other layer
//! reports from.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{BreakerConfig, ConnectionConfig};
use crate::core::error::{QsysError, Result};
use crate::qrwc::breaker::{BreakerState, CircuitBreaker};
use crate::qrwc::wire::{WireClient, WireEvent};

/// Reconnect delays are capped here regardless of attempt count.
const RECONNECT_CEILING: Duration = Duration::from_secs(60);

/// Connection state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket.
    Disconnected = 0,
    /// Connect in progress.
    Connecting = 1,
    /// Socket open and logged on.
    Connected = 2,
    /// Last connect cycle failed terminally.
    Error = 3,
}

impl ConnectionState {
    /// Whether commands can be sent.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Supervisor lifecycle events.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Wire is up.
    Connected,
    /// Wire went down.
    Disconnected {
        /// Close reason.
        reason: String,
    },
    /// A reconnect attempt is starting.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Reconnection gave up.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// Health flipped.
    HealthChanged {
        /// New health verdict.
        healthy: bool,
    },
}

/// A point-in-time health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall verdict.
    pub is_healthy: bool,
    /// When a connect last succeeded.
    pub last_successful_connection: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Connect attempts over the process lifetime.
    pub total_attempts: u64,
    /// Successful connects over the process lifetime.
    pub total_successes: u64,
    /// Millis connected in the current session (0 when down).
    pub uptime_ms: u64,
    /// Connection state.
    pub state: ConnectionState,
    /// Breaker state.
    pub circuit_breaker_state: BreakerState,
}

#[derive(Debug, Default)]
struct HealthCounters {
    last_successful_connection: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    total_attempts: u64,
    total_successes: u64,
    connected_since: Option<Instant>,
    last_healthy: Option<bool>,
}

/// One line of connection history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// What happened (`connected`, `disconnected`, `reconnecting`, ...).
    pub event: String,
    /// Extra detail (close reason, attempt number).
    pub detail: Option<String>,
}

const HISTORY_CAPACITY: usize = 50;

/// Owns the wire client and its lifecycle.
pub struct ConnectionSupervisor {
    config: ConnectionConfig,
    breaker: Arc<CircuitBreaker>,
    state: AtomicU8,
    wire: RwLock<Option<WireClient>>,
    counters: Mutex<HealthCounters>,
    history: Mutex<VecDeque<HistoryEntry>>,
    events: broadcast::Sender<SupervisorEvent>,
    /// Suppresses auto-reconnect after an explicit disconnect.
    manual_disconnect: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Create a supervisor. No connection is attempted until
    /// [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, breaker_config: BreakerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            breaker: Arc::new(CircuitBreaker::new(breaker_config)),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            wire: RwLock::new(None),
            counters: Mutex::new(HealthCounters::default()),
            history: Mutex::new(VecDeque::new()),
            events,
            manual_disconnect: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Connect to the core. On success a watch task is spawned that
    /// drives auto-reconnect for the rest of the supervisor's life.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state().is_connected() {
            return Ok(());
        }
        self.manual_disconnect.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);

        match self.connect_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// One connect attempt: counters, breaker, watch-task spawn.
    fn connect_once<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        {
            let mut counters = self.counters.lock().expect("health lock");
            counters.total_attempts += 1;
        }

        match WireClient::connect(&self.config).await {
            Ok(client) => {
                let mut wire_events = client.subscribe();
                *self.wire.write().await = Some(client);

                {
                    let mut counters = self.counters.lock().expect("health lock");
                    counters.total_successes += 1;
                    counters.consecutive_failures = 0;
                    counters.last_successful_connection = Some(Utc::now());
                    counters.connected_since = Some(Instant::now());
                }
                self.breaker.record_success();
                self.set_state(ConnectionState::Connected);
                self.record_history("connected", None);
                let _ = self.events.send(SupervisorEvent::Connected);
                self.emit_health_change();

                // Watch for the wire going down.
                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = supervisor.cancel.cancelled() => return,
                            event = wire_events.recv() => match event {
                                Ok(WireEvent::Disconnected { reason, .. }) => {
                                    supervisor.handle_disconnect(reason).await;
                                    return;
                                }
                                Ok(_) => continue,
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => return,
                            },
                        }
                    }
                });
                Ok(())
            }
            Err(e) => {
                {
                    let mut counters = self.counters.lock().expect("health lock");
                    counters.consecutive_failures += 1;
                }
                self.breaker.record_failure();
                self.emit_health_change();
                Err(e)
            }
        }
        })
    }

    async fn handle_disconnect(self: &Arc<Self>, reason: String) {
        *self.wire.write().await = None;
        {
            let mut counters = self.counters.lock().expect("health lock");
            counters.connected_since = None;
        }
        self.set_state(ConnectionState::Disconnected);
        self.record_history("disconnected", Some(reason.clone()));
        let _ = self
            .events
            .send(SupervisorEvent::Disconnected { reason: reason.clone() });
        self.emit_health_change();
        tracing::warn!(reason = %reason, "Q-SYS connection lost");

        if self.config.enable_auto_reconnect
            && !self.cancel.is_cancelled()
            && !self.manual_disconnect.load(Ordering::Relaxed)
        {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                supervisor.reconnect_loop().await;
            });
        }
    }

    /// Exponential backoff: attempt `n` waits
    /// `min(reconnect_interval × 2^(n-1), ceiling)`.
    async fn reconnect_loop(self: Arc<Self>) {
        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = backoff_delay(self.config.reconnect_interval(), attempt);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let _ = self.events.send(SupervisorEvent::Reconnecting { attempt });
            self.record_history("reconnecting", Some(format!("attempt {attempt}")));
            self.set_state(ConnectionState::Connecting);

            match self.connect_once().await {
                Ok(()) => {
                    tracing::info!(attempt, "Reconnected to Q-SYS core");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.set_state(ConnectionState::Error);
        let _ = self.events.send(SupervisorEvent::ReconnectFailed {
            attempts: self.config.max_reconnect_attempts,
        });
        tracing::error!(
            attempts = self.config.max_reconnect_attempts,
            "Reconnection limit reached, giving up"
        );
    }

    /// Disconnect without shutting the supervisor down. Auto-reconnect
    /// is suppressed until the next explicit [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::Relaxed);
        if let Some(wire) = self.wire.write().await.take() {
            wire.close().await;
        }
        {
            let mut counters = self.counters.lock().expect("health lock");
            counters.connected_since = None;
        }
        self.set_state(ConnectionState::Disconnected);
        self.record_history("disconnected", Some(String::from("disconnect requested")));
        let _ = self.events.send(SupervisorEvent::Disconnected {
            reason: String::from("disconnect requested"),
        });
    }

    /// Tear down for process shutdown: no further reconnects.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.disconnect().await;
    }

    /// Recent connection history, newest last.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .expect("history lock")
            .iter()
            .cloned()
            .collect()
    }

    /// The connection configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn record_history(&self, event: &str, detail: Option<String>) {
        let mut history = self.history.lock().expect("history lock");
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            detail,
        });
    }

    /// Send one frame through the current wire connection.
    pub async fn send_frame(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let guard = self.wire.read().await;
        let wire = guard
            .as_ref()
            .ok_or_else(|| QsysError::connection("Not connected to Q-SYS core"))?;
        wire.send_frame_with_timeout(method, params, timeout).await
    }

    /// Subscribe to unsolicited pushes from the current wire.
    ///
    /// Returns `None` while disconnected.
    pub async fn subscribe_wire(&self) -> Option<broadcast::Receiver<WireEvent>> {
        self.wire.read().await.as_ref().map(|w| w.subscribe())
    }

    /// Subscribe to supervisor lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// The circuit breaker, for callers that gate work on it.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// `true` iff connected, breaker closed, and no failures since the
    /// last success.
    pub fn is_healthy(&self) -> bool {
        let counters = self.counters.lock().expect("health lock");
        self.state().is_connected()
            && self.breaker.state() == BreakerState::Closed
            && counters.consecutive_failures == 0
    }

    /// Breaker state shortcut.
    pub fn circuit_breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Full health snapshot.
    pub fn health_status(&self) -> HealthStatus {
        let counters = self.counters.lock().expect("health lock");
        let state = self.state();
        let breaker_state = self.breaker.state();
        HealthStatus {
            is_healthy: state.is_connected()
                && breaker_state == BreakerState::Closed
                && counters.consecutive_failures == 0,
            last_successful_connection: counters.last_successful_connection,
            consecutive_failures: counters.consecutive_failures,
            total_attempts: counters.total_attempts,
            total_successes: counters.total_successes,
            uptime_ms: counters
                .connected_since
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            state,
            circuit_breaker_state: breaker_state,
        }
    }

    /// Active probe: sends `NoOp` over the wire and folds the outcome
    /// into the health counters.
    pub async fn check_health(&self) -> HealthStatus {
        if self.state().is_connected() {
            let outcome = self
                .send_frame("NoOp", serde_json::Value::Null, Duration::from_secs(5))
                .await;
            match outcome {
                Ok(_) => self.breaker.record_success(),
                Err(e) => {
                    tracing::debug!(error = %e, "Health probe failed");
                    let mut counters = self.counters.lock().expect("health lock");
                    counters.consecutive_failures += 1;
                    drop(counters);
                    self.breaker.record_failure();
                }
            }
            self.emit_health_change();
        }
        self.health_status()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn emit_health_change(&self) {
        let healthy = self.is_healthy();
        let mut counters = self.counters.lock().expect("health lock");
        if counters.last_healthy != Some(healthy) {
            counters.last_healthy = Some(healthy);
            drop(counters);
            let _ = self.events.send(SupervisorEvent::HealthChanged { healthy });
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

/// `min(base × 2^(attempt-1), ceiling)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(RECONNECT_CEILING)
}
