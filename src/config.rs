//! Gateway configuration.
//!
//! Two surfaces: the connection configuration (host, credentials, TLS,
//! reconnect policy), normally loaded from a TOML file or built in code,
//! and the event-monitoring configuration, read from environment
//! variables so deployments can enable recording without touching the
//! config file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{QsysError, Result};

/// Connection configuration for the wire client and supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Core hostname or IP.
    pub host: String,

    /// TCP port (443 for secure, 80 for insecure cores).
    pub port: u16,

    /// Optional login user.
    pub username: Option<String>,

    /// Optional login PIN/password.
    pub password: Option<String>,

    /// Use TLS (`wss://`). Insecure only when explicitly disabled.
    pub secure: bool,

    /// Verify the core's certificate chain.
    pub reject_unauthorized: bool,

    /// Default change-group polling interval in seconds.
    pub polling_interval: f64,

    /// Base reconnect delay in milliseconds.
    pub reconnect_interval_ms: u64,

    /// Give up after this many reconnect attempts.
    pub max_reconnect_attempts: u32,

    /// Per-frame response deadline in milliseconds.
    pub connection_timeout_ms: u64,

    /// Reconnect automatically on disconnect.
    pub enable_auto_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            username: None,
            password: None,
            secure: true,
            reject_unauthorized: false,
            polling_interval: 0.35,
            reconnect_interval_ms: 5000,
            max_reconnect_attempts: 5,
            connection_timeout_ms: 10_000,
            enable_auto_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a core at the given host, defaults elsewhere.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// The WebSocket endpoint URL (`wss://host:port/qrc`).
    pub fn endpoint(&self) -> Result<url::Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let raw = format!("{}://{}:{}/qrc", scheme, self.host, self.port);
        url::Url::parse(&raw)
            .map_err(|e| QsysError::validation(format!("Invalid endpoint {raw}: {e}")))
    }

    /// Per-frame deadline as a [`Duration`].
    #[inline]
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Base reconnect delay as a [`Duration`].
    #[inline]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Successes required in half-open before closing.
    pub success_threshold: u32,

    /// How long the breaker stays open before probing.
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
        }
    }
}

/// Event-recorder configuration, sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Master switch (`EVENT_MONITORING_ENABLED`).
    pub enabled: bool,

    /// Directory for day-rotated databases (`EVENT_MONITORING_DB_PATH`).
    pub db_path: PathBuf,

    /// Retention horizon in days (`EVENT_MONITORING_RETENTION_DAYS`).
    pub retention_days: u32,

    /// Flush when this many events are buffered (`EVENT_MONITORING_BUFFER_SIZE`).
    pub buffer_size: usize,

    /// Flush interval in ms (`EVENT_MONITORING_FLUSH_INTERVAL`).
    pub flush_interval_ms: u64,

    /// Backup directory (`EVENT_BACKUP_PATH`).
    pub backup_path: PathBuf,

    /// Backups retained (`EVENT_MAX_BACKUPS`).
    pub max_backups: usize,

    /// Auto-backup interval in ms, 0 disables (`EVENT_BACKUP_INTERVAL`).
    pub backup_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: PathBuf::from("./data/events"),
            retention_days: 30,
            buffer_size: 1000,
            flush_interval_ms: 100,
            backup_path: PathBuf::from("./data/backups"),
            max_backups: 7,
            backup_interval_ms: 86_400_000,
        }
    }
}

impl MonitoringConfig {
    /// Read the configuration from process environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_parse("EVENT_MONITORING_ENABLED", defaults.enabled),
            db_path: std::env::var("EVENT_MONITORING_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            retention_days: env_parse("EVENT_MONITORING_RETENTION_DAYS", defaults.retention_days),
            buffer_size: env_parse("EVENT_MONITORING_BUFFER_SIZE", defaults.buffer_size),
            flush_interval_ms: env_parse("EVENT_MONITORING_FLUSH_INTERVAL", defaults.flush_interval_ms),
            backup_path: std::env::var("EVENT_BACKUP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_path),
            max_backups: env_parse("EVENT_MAX_BACKUPS", defaults.max_backups),
            backup_interval_ms: env_parse("EVENT_BACKUP_INTERVAL", defaults.backup_interval_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Core connection settings.
    pub connection: ConnectionConfig,

    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,

    /// Event-recorder settings (environment wins over file).
    pub monitoring: MonitoringConfig,

    /// Per-tool execution deadline in milliseconds.
    pub tool_timeout_ms: u64,
}

impl GatewayConfig {
    /// Load from a TOML string, then apply environment overrides for
    /// the monitoring section.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml_parse(text)?;
        if std::env::var("EVENT_MONITORING_ENABLED").is_ok() {
            config.monitoring = MonitoringConfig::from_env();
        }
        if config.tool_timeout_ms == 0 {
            config.tool_timeout_ms = 30_000;
        }
        Ok(config)
    }

    /// Configuration for a core at the given host, defaults elsewhere.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::for_host(host),
            tool_timeout_ms: 30_000,
            ..Default::default()
        }
    }

    /// Per-tool deadline as a [`Duration`] (default 30 s).
    pub fn tool_timeout(&self) -> Duration {
        if self.tool_timeout_ms == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(self.tool_timeout_ms)
        }
    }
}

#[cfg(feature = "cli")]
fn toml_parse(text: &str) -> Result<GatewayConfig> {
    toml::from_str(text).map_err(|e| QsysError::validation(format!("Invalid config: {e}")))
}

#[cfg(not(feature = "cli"))]
fn toml_parse(_text: &str) -> Result<GatewayConfig> {
    Err(QsysError::validation(
        "TOML config requires the `cli` feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_secure_by_default() {
        let config = ConnectionConfig::for_host("core.local");
        let url = config.endpoint().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/qrc");
    }

    #[test]
    fn test_endpoint_insecure_opt_in() {
        let config = ConnectionConfig {
            secure: false,
            port: 80,
            ..ConnectionConfig::for_host("core.local")
        };
        assert_eq!(config.endpoint().unwrap().scheme(), "ws");
    }

    #[test]
    fn test_monitoring_defaults() {
        let config = MonitoringConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.flush_interval_ms, 100);
        assert_eq!(config.max_backups, 7);
    }

    #[test]
    fn test_tool_timeout_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.tool_timeout(), Duration::from_secs(30));
    }
}
