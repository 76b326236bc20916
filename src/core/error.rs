//! Error types for the Q-SYS gateway.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, QsysError>;

/// Stable error category codes.
///
/// Callers branch on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Wire client not usable (not connected, handshake failed).
    QsysConnectionFailed,
    /// The core returned an error envelope for a command.
    QsysCommandFailed,
    /// Method not recognized by the command adapter.
    QsysUnknownCommand,
    /// Component not present in the discovery index.
    QsysInvalidComponent,
    /// Control not present in the discovery index.
    QsysInvalidControl,
    /// Input failed schema or per-control constraint validation.
    ValidationFailed,
    /// A request deadline elapsed before the core answered.
    NetworkTimeout,
    /// The socket dropped with requests outstanding.
    NetworkDropped,
    /// Dispatcher has no tool registered under the requested name.
    McpToolNotFound,
    /// Dispatcher rejected the tool parameters.
    McpInvalidParams,
    /// The circuit breaker refused the call.
    CircuitOpen,
    /// Internal invariant violation (bug).
    Internal,
}

impl ErrorCode {
    /// The wire-stable string form, e.g. `QSYS_CONNECTION_FAILED`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QsysConnectionFailed => "QSYS_CONNECTION_FAILED",
            Self::QsysCommandFailed => "QSYS_COMMAND_FAILED",
            Self::QsysUnknownCommand => "QSYS_UNKNOWN_COMMAND",
            Self::QsysInvalidComponent => "QSYS_INVALID_COMPONENT",
            Self::QsysInvalidControl => "QSYS_INVALID_CONTROL",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::NetworkDropped => "NETWORK_DROPPED",
            Self::McpToolNotFound => "MCP_TOOL_NOT_FOUND",
            Self::McpInvalidParams => "MCP_INVALID_PARAMS",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether a retry loop may re-attempt after this category.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QsysConnectionFailed | Self::NetworkTimeout | Self::NetworkDropped
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error severity, carried alongside the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected operational failure (validation, unknown control).
    Low,
    /// Degraded but recoverable (timeout, retry exhausted).
    #[default]
    Medium,
    /// Connection-level failure.
    High,
    /// Invariant violation.
    Critical,
}

/// The main error type for all gateway operations.
///
/// Every error carries a category code, a message, optional structured
/// context, a severity, a creation timestamp and a unique id, and
/// serializes to a JSON object with exactly those fields.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct QsysError {
    /// Stable category.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Structured context (component names, control paths, attempt counts).
    pub context: serde_json::Value,
    /// Severity classification.
    pub severity: Severity,
    /// When the error was created.
    pub timestamp: DateTime<Utc>,
    /// Unique id for log correlation.
    pub id: Uuid,
}

impl QsysError {
    /// Create an error with the given category and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: serde_json::Value::Null,
            severity: default_severity(code),
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
        }
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Override the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Whether a retry loop may re-attempt this error.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Serialize to the JSON error object surfaced to callers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "context": self.context,
            "severity": self.severity,
            "timestamp": self.timestamp.to_rfc3339(),
            "id": self.id,
        })
    }

    // === Constructors for the common categories ===

    /// Wire client not usable.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::QsysConnectionFailed, msg).with_severity(Severity::High)
    }

    /// The core answered with an error envelope.
    pub fn command(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::QsysCommandFailed, msg)
    }

    /// Method not recognized by the adapter.
    pub fn unknown_command(method: impl Into<String>) -> Self {
        let method = method.into();
        Self::new(
            ErrorCode::QsysUnknownCommand,
            format!("Unknown command: {method}"),
        )
        .with_context(serde_json::json!({ "method": method }))
    }

    /// Component missing from the index.
    pub fn invalid_component(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::QsysInvalidComponent,
            format!("Component not found: {name}"),
        )
        .with_context(serde_json::json!({ "component": name }))
    }

    /// Control missing from the index.
    pub fn invalid_control(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::QsysInvalidControl,
            format!("Control not found: {path}"),
        )
        .with_context(serde_json::json!({ "control": path }))
    }

    /// Input failed validation.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, msg).with_severity(Severity::Low)
    }

    /// A per-request deadline elapsed.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkTimeout, msg)
    }

    /// The socket dropped mid-flight.
    pub fn dropped(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkDropped, msg).with_severity(Severity::High)
    }

    /// No tool registered under the requested name.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::McpToolNotFound, format!("Unknown tool: {name}"))
            .with_context(serde_json::json!({ "tool": name }))
    }

    /// Tool parameters failed schema validation.
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::McpInvalidParams, msg).with_severity(Severity::Low)
    }

    /// The circuit breaker refused the call.
    pub fn circuit_open() -> Self {
        Self::new(ErrorCode::CircuitOpen, "Circuit breaker is open")
    }

    /// Internal error (bug).
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg).with_severity(Severity::Critical)
    }
}

fn default_severity(code: ErrorCode) -> Severity {
    match code {
        ErrorCode::ValidationFailed
        | ErrorCode::McpToolNotFound
        | ErrorCode::McpInvalidParams
        | ErrorCode::QsysUnknownCommand => Severity::Low,
        ErrorCode::QsysConnectionFailed | ErrorCode::NetworkDropped => Severity::High,
        ErrorCode::Internal => Severity::Critical,
        _ => Severity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(QsysError::connection("down").is_retryable());
        assert!(QsysError::timeout("slow").is_retryable());
        assert!(QsysError::dropped("gone").is_retryable());
        assert!(!QsysError::validation("bad").is_retryable());
        assert!(!QsysError::unknown_command("Nope.Nope").is_retryable());
        assert!(!QsysError::circuit_open().is_retryable());
    }

    #[test]
    fn test_json_shape() {
        let err = QsysError::invalid_control("Mixer.gain");
        let json = err.to_json();
        assert_eq!(json["code"], "QSYS_INVALID_CONTROL");
        assert_eq!(json["context"]["control"], "Mixer.gain");
        assert!(json["id"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_display_includes_code() {
        let err = QsysError::unknown_command("Core.Magic");
        let text = err.to_string();
        assert!(text.contains("QSYS_UNKNOWN_COMMAND"));
        assert!(text.contains("Core.Magic"));
    }
}
